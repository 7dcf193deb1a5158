pub mod builders;
pub mod config;
pub mod constants;
pub mod devices;
pub mod error;
pub mod interface;
pub mod manager;
pub mod message;
pub mod process;
pub mod resources;
pub mod security;
pub mod services;
pub mod vm;

pub use config::HydraConfig;
pub use error::Error;
pub use manager::Hydra;
pub use message::{Message, Notifier, Snapshot, VmState};
pub use vm::{Platform, Vm};

pub type Result<T> = std::result::Result<T, Error>;
