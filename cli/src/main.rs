use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use hydra::{Hydra, HydraConfig, Message, VmState, constants::get_config_path};
use serde_json::json;


#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Manager configuration (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a VM and supervise it until it exits.
    Run {
        target: String,
        /// Seconds a graceful stop may take after Ctrl-C.
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Run the emulator as this uid.
        #[arg(short, long)]
        user: Option<u32>,
    },
    /// Print the emulator command line without starting anything.
    Build {
        target: String,
        #[arg(short, long)]
        user: Option<u32>,
    },
    /// List host USB devices.
    Usb,
    /// Print the descriptor a target refers to.
    Resolve {
        target: String,
    },
}

fn load_config(path: Option<PathBuf>) -> HydraConfig {
    let path = path.unwrap_or_else(get_config_path);
    if !path.exists() {
        log::info!("No configuration at {:?}, using defaults", path);
        return HydraConfig::default();
    }
    HydraConfig::load(&path).expect("Error loading configuration")
}

async fn run(config: HydraConfig, target: String, timeout: Option<u64>, user: Option<u32>) {
    let mut hydra = Hydra::with_host(config);
    let reply = hydra
        .request(Message::request(json!({ "action": "start", "path": target, "user": user })))
        .await;
    if let Some(error) = reply.payload.get("error") {
        eprintln!("Error starting VM: {}", error.as_str().unwrap_or_default());
        hydra.shutdown().await;
        std::process::exit(1);
    }
    let Some(vmid) = reply.payload.get("vms").and_then(|vms| vms[0]["vmid"].as_u64()) else {
        eprintln!("Unexpected reply: {}", serde_json::Value::Object(reply.payload));
        hydra.shutdown().await;
        std::process::exit(1);
    };
    let vmid = vmid as u32;

    let mut last = None;
    let mut interrupts = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => hydra.tick().await,
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                let force = interrupts > 1;
                println!("{}", if force { "Killing VM" } else { "Asking the guest to shut down" });
                let stop = json!({ "action": "stop", "vmid": vmid, "force": force, "timeout": timeout });
                let reply = hydra.request(Message::request(stop)).await;
                if let Some(error) = reply.payload.get("error") {
                    eprintln!("Error stopping VM: {}", error.as_str().unwrap_or_default());
                }
            },
        }

        let state = hydra.vm(vmid).map(|vm| vm.state());
        if state != last {
            println!("VM {}: {}", vmid, format!("{:?}", state.unwrap_or(VmState::Stopped)).to_lowercase());
            last = state;
        }
        if state.is_none() {
            break;
        }
    }
    hydra.shutdown().await;
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(args.config);
    match args.cmd {
        Commands::Run { target, timeout, user } => run(config, target, timeout, user).await,
        Commands::Build { target, user } => {
            let hydra = Hydra::with_host(config);
            match hydra.command_line(&target, user) {
                Ok(argv) => println!("{}", argv.join(" ")),
                Err(e) => {
                    eprintln!("Error building {}: {}", target, e);
                    std::process::exit(1);
                },
            }
        },
        Commands::Usb => {
            let hydra = Hydra::with_host(config);
            let devices = hydra.usb_devices().expect("Error listing USB devices");
            for device in devices {
                println!("{}  {}  {}", device.id, device.path.display(), device.name);
            }
        },
        Commands::Resolve { target } => {
            let hydra = Hydra::with_host(config);
            match hydra.resolve(&target) {
                Ok(path) => println!("{}", path.display()),
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                },
            }
        },
    }
}
