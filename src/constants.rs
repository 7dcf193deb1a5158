use std::path::PathBuf;
#[cfg(not(debug_assertions))]
use std::path::Path;


#[cfg(debug_assertions)]
pub fn get_config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or(PathBuf::from("."))
        .join("debug")
        .join("config.toml")
}

#[cfg(not(debug_assertions))]
pub fn get_config_path() -> PathBuf {
    Path::new("/etc/hydra/config.toml").to_path_buf()
}

pub fn get_run_path() -> PathBuf {
    PathBuf::from("/run/hydra")
}

pub fn get_vm_config_path() -> PathBuf {
    PathBuf::from("/var/lib/hydra")
}

/// File extensions tried when a descriptor is named without one.
pub const DESCRIPTOR_EXTENSIONS: [&str; 4] = ["vm", "yaml", "yml", "json"];

pub const AGENT_CHANNEL: &str = "qga0";

pub const USB_CONTROLLER: &str = "xhci";

/// First PCI slot handed to network adapters.
pub const NIC_SLOT_BASE: u32 = 0x10;

pub const MAX_LEGACY_DRIVES: usize = 4;

pub const MAX_SATA_DRIVES: usize = 6;

/// Bytes of the emulator log kept as exit diagnostics.
pub const DIAGNOSTICS_TAIL: u64 = 4096;

pub const ICON_VM: &str = "computer";
pub const ICON_ERROR: &str = "dialog-error";
pub const ICON_USB: &str = "drive-removable-media-usb";

pub const CPU_HOST_FLAGS: [&str; 7] = [
    "+invtsc",
    "kvm_pv_eoi=on",
    "kvm_pv_unhalt=on",
    "hv_relaxed",
    "hv_vapic",
    "hv_spinlocks=0x1fff",
    "hv_time",
];
