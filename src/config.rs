use std::{net::Ipv4Addr, path::{Path, PathBuf}, time::Duration};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::{constants::{get_run_path, get_vm_config_path}, error::{ConfigError, Error}};


#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HydraConfig {
    pub paths: Paths,
    pub emulator: Emulator,
    pub network: Network,
    pub sharing: Option<Sharing>,
    pub hugepages: Hugepages,
    pub trust: Trust,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Paths {
    pub scratch: PathBuf,
    pub descriptors: Vec<PathBuf>,
    pub usb: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            scratch: get_run_path(),
            descriptors: vec![get_vm_config_path()],
            usb: PathBuf::from("/sys/bus/usb/devices"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Emulator {
    pub binary: PathBuf,
    /// Ticks a spawned VM may spend without usable sockets.
    pub wait_budget: u32,
    /// Seconds between escalation signals.
    pub grace: u64,
    pub control_timeout_ms: u64,
    /// Default graceful stop timeout, seconds.
    pub stop_timeout: u64,
}

impl Default for Emulator {
    fn default() -> Self {
        Emulator {
            binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            wait_budget: 10,
            grace: 2,
            control_timeout_ms: 1500,
            stop_timeout: 90,
        }
    }
}

impl Emulator {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Network {
    pub bridge: String,
    /// Gateway address and prefix of the VM network, e.g. `10.1.0.1/24`.
    pub address: Ipv4Network,
    pub forwarding: PathBuf,
    pub dhcp: Option<PathBuf>,
    pub nat: bool,
    pub nft: PathBuf,
    pub ip: PathBuf,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            bridge: "hydra0".to_string(),
            address: Ipv4Network::new(Ipv4Addr::new(10, 1, 0, 1), 24)
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(10, 1, 0, 1))),
            forwarding: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
            dhcp: Some(PathBuf::from("/usr/bin/dnsmasq")),
            nat: true,
            nft: PathBuf::from("/usr/sbin/nft"),
            ip: PathBuf::from("/usr/bin/ip"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sharing {
    pub binary: PathBuf,
    pub path: PathBuf,
    #[serde(default = "default_share_name")]
    pub name: String,
}

fn default_share_name() -> String {
    "hydra".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Hugepages {
    pub knob: PathBuf,
    pub mount: PathBuf,
    pub page_size_kb: u64,
}

impl Default for Hugepages {
    fn default() -> Self {
        Hugepages {
            knob: PathBuf::from("/proc/sys/vm/nr_hugepages"),
            mount: PathBuf::from("/dev/hugepages"),
            page_size_kb: 2048,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Trust {
    pub uid: u32,
    pub gid: u32,
    pub device_gid: u32,
}

impl HydraConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config_str = std::fs::read_to_string(path).map_err(ConfigError::from)?;
        let config: HydraConfig = toml::from_str(&config_str).map_err(ConfigError::from)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: HydraConfig = toml::from_str(
            r#"
            [paths]
            scratch = "/tmp/hydra"

            [network]
            address = "192.168.77.1/24"
            dhcp = "/usr/sbin/dnsmasq"

            [sharing]
            binary = "/usr/sbin/smbd"
            path = "/srv/share"
            "#,
        )
        .unwrap();
        assert_eq!(config.paths.scratch, PathBuf::from("/tmp/hydra"));
        assert_eq!(config.paths.usb, PathBuf::from("/sys/bus/usb/devices"));
        assert_eq!(config.network.address.ip().octets(), [192, 168, 77, 1]);
        assert_eq!(config.network.address.prefix(), 24);
        assert_eq!(config.network.bridge, "hydra0");
        assert_eq!(config.emulator.wait_budget, 10);
        assert_eq!(config.sharing.unwrap().name, "hydra");
    }
}
