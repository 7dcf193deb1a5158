use std::{
    fs::Permissions,
    net::Ipv4Addr,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use ipnetwork::Ipv4Network;

use crate::{
    config::{HydraConfig, Sharing},
    error::Error,
    process::{Process, Spawn},
    vm::Platform,
};

/// Bridge, forwarding, NAT and helper daemons shared by all VMs.
#[derive(Default)]
pub struct Services {
    running: Option<Running>,
}

#[derive(Default)]
struct Running {
    bridge_created: bool,
    /// Value of the forwarding knob before we touched it.
    forwarding: Option<String>,
    nat: bool,
    dhcp: Option<Box<dyn Process>>,
    sharing: Option<Box<dyn Process>>,
}

/// First and last lease address, skipping the network, gateway and broadcast addresses.
pub fn dhcp_range(address: Ipv4Network) -> Result<(Ipv4Addr, Ipv4Addr), Error> {
    if address.prefix() > 30 {
        return Err(Error::Invalid(format!("{} is too small for DHCP", address)));
    }
    let network = u32::from(address.network());
    let broadcast = u32::from(address.broadcast());
    let gateway = u32::from(address.ip());
    let first = if gateway == network + 1 { network + 2 } else { network + 1 };
    let last = if gateway == broadcast - 1 { broadcast - 2 } else { broadcast - 1 };
    if first > last {
        return Err(Error::Invalid(format!("{} leaves no addresses for DHCP", address)));
    }
    Ok((Ipv4Addr::from(first), Ipv4Addr::from(last)))
}

fn dnsmasq(binary: &Path, config: &HydraConfig) -> Result<Spawn, Error> {
    let scratch = &config.paths.scratch;
    let network = &config.network;
    let (first, last) = dhcp_range(network.address)?;
    Ok(Spawn {
        program: binary.to_string_lossy().to_string(),
        args: vec![
            "--keep-in-foreground".to_string(),
            "--conf-file=/dev/null".to_string(),
            "--bind-interfaces".to_string(),
            format!("--interface={}", network.bridge),
            "--except-interface=lo".to_string(),
            format!("--listen-address={}", network.address.ip()),
            format!("--dhcp-range={},{},{},12h", first, last, network.address.mask()),
            format!("--dhcp-leasefile={}", scratch.join("dnsmasq.leases").display()),
            format!("--pid-file={}", scratch.join("dnsmasq.pid").display()),
        ],
        log: Some(scratch.join("dnsmasq.log")),
        pid_file: None,
    })
}

pub fn smb_conf(sharing: &Sharing, bridge: &str, scratch: &Path) -> String {
    let dir = scratch.display();
    format!(
        "[global]\n\
         \tinterfaces = {bridge}\n\
         \tbind interfaces only = yes\n\
         \tsmb ports = 445\n\
         \tpid directory = {dir}\n\
         \tlock directory = {dir}\n\
         \tstate directory = {dir}\n\
         \tcache directory = {dir}\n\
         \tprivate dir = {dir}\n\
         \tlog file = {dir}/smbd.log\n\
         \tmap to guest = Bad User\n\
         \tload printers = no\n\
         \n\
         [{name}]\n\
         \tpath = {path}\n\
         \tread only = no\n\
         \tguest ok = yes\n",
        bridge = bridge,
        dir = dir,
        name = sharing.name,
        path = sharing.path.display(),
    )
}

fn smbd(sharing: &Sharing, config: &HydraConfig) -> Result<Spawn, Error> {
    let scratch = &config.paths.scratch;
    let conf = scratch.join("smb.conf");
    std::fs::write(&conf, smb_conf(sharing, &config.network.bridge, scratch))?;
    Ok(Spawn {
        program: sharing.binary.to_string_lossy().to_string(),
        args: vec![
            "--foreground".to_string(),
            "--no-process-group".to_string(),
            format!("--configfile={}", conf.display()),
        ],
        log: Some(scratch.join("smbd.out")),
        pid_file: None,
    })
}

async fn stop_helper(name: &str, mut process: Box<dyn Process>) {
    match process.terminate(false).await {
        Ok(Some(_)) => return,
        Ok(None) => log::warn!("{} ignored SIGTERM", name),
        Err(e) => log::warn!("Stopping {}: {}", name, e),
    }
    if let Err(e) = process.terminate(true).await {
        log::warn!("Killing {}: {}", name, e);
    }
}

impl Services {
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn start(&mut self, config: &HydraConfig, platform: &Platform) -> Result<(), Error> {
        if self.running.is_some() {
            return Ok(());
        }
        let mut running = Running::default();
        match Self::bring_up(&mut running, config, platform).await {
            Ok(()) => {
                log::info!("Shared services up on {}", config.network.bridge);
                self.running = Some(running);
                Ok(())
            },
            Err(e) => {
                log::error!("Shared services failed to start: {}", e);
                Self::tear_down(running, config, platform).await;
                Err(e)
            },
        }
    }

    async fn bring_up(running: &mut Running, config: &HydraConfig, platform: &Platform) -> Result<(), Error> {
        let scratch = &config.paths.scratch;
        std::fs::create_dir_all(scratch)?;
        std::fs::set_permissions(scratch, Permissions::from_mode(0o755))?;

        let network = &config.network;
        running.bridge_created = !platform.network.link_exists(&network.bridge).await;
        platform.network.create_bridge(&network.bridge, network.address).await?;

        let previous = std::fs::read_to_string(&network.forwarding)?;
        std::fs::write(&network.forwarding, "1\n")?;
        running.forwarding = Some(previous.trim().to_string());

        if network.nat {
            // Leftovers from an unclean shutdown would duplicate the rule.
            if let Err(e) = platform.network.disable_nat().await {
                log::debug!("No stale NAT table to remove: {}", e);
            }
            platform.network.enable_nat(network.address).await?;
            running.nat = true;
        }

        if let Some(binary) = &network.dhcp {
            running.dhcp = Some(platform.launcher.spawn(&dnsmasq(binary, config)?).await?);
        }
        if let Some(sharing) = &config.sharing {
            running.sharing = Some(platform.launcher.spawn(&smbd(sharing, config)?).await?);
        }
        Ok(())
    }

    async fn tear_down(running: Running, config: &HydraConfig, platform: &Platform) {
        if let Some(process) = running.sharing {
            stop_helper("smbd", process).await;
        }
        if let Some(process) = running.dhcp {
            stop_helper("dnsmasq", process).await;
        }
        if running.nat {
            if let Err(e) = platform.network.disable_nat().await {
                log::warn!("Removing NAT table: {}", e);
            }
        }
        if let Some(previous) = running.forwarding {
            if let Err(e) = std::fs::write(&config.network.forwarding, format!("{}\n", previous)) {
                log::warn!("Restoring ip_forward: {}", e);
            }
        }
        if running.bridge_created {
            if let Err(e) = platform.network.delete_link(&config.network.bridge).await {
                log::warn!("Deleting {}: {}", config.network.bridge, e);
            }
        }
    }

    pub async fn stop(&mut self, config: &HydraConfig, platform: &Platform) {
        if let Some(running) = self.running.take() {
            Self::tear_down(running, config, platform).await;
            log::info!("Shared services stopped");
        }
    }

    /// Drops helpers that exited on their own.
    pub fn poll(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        for (name, slot) in [("dnsmasq", &mut running.dhcp), ("smbd", &mut running.sharing)] {
            let exited = match slot.as_mut().map(|process| process.try_wait()) {
                Some(Ok(Some(exit))) => Some(exit.to_string()),
                Some(Err(e)) => Some(e.to_string()),
                _ => None,
            };
            if let Some(reason) = exited {
                log::warn!("{} exited: {}", name, reason);
                *slot = None;
            }
        }
    }
}
