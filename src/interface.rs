use std::{net::IpAddr, path::PathBuf};

use futures_util::TryStreamExt;
use ipnetwork::Ipv4Network;
use nft::{Nft, builders::{Family, Hook}};
use rtnetlink::{Handle, LinkBridge, LinkUnspec, new_connection, packet_route::link::LinkMessage};
use tokio::process::Command;

use crate::error::Error;

pub const NAT_TABLE: &str = "hydra";

#[async_trait::async_trait]
pub trait HostNetwork: Send + Sync {
    async fn link_exists(&self, name: &str) -> bool;

    /// Creates the bridge, assigns `address` and brings it up.
    async fn create_bridge(&self, name: &str, address: Ipv4Network) -> Result<(), Error>;

    async fn create_tap(&self, name: &str, user: &str) -> Result<(), Error>;

    /// Enslaves `name` to `bridge` and brings it up.
    async fn attach(&self, name: &str, bridge: &str) -> Result<(), Error>;

    async fn delete_link(&self, name: &str) -> Result<(), Error>;

    async fn enable_nat(&self, network: Ipv4Network) -> Result<(), Error>;

    async fn disable_nat(&self) -> Result<(), Error>;
}

fn connect() -> Result<Handle, Error> {
    let (connection, handle, _) = new_connection().map_err(|e| Error::Network(format!("netlink: {}", e)))?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn get_interface(handle: &Handle, interface: &str) -> Result<Option<LinkMessage>, rtnetlink::Error> {
    let mut links = handle.link().get().match_name(interface.to_string()).execute();

    links.try_next().await
}

async fn index_of(handle: &Handle, interface: &str) -> Result<u32, Error> {
    match get_interface(handle, interface).await? {
        Some(link) => Ok(link.header.index),
        None => Err(Error::Network(format!("no such interface {}", interface))),
    }
}

async fn run(argv: Vec<String>) -> Result<(), Error> {
    let (program, args) = argv.split_first().ok_or_else(|| Error::Network("empty command".to_string()))?;
    log::debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Network(format!("{}: {}", program, e)))?;
    if !output.status.success() {
        return Err(Error::Network(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Bridge and tap plumbing over rtnetlink, with `ip` for taps and `nft` for NAT.
#[derive(Debug, Clone)]
pub struct NetlinkNetwork {
    ip: PathBuf,
    nft: PathBuf,
}

impl NetlinkNetwork {
    pub fn new(ip: PathBuf, nft: PathBuf) -> Self {
        NetlinkNetwork { ip, nft }
    }

    fn nft(&self) -> Nft {
        Nft::new(&self.nft)
    }
}

#[async_trait::async_trait]
impl HostNetwork for NetlinkNetwork {
    async fn link_exists(&self, name: &str) -> bool {
        let Ok(handle) = connect() else {
            return false;
        };
        matches!(get_interface(&handle, name).await, Ok(Some(_)))
    }

    async fn create_bridge(&self, name: &str, address: Ipv4Network) -> Result<(), Error> {
        let handle = connect()?;
        if get_interface(&handle, name).await.ok().flatten().is_none() {
            handle.link().add(LinkBridge::new(name).build()).execute().await?;
        }
        let index = index_of(&handle, name).await?;
        if let Err(e) = handle.address().add(index, IpAddr::V4(address.ip()), address.prefix()).execute().await {
            // EEXIST after an unclean shutdown
            log::warn!("Assigning {} to {}: {}", address, name, e);
        }
        handle.link().set(LinkUnspec::new_with_index(index).up().build()).execute().await?;
        Ok(())
    }

    async fn create_tap(&self, name: &str, user: &str) -> Result<(), Error> {
        let ip = self.ip.to_string_lossy().to_string();
        run(vec![ip, "tuntap".into(), "add".into(), "dev".into(), name.into(), "mode".into(), "tap".into(), "user".into(), user.into()]).await
    }

    async fn attach(&self, name: &str, bridge: &str) -> Result<(), Error> {
        let handle = connect()?;
        let interface_id = index_of(&handle, name).await?;
        let master_id = index_of(&handle, bridge).await?;

        handle.link().set(LinkUnspec::new_with_index(interface_id).controller(master_id).build()).execute().await?;
        handle.link().set(LinkUnspec::new_with_index(interface_id).up().build()).execute().await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), Error> {
        let handle = connect()?;
        let index = index_of(&handle, name).await?;
        handle.link().del(index).execute().await?;
        Ok(())
    }

    async fn enable_nat(&self, network: Ipv4Network) -> Result<(), Error> {
        let block = format!("{}/{}", network.network(), network.prefix());
        run(self.nft().add().table(Family::Inet, NAT_TABLE).build()).await?;
        run(self.nft()
            .add()
            .chain(Family::Inet, NAT_TABLE, "postrouting", "nat", Hook::Postrouting, 100)
            .build())
        .await?;
        run(self.nft()
            .add()
            .rule(Family::Inet, NAT_TABLE, "postrouting", &["ip", "saddr", &block, "masquerade"])
            .build())
        .await
    }

    async fn disable_nat(&self) -> Result<(), Error> {
        run(self.nft().delete().table(Family::Inet, NAT_TABLE).build()).await
    }
}
