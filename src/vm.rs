use std::{
    collections::BTreeMap,
    fs::Permissions,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use nix::unistd::{Uid, chown, geteuid, getuid};
use qmp::{client::Client, types::InvokeCommand};
use serde_json::{Value, json};
use tokio::time::Instant;
use vm_types::Descriptor;

use crate::{
    builders::{CommandBuilder, Invocation, NetworkAdapter, Restricted, SocketPaths, normalize},
    config::HydraConfig,
    constants::{ICON_ERROR, ICON_USB, ICON_VM},
    devices::DeviceDirectory,
    error::Error,
    interface::HostNetwork,
    message::{Notifier, Snapshot, VmState},
    process::{ExitInfo, Launcher, Process, Spawn},
    resources::{Resources, UsbId},
};

/// Host collaborators shared by every VM.
#[derive(Clone)]
pub struct Platform {
    pub launcher: Arc<dyn Launcher>,
    pub network: Arc<dyn HostNetwork>,
    pub notifier: Arc<dyn Notifier>,
}

/// What a VM operation may touch outside the VM itself.
pub struct Env<'a> {
    pub config: &'a HydraConfig,
    pub platform: &'a Platform,
    pub resources: &'a mut Resources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSelector {
    Local(u32),
    Device(UsbId),
}

pub struct Vm {
    vmid: u32,
    path: PathBuf,
    descriptor: Descriptor,
    paths: SocketPaths,
    state: VmState,
    usb: BTreeMap<u32, UsbId>,
    adapters: Vec<NetworkAdapter>,
    process: Option<Box<dyn Process>>,
    /// Uid the display sockets are handed to.
    owner: Option<u32>,
    agent_seen: bool,
    wait_ticks: u32,
    deadline: Option<Instant>,
    diagnostics: Option<String>,
}

impl Vm {
    pub fn new<P: AsRef<Path>>(vmid: u32, path: P, descriptor: Descriptor, scratch: &Path) -> Self {
        Vm {
            vmid,
            path: path.as_ref().to_path_buf(),
            descriptor,
            paths: SocketPaths::new(scratch, vmid),
            state: VmState::Stopped,
            usb: BTreeMap::new(),
            adapters: Vec::new(),
            process: None,
            owner: None,
            agent_seen: false,
            wait_ticks: 0,
            deadline: None,
            diagnostics: None,
        }
    }

    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn paths(&self) -> &SocketPaths {
        &self.paths
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.id())
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }

    pub fn adapters(&self) -> &[NetworkAdapter] {
        &self.adapters
    }

    pub fn is_stopped(&self) -> bool {
        self.state == VmState::Stopped
    }

    pub fn stop_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn name(&self) -> String {
        self.descriptor.name().map(str::to_string).unwrap_or_else(|| format!("VM {}", self.vmid))
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            vmid: Some(self.vmid),
            pid: self.pid(),
            state: self.state,
            path: self.path.clone(),
            name: self.descriptor.name().map(str::to_string),
            usb: self.usb.clone(),
        }
    }

    fn management(&self, config: &HydraConfig) -> Client {
        Client::management(&self.paths.qmp, config.emulator.control_timeout())
    }

    fn agent(&self, config: &HydraConfig) -> Client {
        if !self.agent_seen {
            log::debug!("VM {}: guest agent not seen yet, trying anyway", self.vmid);
        }
        Client::agent(&self.paths.agent, config.emulator.control_timeout())
    }

    fn require(&self, wanted: VmState) -> Result<(), Error> {
        match self.state {
            state if state == wanted => Ok(()),
            VmState::Stopped | VmState::Done | VmState::Failed => Err(Error::VMNotRunning(self.vmid)),
            state => Err(Error::InvalidState(self.vmid, format!("is {:?}", state).to_lowercase())),
        }
    }

    fn require_idle(&self, wanted: VmState) -> Result<(), Error> {
        self.require(wanted)?;
        if self.stop_pending() {
            return Err(Error::InvalidState(self.vmid, "is shutting down".to_string()));
        }
        Ok(())
    }

    /// Validates and assembles the command line without committing anything.
    pub fn prepare(&mut self, config: &HydraConfig, caller: Option<u32>) -> Result<(Restricted, Invocation), Error> {
        let restricted = Restricted::validate(&self.descriptor, config, caller)?;
        let mut descriptor = self.descriptor.clone();
        descriptor.vmid = Some(self.vmid);
        normalize(&mut descriptor);
        let invocation = CommandBuilder::new(self.vmid, &descriptor, &restricted, &self.paths, &config.network.bridge).build()?;
        self.descriptor = descriptor;
        Ok((restricted, invocation))
    }

    /// `prepare` plus the hugepage reservation, the last step that can fail.
    pub fn build(&mut self, env: &mut Env<'_>, caller: Option<u32>) -> Result<(Restricted, Invocation), Error> {
        let (restricted, invocation) = self.prepare(env.config, caller)?;
        if restricted.hugepages.is_some() {
            env.resources.hugepages.reserve(self.vmid, restricted.memory)?;
        }
        Ok((restricted, invocation))
    }

    pub async fn start(&mut self, env: &mut Env<'_>, caller: Option<u32>) -> Result<Snapshot, Error> {
        match self.state {
            VmState::Running | VmState::Waiting => return Ok(self.snapshot()),
            VmState::Sleeping => return self.wake(),
            VmState::Stopped | VmState::Done | VmState::Failed => {},
        }

        let (restricted, invocation) = self.build(env, caller)?;
        if let Err(e) = self.launch(env, &restricted, invocation).await {
            log::error!("VM {}: start failed: {}", self.vmid, e);
            self.teardown_adapters(env).await;
            self.adapters.clear();
            env.resources.hugepages.release(self.vmid);
            self.state = VmState::Stopped;
            return Err(e);
        }
        Ok(self.snapshot())
    }

    async fn launch(&mut self, env: &mut Env<'_>, restricted: &Restricted, invocation: Invocation) -> Result<(), Error> {
        self.descriptor.save(&self.path)?;

        self.adapters = invocation.adapters;
        if let Err(e) = self.create_adapters(env, &restricted.user).await {
            log::warn!("VM {}: network setup failed ({}), retrying once", self.vmid, e);
            self.teardown_adapters(env).await;
            self.create_adapters(env, &restricted.user).await?;
        }

        self.remove_runtime_files();
        let spawn = Spawn::from_argv(&invocation.argv)?.log(&self.paths.log).pid_file(&self.paths.pid);
        self.process = Some(env.platform.launcher.spawn(&spawn).await?);

        let own = getuid().as_raw();
        self.owner = (restricted.uid != own).then_some(restricted.uid);
        self.wait_ticks = 0;
        self.agent_seen = false;
        self.diagnostics = None;
        self.deadline = None;
        self.state = VmState::Waiting;
        log::info!("VM {} spawned as pid {:?}", self.vmid, self.pid());

        if self.relax_sockets(env.config) {
            self.promote(env.platform.notifier.as_ref());
        }
        Ok(())
    }

    async fn create_adapters(&mut self, env: &Env<'_>, user: &str) -> Result<(), Error> {
        let network = env.platform.network.as_ref();
        for adapter in self.adapters.iter_mut() {
            if adapter.auto && network.link_exists(&adapter.device).await {
                log::debug!("VM {}: removing stale {}", self.vmid, adapter.device);
                network.delete_link(&adapter.device).await?;
            }
            if !network.link_exists(&adapter.device).await {
                network.create_tap(&adapter.device, user).await?;
                adapter.auto = true;
            }
            network.attach(&adapter.device, &adapter.bridge).await?;
        }
        Ok(())
    }

    async fn teardown_adapters(&self, env: &Env<'_>) {
        for adapter in self.adapters.iter().filter(|adapter| adapter.auto) {
            if let Err(e) = env.platform.network.delete_link(&adapter.device).await {
                log::warn!("VM {}: failed to delete {}: {}", self.vmid, adapter.device, e);
            }
        }
    }

    /// Hands the display sockets to their user once the emulator created them.
    fn relax_sockets(&self, config: &HydraConfig) -> bool {
        let mut sockets = vec![&self.paths.vnc];
        if self.descriptor.vm.spice {
            sockets.push(&self.paths.spice);
        }
        if !sockets.iter().all(|socket| socket.exists()) {
            return false;
        }
        for socket in sockets {
            if let Err(e) = std::fs::set_permissions(socket, Permissions::from_mode(0o660)) {
                log::warn!("VM {}: chmod {:?}: {}", self.vmid, socket, e);
                return false;
            }
            if let Some(uid) = self.owner.filter(|_| geteuid().is_root()) {
                if let Err(e) = chown(socket.as_path(), Some(Uid::from_raw(uid)), None) {
                    log::warn!("VM {}: chown {:?}: {}", self.vmid, socket, e);
                    return false;
                }
            }
        }
        log::debug!("VM {}: sockets ready under {:?}", self.vmid, config.paths.scratch);
        true
    }

    fn promote(&mut self, notifier: &dyn Notifier) {
        self.state = VmState::Running;
        notifier.notify("VM started", &self.name(), ICON_VM);
    }

    pub async fn stop(&mut self, env: &mut Env<'_>, force: bool, timeout: Duration, tap: bool) -> Result<Snapshot, Error> {
        if self.is_stopped() {
            return Ok(self.snapshot());
        }
        if tap {
            self.management(env.config).invoke(InvokeCommand::powerdown()).await?;
            return Ok(self.snapshot());
        }
        if !force {
            if self.stop_pending() {
                return Err(Error::InvalidState(self.vmid, "a graceful stop is already pending".to_string()));
            }
            if self.state == VmState::Sleeping {
                self.wake()?;
            }
            self.request_powerdown(env.config).await?;
            self.deadline = Some(Instant::now() + timeout);
            log::info!("VM {}: powering down, forced in {:?}", self.vmid, timeout);
            return Ok(self.snapshot());
        }

        self.force_stop(env).await;
        env.platform.notifier.notify("VM stopped", &self.name(), ICON_VM);
        Ok(self.snapshot())
    }

    async fn request_powerdown(&mut self, config: &HydraConfig) -> Result<(), Error> {
        // The agent chardev is always listening, so silence proves nothing.
        match self.agent(config).invoke_unacknowledged(InvokeCommand::guest_shutdown(false)).await {
            Ok(Some(_)) => {
                self.agent_seen = true;
                return Ok(());
            },
            Ok(None) if self.agent_seen => return Ok(()),
            Ok(None) => log::debug!("VM {}: agent shutdown unacknowledged, sending ACPI powerdown", self.vmid),
            Err(e) => log::debug!("VM {}: agent shutdown failed: {}", self.vmid, e),
        }
        self.management(config).invoke(InvokeCommand::powerdown()).await?;
        Ok(())
    }

    /// Terminates the emulator and releases everything the VM holds. Never fails;
    /// every step that goes wrong is logged and skipped.
    pub async fn force_stop(&mut self, env: &mut Env<'_>) {
        if let Some(process) = self.process.as_mut() {
            match process.terminate(true).await {
                Ok(Some(exit)) => log::info!("VM {} terminated: {}", self.vmid, exit),
                Ok(None) => log::error!("VM {}: process {:?} did not exit", self.vmid, process.id()),
                Err(e) => log::error!("VM {}: terminate failed: {}", self.vmid, e),
            }
        }
        self.cleanup(env).await;
    }

    async fn cleanup(&mut self, env: &mut Env<'_>) {
        if let Some(process) = self.process.as_ref() {
            if let Some(diagnostics) = process.diagnostics() {
                self.diagnostics = Some(diagnostics);
            }
        }

        self.teardown_adapters(env).await;
        self.adapters.clear();
        self.deadline = None;

        let client = self.management(env.config);
        for local in self.usb.keys() {
            if let Err(e) = client.invoke(InvokeCommand::device_del(&format!("usb{}", local))).await {
                log::debug!("VM {}: device_del usb{}: {}", self.vmid, local, e);
            }
        }
        self.usb.clear();
        env.resources.usb.release_all(self.vmid);

        self.remove_runtime_files();
        env.resources.hugepages.release(self.vmid);

        self.process = None;
        self.owner = None;
        self.wait_ticks = 0;
        self.agent_seen = false;
        self.state = VmState::Stopped;
    }

    fn remove_runtime_files(&self) {
        for file in self.paths.runtime() {
            match std::fs::remove_file(file) {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => log::warn!("VM {}: failed to remove {:?}: {}", self.vmid, file, e),
            }
        }
    }

    pub async fn restart(&mut self, env: &mut Env<'_>) -> Result<Snapshot, Error> {
        self.require_idle(VmState::Running)?;
        if self.agent(env.config).invoke_unacknowledged(InvokeCommand::guest_shutdown(true)).await?.is_some() {
            self.agent_seen = true;
        }
        Ok(self.snapshot())
    }

    pub async fn reset(&mut self, env: &mut Env<'_>) -> Result<Snapshot, Error> {
        self.require(VmState::Running)?;
        self.management(env.config).invoke(InvokeCommand::reset()).await?;
        Ok(self.snapshot())
    }

    pub fn sleep(&mut self) -> Result<Snapshot, Error> {
        self.require_idle(VmState::Running)?;
        if let Some(process) = self.process.as_mut() {
            process.suspend()?;
        }
        self.state = VmState::Sleeping;
        Ok(self.snapshot())
    }

    pub fn wake(&mut self) -> Result<Snapshot, Error> {
        self.require(VmState::Sleeping)?;
        if let Some(process) = self.process.as_mut() {
            process.resume()?;
        }
        self.state = VmState::Running;
        Ok(self.snapshot())
    }

    pub async fn hibernate(&mut self, env: &mut Env<'_>) -> Result<Snapshot, Error> {
        self.require_idle(VmState::Running)?;
        match self.agent(env.config).invoke_unacknowledged(InvokeCommand::guest_suspend_disk()).await? {
            Some(_) => self.agent_seen = true,
            None => log::info!("VM {}: suspend to disk unacknowledged, it may have worked", self.vmid),
        }
        Ok(self.snapshot())
    }

    pub async fn usb_attach(&mut self, env: &mut Env<'_>, id: UsbId) -> Result<u32, Error> {
        self.require(VmState::Running)?;
        let device = DeviceDirectory::new(&env.config.paths.usb, Vec::new())
            .find_usb(&id)?
            .ok_or_else(|| Error::Usb(format!("{} is not connected", id)))?;
        if let Some(owner) = env.resources.usb.owner(&id) {
            return Err(Error::Usb(format!("{} is already attached to VM {}", id, owner)));
        }

        let local = self.usb.keys().next_back().map_or(0, |last| last + 1);
        self.management(env.config)
            .invoke(InvokeCommand::usb_host_add(&format!("usb{}", local), id.vendor, id.product))
            .await?;
        env.resources.usb.claim(id, self.vmid)?;
        self.usb.insert(local, id);
        env.platform
            .notifier
            .notify("USB device connected", &format!("{} to {}", device.name, self.name()), ICON_USB);
        Ok(local)
    }

    pub async fn usb_detach(&mut self, env: &mut Env<'_>, selector: UsbSelector) -> Result<UsbId, Error> {
        self.require(VmState::Running)?;
        let (local, id) = match selector {
            UsbSelector::Local(local) => self.usb.get(&local).map(|id| (local, *id)),
            UsbSelector::Device(id) => self.usb.iter().find(|(_, attached)| **attached == id).map(|(local, id)| (*local, *id)),
        }
        .ok_or_else(|| Error::Usb(format!("no such device on VM {}", self.vmid)))?;

        self.management(env.config)
            .invoke(InvokeCommand::device_del(&format!("usb{}", local)))
            .await?;
        self.usb.remove(&local);
        env.resources.usb.release(&id, self.vmid);
        env.platform
            .notifier
            .notify("USB device disconnected", &format!("{} from {}", id, self.name()), ICON_USB);
        Ok(id)
    }

    pub async fn ping(&mut self, config: &HydraConfig) -> Value {
        let ok = self.state == VmState::Running && self.agent(config).invoke(InvokeCommand::guest_ping()).await.is_ok();
        if ok {
            self.agent_seen = true;
        }
        json!({ "vmid": self.vmid, "ping": ok, "failed": !ok })
    }

    pub async fn ip(&mut self, config: &HydraConfig) -> Value {
        if self.state != VmState::Running {
            return json!({ "vmid": self.vmid, "ip": [], "failed": true });
        }
        match self.agent(config).invoke(InvokeCommand::guest_interfaces()).await {
            Ok(interfaces) => {
                self.agent_seen = true;
                json!({ "vmid": self.vmid, "ip": guest_addresses(&interfaces), "failed": false })
            },
            Err(e) => {
                log::debug!("VM {}: interface query failed: {}", self.vmid, e);
                json!({ "vmid": self.vmid, "ip": [], "failed": true })
            },
        }
    }

    /// One scheduler tick: exit detection, stop deadline, readiness.
    pub async fn poll(&mut self, env: &mut Env<'_>) {
        if self.is_stopped() {
            return;
        }

        let exited = match self.process.as_mut().map(|process| process.try_wait()) {
            Some(Ok(exit)) => exit,
            Some(Err(e)) => {
                log::warn!("VM {}: wait failed: {}", self.vmid, e);
                None
            },
            None => Some(ExitInfo { code: None, signal: None }),
        };
        if let Some(exit) = exited {
            self.reap(env, exit).await;
            return;
        }

        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::warn!("VM {}: graceful stop timed out, forcing", self.vmid);
            self.force_stop(env).await;
            env.platform.notifier.notify("VM stopped", &self.name(), ICON_VM);
            return;
        }

        if self.state == VmState::Waiting {
            self.wait_ticks += 1;
            if self.relax_sockets(env.config) {
                self.promote(env.platform.notifier.as_ref());
            } else if self.wait_ticks > env.config.emulator.wait_budget {
                log::error!("VM {}: sockets not ready after {} ticks", self.vmid, self.wait_ticks);
                self.force_stop(env).await;
                let body = self.failure_body("did not become ready");
                env.platform.notifier.notify("VM failed", &body, ICON_ERROR);
            }
        }
    }

    async fn reap(&mut self, env: &mut Env<'_>, exit: ExitInfo) {
        self.state = if exit.success() { VmState::Done } else { VmState::Failed };
        if let Some(process) = self.process.as_ref() {
            self.diagnostics = process.diagnostics();
        }
        if exit.success() {
            log::info!("VM {} exited", self.vmid);
            env.platform.notifier.notify("VM stopped", &self.name(), ICON_VM);
        } else {
            log::error!("VM {} died with {}: {}", self.vmid, exit, self.diagnostics.as_deref().unwrap_or("no output"));
            let body = self.failure_body(&exit.to_string());
            env.platform.notifier.notify("VM failed", &body, ICON_ERROR);
        }
        self.cleanup(env).await;
    }

    fn failure_body(&self, reason: &str) -> String {
        match self.diagnostics.as_deref().and_then(|text| text.lines().last()) {
            Some(last) => format!("{}: {}\n{}", self.name(), reason, last),
            None => format!("{}: {}", self.name(), reason),
        }
    }
}

/// IPv4 addresses from a `guest-network-get-interfaces` reply, loopback excluded.
fn guest_addresses(interfaces: &Value) -> Vec<String> {
    interfaces
        .as_array()
        .into_iter()
        .flatten()
        .filter(|interface| interface["name"] != "lo")
        .flat_map(|interface| interface["ip-addresses"].as_array().cloned().unwrap_or_default())
        .filter(|address| address["ip-address-type"] == "ipv4")
        .filter_map(|address| address["ip-address"].as_str().map(str::to_string))
        .filter(|address| !address.starts_with("127."))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_addresses_skip_loopback() {
        let reply = json!([
            { "name": "lo", "ip-addresses": [{ "ip-address": "127.0.0.1", "ip-address-type": "ipv4" }] },
            { "name": "eth0", "ip-addresses": [
                { "ip-address": "10.1.0.23", "ip-address-type": "ipv4" },
                { "ip-address": "fe80::1", "ip-address-type": "ipv6" }
            ] },
            { "name": "eth1" }
        ]);
        assert_eq!(guest_addresses(&reply), vec!["10.1.0.23"]);
        assert!(guest_addresses(&json!({})).is_empty());
    }

    #[test]
    fn stopped_vm_rejects_control() {
        let mut vm = Vm::new(4, "/tmp/a.yaml", Descriptor::default(), Path::new("/tmp"));
        assert!(matches!(vm.sleep(), Err(Error::VMNotRunning(4))));
        assert!(matches!(vm.wake(), Err(Error::VMNotRunning(4))));
        assert_eq!(vm.snapshot().state, VmState::Stopped);
        assert_eq!(vm.name(), "VM 4");
    }
}
