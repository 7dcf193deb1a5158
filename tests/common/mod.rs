#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    fs::Permissions,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
};

use hydra::{
    Hydra, HydraConfig, Message, Notifier,
    error::Error,
    interface::HostNetwork,
    process::{ExitInfo, Launcher, Process, Spawn},
    vm::Platform,
};
use ipnetwork::Ipv4Network;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixListener,
    task::JoinHandle,
};

const GREETING: &str = "{\"QMP\":{\"version\":{\"qemu\":{\"major\":9}},\"capabilities\":[]}}\r\n";

/// Answers every command with an empty return, except the `silent` ones.
/// A `mute` server reads commands and never answers, like an agent chardev with no agent behind it.
fn serve(path: &Path, greet: bool, mute: bool, silent: &'static [&'static str], log: Arc<Mutex<Vec<Value>>>) -> JoinHandle<()> {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                if greet && write.write_all(GREETING.as_bytes()).await.is_err() {
                    return;
                }
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(command) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    let name = command["execute"].as_str().unwrap_or_default().to_string();
                    log.lock().unwrap().push(command);
                    if mute || silent.contains(&name.as_str()) {
                        continue;
                    }
                    let reply = match name.as_str() {
                        "guest-network-get-interfaces" => json!({ "return": [
                            { "name": "eth0", "ip-addresses": [{ "ip-address": "10.1.0.50", "ip-address-type": "ipv4" }] }
                        ] }),
                        _ => json!({ "return": {} }),
                    };
                    if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    })
}

fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().position(|arg| arg == flag).and_then(|i| args.get(i + 1)).map(String::as_str)
}

#[derive(Debug, Default)]
pub struct ProcessState {
    pub exit: Option<ExitInfo>,
    pub signals: Vec<&'static str>,
}

pub struct FakeProcess {
    pid: u32,
    state: Arc<Mutex<ProcessState>>,
    servers: Vec<JoinHandle<()>>,
}

impl FakeProcess {
    fn die(&mut self, exit: ExitInfo) -> ExitInfo {
        for server in &self.servers {
            server.abort();
        }
        let mut state = self.state.lock().unwrap();
        *state.exit.get_or_insert(exit)
    }
}

#[async_trait::async_trait]
impl Process for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>, Error> {
        let exit = self.state.lock().unwrap().exit;
        if let Some(exit) = exit {
            self.die(exit);
        }
        Ok(exit)
    }

    fn suspend(&mut self) -> Result<(), Error> {
        self.state.lock().unwrap().signals.push("SIGSTOP");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), Error> {
        self.state.lock().unwrap().signals.push("SIGCONT");
        Ok(())
    }

    async fn terminate(&mut self, escalate: bool) -> Result<Option<ExitInfo>, Error> {
        self.state.lock().unwrap().signals.push(if escalate { "ladder" } else { "SIGTERM" });
        Ok(Some(self.die(ExitInfo { code: None, signal: Some(9) })))
    }

    fn diagnostics(&self) -> Option<String> {
        Some("qemu: terminating on signal".to_string())
    }
}

/// Pretends to be the emulator: records the command line and serves its sockets.
#[derive(Default)]
pub struct FakeLauncher {
    pub spawns: Mutex<Vec<Spawn>>,
    pub processes: Mutex<Vec<Arc<Mutex<ProcessState>>>>,
    pub commands: Arc<Mutex<Vec<Value>>>,
    /// Create the VNC socket right away.
    pub ready: AtomicBool,
    /// A guest agent answers on the agent socket. Without one the socket is still bound.
    pub agent: AtomicBool,
    pub fail: AtomicBool,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn exit(&self, index: usize, code: i32) {
        self.processes.lock().unwrap()[index].lock().unwrap().exit = Some(ExitInfo { code: Some(code), signal: None });
    }

    pub fn signals(&self, index: usize) -> Vec<&'static str> {
        self.processes.lock().unwrap()[index].lock().unwrap().signals.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.requests().iter().map(|command| command["execute"].as_str().unwrap_or_default().to_string()).collect()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Launcher for FakeLauncher {
    async fn spawn(&self, spawn: &Spawn) -> Result<Box<dyn Process>, Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Process(format!("failed to spawn {}", spawn.program)));
        }
        self.spawns.lock().unwrap().push(spawn.clone());

        let mut servers = Vec::new();
        if let Some(qmp) = value_after(&spawn.args, "-qmp") {
            let path = qmp.trim_start_matches("unix:").split(",server").next().unwrap();
            servers.push(serve(Path::new(path), true, false, &[], self.commands.clone()));
        }
        if let Some(chardev) = spawn.args.iter().find(|arg| arg.starts_with("socket,id=qga0,")) {
            let path = chardev.split(',').find_map(|part| part.strip_prefix("path=")).unwrap();
            let mute = !self.agent.load(Ordering::SeqCst);
            servers.push(serve(Path::new(path), false, mute, &["guest-shutdown", "guest-suspend-disk"], self.commands.clone()));
        }
        if self.ready.load(Ordering::SeqCst) {
            if let Some(vnc) = value_after(&spawn.args, "-vnc") {
                std::fs::write(vnc.trim_start_matches("unix:"), "").unwrap();
            }
        }

        let state = Arc::new(Mutex::new(ProcessState::default()));
        self.processes.lock().unwrap().push(state.clone());
        let pid = 4000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess { pid, state, servers }))
    }
}

#[derive(Default)]
pub struct FakeNetwork {
    pub links: Mutex<BTreeSet<String>>,
    pub calls: Mutex<Vec<String>>,
    /// Number of upcoming `create_tap` calls that fail.
    pub tap_failures: AtomicUsize,
    pub nat: Mutex<Option<Ipv4Network>>,
}

impl FakeNetwork {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.links.lock().unwrap().contains(name)
    }
}

#[async_trait::async_trait]
impl HostNetwork for FakeNetwork {
    async fn link_exists(&self, name: &str) -> bool {
        self.has_link(name)
    }

    async fn create_bridge(&self, name: &str, address: Ipv4Network) -> Result<(), Error> {
        self.record(format!("bridge {} {}", name, address));
        self.links.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn create_tap(&self, name: &str, user: &str) -> Result<(), Error> {
        self.record(format!("tap {} {}", name, user));
        if self
            .tap_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Network(format!("tuntap {} busy", name)));
        }
        self.links.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn attach(&self, name: &str, bridge: &str) -> Result<(), Error> {
        self.record(format!("attach {} {}", name, bridge));
        if !self.has_link(name) || !self.has_link(bridge) {
            return Err(Error::Network(format!("cannot attach {} to {}", name, bridge)));
        }
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), Error> {
        self.record(format!("delete {}", name));
        match self.links.lock().unwrap().remove(name) {
            true => Ok(()),
            false => Err(Error::Network(format!("no such interface {}", name))),
        }
    }

    async fn enable_nat(&self, network: Ipv4Network) -> Result<(), Error> {
        self.record(format!("nat {}", network));
        *self.nat.lock().unwrap() = Some(network);
        Ok(())
    }

    /// Fails like `nft delete table` when there is no table.
    async fn disable_nat(&self) -> Result<(), Error> {
        self.record("nat off".to_string());
        match self.nat.lock().unwrap().take() {
            Some(_) => Ok(()),
            None => Err(Error::Network("No such file or directory".to_string())),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<(String, String)>>,
    pub broadcasts: Mutex<Vec<Message>>,
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.notifications.lock().unwrap().iter().map(|(title, _)| title.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str, _icon: &str) {
        self.notifications.lock().unwrap().push((title.to_string(), body.to_string()));
    }

    fn broadcast(&self, message: Message) {
        self.broadcasts.lock().unwrap().push(message);
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: HydraConfig,
    pub launcher: Arc<FakeLauncher>,
    pub network: Arc<FakeNetwork>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["bin", "vms", "disks", "usb", "hugepages"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }

        let binary = root.join("bin/qemu-system-x86_64");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&binary, Permissions::from_mode(0o755)).unwrap();
        let metadata = std::fs::metadata(&binary).unwrap();
        std::fs::write(root.join("nr_hugepages"), "0\n").unwrap();
        std::fs::write(root.join("ip_forward"), "0\n").unwrap();

        let mut config = HydraConfig::default();
        config.paths.scratch = root.join("run");
        config.paths.descriptors = vec![root.join("vms")];
        config.paths.usb = root.join("usb");
        config.emulator.binary = binary;
        config.emulator.wait_budget = 3;
        config.emulator.control_timeout_ms = 500;
        config.network.forwarding = root.join("ip_forward");
        config.network.dhcp = None;
        config.hugepages.knob = root.join("nr_hugepages");
        config.hugepages.mount = root.join("hugepages");
        config.trust.uid = metadata.uid();
        config.trust.gid = metadata.gid();
        config.trust.device_gid = metadata.gid();

        let launcher = Arc::new(FakeLauncher::default());
        launcher.ready.store(true, Ordering::SeqCst);
        Fixture {
            dir,
            config,
            launcher,
            network: Arc::new(FakeNetwork::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn hydra(&self) -> Hydra {
        let platform = Platform {
            launcher: self.launcher.clone(),
            network: self.network.clone(),
            notifier: self.notifier.clone(),
        };
        Hydra::new(self.config.clone(), platform)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn disk(&self, name: &str) -> PathBuf {
        let path = self.root().join("disks").join(name);
        std::fs::write(&path, "").unwrap();
        path
    }

    /// Writes `vms/<name>.yaml` with one virtio disk and one virtio NIC, plus `extra` YAML.
    pub fn descriptor(&self, name: &str, extra: &str) -> PathBuf {
        let disk = self.disk(&format!("{}.img", name));
        let path = self.root().join("vms").join(format!("{}.yaml", name));
        let text = format!(
            "{extra}\ndrives:\n  root:\n    file: {}\n    type: virtio\nnetwork:\n  lan:\n    type: virtio\nvm:\n  name: {name}\n",
            disk.display(),
        );
        std::fs::write(&path, text).unwrap();
        path
    }

    pub fn usb_device(&self, slot: &str, vendor: &str, product: &str, name: &str) {
        let dir = self.root().join("usb").join(slot);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("idVendor"), format!("{}\n", vendor)).unwrap();
        std::fs::write(dir.join("idProduct"), format!("{}\n", product)).unwrap();
        std::fs::write(dir.join("product"), format!("{}\n", name)).unwrap();
    }

    pub fn knob(&self) -> String {
        std::fs::read_to_string(self.root().join("nr_hugepages")).unwrap().trim().to_string()
    }
}

pub async fn send(hydra: &mut Hydra, payload: Value) -> Value {
    Value::Object(hydra.request(Message::request(payload)).await.payload)
}
