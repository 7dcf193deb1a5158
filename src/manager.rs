use std::{
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use serde_json::{Value, json};
use vm_types::Descriptor;

use crate::{
    config::HydraConfig,
    constants::ICON_ERROR,
    devices::{DeviceDirectory, UsbDevice},
    error::Error,
    interface::NetlinkNetwork,
    message::{Command, LogNotifier, Message, Request, Snapshot, Target, VmState},
    process::CommandLauncher,
    resources::{HugepageLedger, Resources},
    services::Services,
    vm::{Env, Platform, UsbSelector, Vm},
};

const VMID_SPACE: u32 = 4096;

/// Owns every active VM and the resources they share.
pub struct Hydra {
    config: HydraConfig,
    platform: Platform,
    directory: DeviceDirectory,
    vms: BTreeMap<u32, Vm>,
    resources: Resources,
    services: Services,
}

fn snapshots(value: Value) -> Vec<Value> {
    match value {
        Value::Object(mut map) => match map.remove("vms") {
            Some(Value::Array(vms)) => vms,
            _ => vec![Value::Object(map)],
        },
        other => vec![other],
    }
}

fn listing(snapshots: Vec<Snapshot>) -> Result<Value, Error> {
    Ok(json!({ "vms": serde_json::to_value(snapshots).map_err(|e| Error::Invalid(e.to_string()))? }))
}

impl Hydra {
    pub fn new(config: HydraConfig, platform: Platform) -> Self {
        let directory = DeviceDirectory::new(&config.paths.usb, config.paths.descriptors.clone());
        let hugepages = HugepageLedger::new(&config.hugepages.knob, config.hugepages.page_size_kb);
        Hydra {
            config,
            platform,
            directory,
            vms: BTreeMap::new(),
            resources: Resources::new(hugepages),
            services: Services::default(),
        }
    }

    /// A manager driving real processes, netlink and `nft`.
    pub fn with_host(config: HydraConfig) -> Self {
        let platform = Platform {
            launcher: Arc::new(CommandLauncher::new(config.emulator.grace())),
            network: Arc::new(NetlinkNetwork::new(config.network.ip.clone(), config.network.nft.clone())),
            notifier: Arc::new(LogNotifier),
        };
        Hydra::new(config, platform)
    }

    pub fn config(&self) -> &HydraConfig {
        &self.config
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn services_running(&self) -> bool {
        self.services.is_running()
    }

    pub fn vm(&self, vmid: u32) -> Option<&Vm> {
        self.vms.get(&vmid)
    }

    pub fn vmids(&self) -> Vec<u32> {
        self.vms.keys().copied().collect()
    }

    pub fn resolve(&self, target: &str) -> Result<PathBuf, Error> {
        let path = self.directory.resolve(target)?;
        Ok(std::fs::canonicalize(&path).unwrap_or(path))
    }

    pub fn usb_devices(&self) -> Result<Vec<UsbDevice>, Error> {
        self.directory.usb_devices()
    }

    /// Validates and assembles the command line for `target` without starting anything.
    pub fn command_line(&self, target: &str, caller: Option<u32>) -> Result<Vec<String>, Error> {
        let path = self.resolve(target)?;
        if let Some(vm) = self.vms.values().find(|vm| vm.path() == path) {
            let mut preview = Vm::new(vm.vmid(), &path, vm.descriptor().clone(), &self.config.paths.scratch);
            return Ok(preview.prepare(&self.config, caller)?.1.argv);
        }
        let mut descriptor = Descriptor::load(&path)?;
        let vmid = self.allocate(&mut descriptor)?;
        let mut vm = Vm::new(vmid, &path, descriptor, &self.config.paths.scratch);
        Ok(vm.prepare(&self.config, caller)?.1.argv)
    }

    /// Picks the vmid for a descriptor that isn't active yet.
    fn allocate(&self, descriptor: &mut Descriptor) -> Result<u32, Error> {
        if let Some(vmid) = descriptor.vmid {
            if vmid == 0 {
                return Err(Error::Invalid("vmid must be positive".to_string()));
            }
            if let Some(other) = self.vms.get(&vmid) {
                return Err(Error::Invalid(format!("vmid {} is already used by {:?}", vmid, other.path())));
            }
            return Ok(vmid);
        }

        let uuid = descriptor.uuid.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        let mut hasher = DefaultHasher::new();
        uuid.hash(&mut hasher);
        let start = (hasher.finish() % VMID_SPACE as u64) as u32;
        (0..VMID_SPACE)
            .map(|offset| (start + offset) % VMID_SPACE + 1)
            .find(|vmid| !self.vms.contains_key(vmid))
            .ok_or_else(|| Error::Resource("no free vmid".to_string()))
    }

    fn states(&self) -> BTreeMap<u32, VmState> {
        self.vms.iter().map(|(vmid, vm)| (*vmid, vm.state())).collect()
    }

    /// Broadcasts when any state changed since `before`, then drops stopped VMs.
    fn settle(&mut self, before: BTreeMap<u32, VmState>) {
        if self.states() != before {
            let snapshots: Vec<Snapshot> = self.vms.values().map(Vm::snapshot).collect();
            match serde_json::to_value(snapshots) {
                Ok(vms) => self.platform.notifier.broadcast(Message::status(json!({ "vms": vms }))),
                Err(e) => log::warn!("Status broadcast failed: {}", e),
            }
        }
        self.vms.retain(|vmid, vm| {
            if vm.is_stopped() {
                log::debug!("VM {} left the active set", vmid);
            }
            !vm.is_stopped()
        });
    }

    pub async fn request(&mut self, message: Message) -> Message {
        let before = self.states();
        let result = match Request::parse(&message) {
            Ok(request) => self.handle(request).await,
            Err(e) => Err(e),
        };
        self.settle(before);
        match result {
            Ok(payload) => Message::reply(payload),
            Err(e) => {
                log::warn!("Request failed: {}", e);
                Message::error(&e)
            },
        }
    }

    async fn handle(&mut self, request: Request) -> Result<Value, Error> {
        match (request.command, request.target) {
            (Command::UsbList, _) => {
                let devices: Vec<Value> = self
                    .usb_devices()?
                    .into_iter()
                    .map(|device| {
                        json!({
                            "name": device.name,
                            "path": device.path,
                            "device": device.id,
                            "vmid": self.resources.usb.owner(&device.id),
                        })
                    })
                    .collect();
                Ok(json!({ "devices": devices }))
            },
            (Command::Status, None | Some(Target::All)) => listing(self.vms.values().map(Vm::snapshot).collect()),
            (command, Some(Target::All)) => {
                if !command.allows_all() {
                    return Err(Error::Invalid("this action needs a single VM".to_string()));
                }
                let mut vms = Vec::new();
                let mut errors = Vec::new();
                for vmid in self.vmids() {
                    match self.apply(vmid, command.clone()).await {
                        Ok(value) => vms.extend(snapshots(value)),
                        Err(e) => {
                            log::warn!("VM {}: {}", vmid, e);
                            errors.push(json!({ "vmid": vmid, "error": e.to_string() }));
                        },
                    }
                }
                if errors.is_empty() {
                    Ok(json!({ "vms": vms }))
                } else {
                    Ok(json!({ "vms": vms, "errors": errors }))
                }
            },
            (_, None) => Err(Error::Invalid("request needs a vmid or path".to_string())),
            (command, Some(Target::Vmid(vmid))) => {
                if !self.vms.contains_key(&vmid) {
                    return Err(Error::VMNotFound(vmid.to_string()));
                }
                self.apply(vmid, command).await
            },
            (command, Some(Target::Path(target))) => {
                let path = self.resolve(&target)?;
                if let Some(vmid) = self.vms.values().find(|vm| vm.path() == path).map(Vm::vmid) {
                    return self.apply(vmid, command).await;
                }
                match command {
                    Command::Start { .. } => {
                        let mut descriptor = Descriptor::load(&path)?;
                        let vmid = self.allocate(&mut descriptor)?;
                        self.vms.insert(vmid, Vm::new(vmid, &path, descriptor, &self.config.paths.scratch));
                        self.apply(vmid, command).await
                    },
                    Command::Status => {
                        let descriptor = Descriptor::load(&path)?;
                        listing(vec![Snapshot {
                            vmid: descriptor.vmid,
                            pid: None,
                            state: VmState::Stopped,
                            path,
                            name: descriptor.name().map(str::to_string),
                            usb: BTreeMap::new(),
                        }])
                    },
                    _ => Err(Error::VMNotFound(target)),
                }
            },
        }
    }

    async fn apply(&mut self, vmid: u32, command: Command) -> Result<Value, Error> {
        if matches!(command, Command::Start { .. }) && !self.services.is_running() {
            if let Err(e) = self.services.start(&self.config, &self.platform).await {
                if let Some(vm) = self.vms.get(&vmid).filter(|vm| vm.is_stopped()) {
                    log::warn!("Abandoning start of VM {}", vm.vmid());
                }
                return Err(e);
            }
        }

        let Hydra { config, platform, vms, resources, .. } = self;
        let (config, platform) = (&*config, &*platform);
        let vm = vms.get_mut(&vmid).ok_or_else(|| Error::VMNotFound(vmid.to_string()))?;
        let mut env = Env { config, platform, resources };
        let stop_timeout = |timeout: Option<u64>| Duration::from_secs(timeout.unwrap_or(config.emulator.stop_timeout));

        let snapshot = match command {
            Command::Status => vm.snapshot(),
            Command::Start { user } => vm.start(&mut env, user).await?,
            Command::Stop { force, timeout, tap } => vm.stop(&mut env, force, stop_timeout(timeout), tap).await?,
            Command::Restart => vm.restart(&mut env).await?,
            Command::Reset => vm.reset(&mut env).await?,
            Command::Sleep => vm.sleep()?,
            Command::Wake => vm.wake()?,
            Command::Hibernate => vm.hibernate(&mut env).await?,
            Command::UsbAdd { device } => {
                vm.usb_attach(&mut env, device).await?;
                vm.snapshot()
            },
            Command::UsbRemove { id, device } => {
                let selector = match (id, device) {
                    (Some(local), _) => UsbSelector::Local(local),
                    (None, Some(device)) => UsbSelector::Device(device),
                    (None, None) => return Err(Error::Invalid("usb_remove needs id or device".to_string())),
                };
                vm.usb_detach(&mut env, selector).await?;
                vm.snapshot()
            },
            Command::Ping => return Ok(vm.ping(config).await),
            Command::Ip => return Ok(vm.ip(config).await),
            Command::UsbList => return Err(Error::Invalid("usb_list takes no target".to_string())),
        };
        listing(vec![snapshot])
    }

    /// One scheduler tick for the whole fleet.
    pub async fn tick(&mut self) {
        let before = self.states();
        let pending = !self.vms.is_empty();

        if !self.services.is_running() && pending {
            if let Err(e) = self.services.start(&self.config, &self.platform).await {
                log::error!("Abandoning {} pending VMs: {}", self.vms.len(), e);
                let Hydra { config, platform, vms, resources, .. } = self;
                let (config, platform) = (&*config, &*platform);
                let mut env = Env { config, platform, resources };
                for vm in vms.values_mut() {
                    vm.force_stop(&mut env).await;
                    platform.notifier.notify("VM failed", &format!("{}: network unavailable", vm.name()), ICON_ERROR);
                }
            }
        } else if self.services.is_running() && !pending {
            self.services.stop(&self.config, &self.platform).await;
        } else {
            self.services.poll();
            let Hydra { config, platform, vms, resources, .. } = self;
            let (config, platform) = (&*config, &*platform);
            let mut env = Env { config, platform, resources };
            for vm in vms.values_mut() {
                vm.poll(&mut env).await;
            }
        }

        self.settle(before);
    }

    /// Stops everything and leaves the host as it was.
    pub async fn shutdown(&mut self) {
        let before = self.states();
        {
            let Hydra { config, platform, vms, resources, .. } = self;
            let (config, platform) = (&*config, &*platform);
            let mut env = Env { config, platform, resources };
            for vm in vms.values_mut() {
                vm.force_stop(&mut env).await;
            }
        }
        self.settle(before);
        self.services.stop(&self.config, &self.platform).await;

        if let Err(e) = self.resources.hugepages.clear() {
            log::warn!("Clearing hugepages: {}", e);
        }
        match std::fs::remove_dir_all(&self.config.paths.scratch) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => log::warn!("Removing {:?}: {}", self.config.paths.scratch, e),
        }
        log::info!("Hydra shut down");
    }
}
