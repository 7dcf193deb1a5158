use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use nix::unistd::{Uid, User, getuid};
use qemu::{Props, QEMU, device::MediaType, drive::DriveOptions};
use vm_types::{Descriptor, DriveType, NicType, utils::get_mac};

use crate::{
    config::HydraConfig,
    constants::{AGENT_CHANNEL, CPU_HOST_FLAGS, MAX_LEGACY_DRIVES, MAX_SATA_DRIVES, NIC_SLOT_BASE, USB_CONTROLLER},
    error::Error,
    security::{TrustPolicy, verify},
};

/// Per-VM files under the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    pub qmp: PathBuf,
    pub agent: PathBuf,
    pub vnc: PathBuf,
    pub spice: PathBuf,
    pub pid: PathBuf,
    pub log: PathBuf,
    pub serial: PathBuf,
}

impl SocketPaths {
    pub fn new(scratch: &Path, vmid: u32) -> Self {
        let file = |ext: &str| scratch.join(format!("{}.{}", vmid, ext));
        SocketPaths {
            qmp: file("sock"),
            agent: file("qga"),
            vnc: file("vnc"),
            spice: file("spice"),
            pid: file("pid"),
            log: file("log"),
            serial: file("serial"),
        }
    }

    /// Files removed once the VM is stopped.
    pub fn runtime(&self) -> [&Path; 5] {
        [&self.qmp, &self.agent, &self.vnc, &self.spice, &self.pid]
    }
}

/// Launch parameters that passed validation. Built once per start, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restricted {
    pub binary: PathBuf,
    pub extra: Vec<String>,
    /// Megabytes.
    pub memory: u32,
    pub hugepages: Option<PathBuf>,
    pub bios: Option<PathBuf>,
    pub tpm: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub devicetree: Option<PathBuf>,
    /// Caller; owns the tap devices and display sockets.
    pub uid: u32,
    pub user: String,
    /// Set when the caller isn't the daemon's own user.
    pub runas: Option<String>,
    pub x86_64: bool,
}

fn user_name(uid: u32) -> Result<String, Error> {
    match User::from_uid(Uid::from_raw(uid))? {
        Some(user) => Ok(user.name),
        None => Err(Error::Invalid(format!("unknown user id {}", uid))),
    }
}

impl Restricted {
    pub fn validate(descriptor: &Descriptor, config: &HydraConfig, caller: Option<u32>) -> Result<Self, Error> {
        let trust = &config.trust;
        let binary = descriptor.vm.binary.clone().unwrap_or_else(|| config.emulator.binary.clone());
        verify(&binary, &TrustPolicy::executable(trust.uid, trust.gid))?;

        let readable = TrustPolicy::readable(trust.uid, trust.gid);
        let trusted = |path: &Option<PathBuf>, policy: &TrustPolicy| -> Result<Option<PathBuf>, Error> {
            match path {
                Some(path) => verify(path, policy).map(|_| Some(path.clone())),
                None => Ok(None),
            }
        };
        let bios = trusted(&descriptor.bios.file, &readable)?;
        let kernel = trusted(&descriptor.dev.kernel, &readable)?;
        let initrd = trusted(&descriptor.dev.initrd, &readable)?;
        let devicetree = trusted(&descriptor.dev.devicetree, &readable)?;
        let tpm = trusted(&descriptor.dev.tpm, &TrustPolicy::device(trust.uid, trust.device_gid))?;

        for (name, drive) in &descriptor.drives {
            if !drive.file.exists() {
                return Err(Error::Invalid(format!("drive {}: {:?} does not exist", name, drive.file)));
            }
        }

        let hugepages = if descriptor.memory.reserve {
            let mount = config.hugepages.mount.clone();
            if !mount.is_dir() {
                return Err(Error::Resource(format!("hugepage mount {:?} is missing", mount)));
            }
            Some(mount)
        } else {
            None
        };

        let own = getuid().as_raw();
        let caller = caller.unwrap_or(own);
        let user = match user_name(caller) {
            Ok(user) => user,
            Err(_) if caller == own => own.to_string(),
            Err(e) => return Err(e),
        };
        let runas = (caller != own).then(|| user.clone());

        let x86_64 = binary
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with("x86_64"));

        Ok(Restricted {
            extra: descriptor
                .vm
                .extra
                .as_deref()
                .map(|extra| extra.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            binary,
            memory: descriptor.memory.size,
            hugepages,
            bios,
            tpm,
            kernel,
            initrd,
            devicetree,
            uid: caller,
            user,
            runas,
            x86_64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAdapter {
    /// Created and deleted by the lifecycle manager.
    pub auto: bool,
    pub bridge: String,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub adapters: Vec<NetworkAdapter>,
}

/// Fills the fields the lifecycle manager owns: uuid, MACs and boot indexes.
/// Normalizing twice changes nothing.
pub fn normalize(descriptor: &mut Descriptor) {
    let uuid = descriptor
        .uuid
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();

    for (name, network) in descriptor.network.iter_mut() {
        if network.mac.is_none() {
            network.mac = Some(get_mac(&format!("{}/{}", uuid, name)));
        }
    }

    let mut used = BTreeSet::new();
    let mut pending = Vec::new();
    for (name, drive) in descriptor.drives.iter_mut() {
        if drive.kind == Some(DriveType::Pflash) {
            drive.index = None;
            continue;
        }
        match drive.index {
            Some(index) if index >= 1 && used.insert(index) => {},
            _ => pending.push(name.clone()),
        }
    }
    let mut next = 1;
    for name in pending {
        while used.contains(&next) {
            next += 1;
        }
        used.insert(next);
        if let Some(drive) = descriptor.drives.get_mut(&name) {
            drive.index = Some(next);
        }
    }
}

fn is_pcie(machine: &str) -> bool {
    machine == "q35" || machine == "virt" || machine.starts_with("pc-q35")
}

fn flag_key(flag: &str) -> &str {
    flag.trim_start_matches(['+', '-']).split('=').next().unwrap_or(flag)
}

fn cpu_flags(descriptor: &Descriptor, restricted: &Restricted) -> Vec<String> {
    let mut flags = descriptor.cpu.options.clone();
    if descriptor.cpu.kind == "host" && restricted.x86_64 {
        for flag in CPU_HOST_FLAGS {
            if !flags.iter().any(|given| flag_key(given) == flag_key(flag)) {
                flags.push(flag.to_string());
            }
        }
    }
    flags
}

fn nic_model(kind: NicType) -> &'static str {
    match kind {
        NicType::Virtio => "virtio-net-pci",
        NicType::E1000 => "e1000",
        NicType::E1000e => "e1000e",
        NicType::Rtl8139 => "rtl8139",
        NicType::Vmxnet3 => "vmxnet3",
        NicType::Usb => "usb-net",
    }
}

/// Assembles the emulator command line. Deterministic for a normalized descriptor.
pub struct CommandBuilder<'a> {
    vmid: u32,
    descriptor: &'a Descriptor,
    restricted: &'a Restricted,
    paths: &'a SocketPaths,
    bridge: &'a str,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(vmid: u32, descriptor: &'a Descriptor, restricted: &'a Restricted, paths: &'a SocketPaths, bridge: &'a str) -> Self {
        CommandBuilder { vmid, descriptor, restricted, paths, bridge }
    }

    fn bus(&self) -> &'static str {
        if is_pcie(&self.descriptor.vm.kind) { "pcie.0" } else { "pci.0" }
    }

    pub fn build(&self) -> Result<Invocation, Error> {
        let d = self.descriptor;
        let r = self.restricted;
        let uuid = d.uuid.as_deref().ok_or_else(|| Error::Invalid("descriptor has no uuid".to_string()))?;
        let name = d.name().map(str::to_string).unwrap_or_else(|| format!("hydra-{}", self.vmid));

        let mut qemu = QEMU::new(&r.binary.to_string_lossy())
            .nodefaults()
            .pidfile(&self.paths.pid)
            .headless()
            .sandbox();
        if let Some(user) = &r.runas {
            qemu = qemu.runas(user);
        }
        qemu = qemu.serial(d.vm.debug.then_some(self.paths.serial.as_path()));
        if d.vm.debug {
            qemu = qemu.debug_log();
        }

        qemu = self.firmware(qemu)?;
        qemu = qemu
            .name(&name)
            .uuid(uuid)
            .smbios_system(uuid)
            .cpu(&d.cpu.kind, &cpu_flags(d, r))
            .smp(d.cpu.sockets)
            .machine(&d.vm.kind, &d.vm.accel);
        if d.dev.iommu {
            if r.x86_64 && is_pcie(&d.vm.kind) {
                qemu = qemu.device(Props::new("intel-iommu"));
            } else {
                log::warn!("VM {}: iommu needs the x86_64 emulator on a pcie machine, skipped", self.vmid);
            }
        }

        qemu = qemu.memory(r.memory);
        if let Some(mount) = &r.hugepages {
            qemu = qemu.mem_path(mount);
        }

        qemu = qemu.vnc(&self.paths.vnc);
        if d.vm.spice {
            qemu = qemu.spice(&self.paths.spice);
        }
        qemu = qemu
            .qmp(&self.paths.qmp)
            .chardev_socket(AGENT_CHANNEL, &self.paths.agent)
            .guest_agent(AGENT_CHANNEL)
            .xhci_controller(USB_CONTROLLER)
            .device(Props::new("virtio-balloon-pci").set("bus", self.bus()))
            .device(Props::new("virtio-rng-pci").set("bus", self.bus()));

        qemu = self.peripherals(qemu)?;
        qemu = self.drives(qemu)?;
        let (mut qemu, adapters) = self.networks(qemu);
        qemu = qemu.args(r.extra.iter().cloned());

        Ok(Invocation { argv: qemu.build(), adapters })
    }

    fn firmware(&self, mut qemu: QEMU) -> Result<QEMU, Error> {
        let bios = &self.descriptor.bios;
        match (&self.restricted.bios, bios.uefi) {
            (Some(file), true) => qemu = qemu.uefi(file),
            (Some(file), false) => qemu = qemu.bios(file),
            (None, true) => return Err(Error::Invalid("uefi needs bios.file".to_string())),
            (None, false) => {},
        }
        if let Some(version) = &bios.version {
            qemu = qemu.smbios_bios(version);
        }
        Ok(qemu)
    }

    fn peripherals(&self, mut qemu: QEMU) -> Result<QEMU, Error> {
        let dev = &self.descriptor.dev;
        let bus = self.bus();
        let usb_bus = format!("{}.0", USB_CONTROLLER);

        qemu = match dev.display.as_str() {
            "virtio" => qemu.device(Props::new("virtio-vga").set("bus", bus)),
            "std" => qemu.device(Props::new("VGA").set("bus", bus)),
            "qxl" => qemu.device(Props::new("qxl-vga").set("bus", bus)),
            "ramfb" => qemu.device(Props::new("ramfb")),
            "none" => qemu,
            other => return Err(Error::Invalid(format!("unknown display {:?}", other))),
        };
        qemu = match dev.input.as_str() {
            "usb" => qemu
                .device(Props::new("usb-tablet").set("bus", &usb_bus))
                .device(Props::new("usb-kbd").set("bus", &usb_bus)),
            "virtio" => qemu
                .device(Props::new("virtio-tablet-pci").set("bus", bus))
                .device(Props::new("virtio-keyboard-pci").set("bus", bus)),
            "none" => qemu,
            other => return Err(Error::Invalid(format!("unknown input {:?}", other))),
        };

        if dev.sound {
            qemu = qemu
                .device(Props::new("ich9-intel-hda").set("id", "sound0").set("bus", bus))
                .device(Props::new("hda-duplex").set("bus", "sound0.0"));
        }
        if let Some(tpm) = &self.restricted.tpm {
            let model = if self.descriptor.vm.kind == "virt" { "tpm-tis-device" } else { "tpm-tis" };
            qemu = qemu.tpm_passthrough(tpm, model);
        }
        if let Some(osk) = &dev.osk {
            qemu = qemu.device(Props::new("isa-applesmc").set("osk", osk));
        }
        if let Some(kernel) = &self.restricted.kernel {
            qemu = qemu.kernel(kernel);
        }
        if let Some(initrd) = &self.restricted.initrd {
            qemu = qemu.initrd(initrd);
        }
        if let Some(dtb) = &self.restricted.devicetree {
            qemu = qemu.dtb(dtb);
        }
        if let Some(cmdline) = &dev.cmdline {
            qemu = qemu.append(cmdline);
        }
        Ok(qemu)
    }

    fn drives(&self, mut qemu: QEMU) -> Result<QEMU, Error> {
        let d = self.descriptor;
        let kinds: Vec<DriveType> = d.drives.values().map(|drive| drive.kind.unwrap_or(d.dev.bus)).collect();
        let legacy = kinds.iter().filter(|kind| kind.is_legacy()).count();
        if legacy > MAX_LEGACY_DRIVES {
            return Err(Error::Resource(format!("{} IDE/CD drives, at most {} fit", legacy, MAX_LEGACY_DRIVES)));
        }
        let sata = kinds.iter().filter(|kind| **kind == DriveType::Sata).count();
        if sata > MAX_SATA_DRIVES {
            return Err(Error::Resource(format!("{} SATA drives, at most {} fit", sata, MAX_SATA_DRIVES)));
        }

        let pcie = is_pcie(&d.vm.kind);
        let usb_bus = format!("{}.0", USB_CONTROLLER);
        let (mut legacy_slot, mut sata_slot) = (0u32, 0u32);
        let (mut ahci, mut scsi) = (false, false);

        for ((name, drive), kind) in d.drives.iter().zip(kinds) {
            let format = drive.format.clone().unwrap_or_else(|| "raw".to_string());
            if kind == DriveType::Pflash {
                qemu = qemu.pflash(&drive.file, &format, drive.readonly);
                continue;
            }

            let id = format!("drive-{}", name);
            let options = DriveOptions {
                format,
                readonly: drive.readonly || kind == DriveType::Cd,
                discard: drive.discard,
                direct: drive.direct,
                cdrom: kind == DriveType::Cd,
            };
            qemu = qemu.drive(&id, &drive.file, &options);

            let boot = drive.index;
            qemu = match kind {
                DriveType::Ide | DriveType::Cd => {
                    let media = if kind == DriveType::Cd { MediaType::Cdrom } else { MediaType::Disk };
                    // ICH9 ports take one device each, PIIX channels take two.
                    let (bus, unit) = if pcie {
                        (format!("ide.{}", legacy_slot), None)
                    } else {
                        (format!("ide.{}", legacy_slot / 2), Some(legacy_slot % 2))
                    };
                    legacy_slot += 1;
                    qemu.ide_device(&id, boot, media, &bus, unit)
                },
                DriveType::Sata => {
                    if !ahci {
                        qemu = qemu.ahci_controller("ahci0", self.bus());
                        ahci = true;
                    }
                    let bus = format!("ahci0.{}", sata_slot);
                    sata_slot += 1;
                    qemu.ide_device(&id, boot, MediaType::Disk, &bus, None)
                },
                DriveType::Scsi => {
                    if !scsi {
                        qemu = qemu.scsi_controller("scsi0", self.bus());
                        scsi = true;
                    }
                    qemu.scsi_device(&id, boot, "scsi0")
                },
                DriveType::Virtio => qemu.virtio_blk(&id, boot, self.bus()),
                DriveType::Usb => qemu.usb_storage(&id, boot, &usb_bus),
                DriveType::Pflash => qemu,
            };
        }
        Ok(qemu)
    }

    fn networks(&self, mut qemu: QEMU) -> (QEMU, Vec<NetworkAdapter>) {
        let d = self.descriptor;
        let uuid = d.uuid.as_deref().unwrap_or_default();
        let usb_bus = format!("{}.0", USB_CONTROLLER);
        let mut adapters = Vec::new();

        for (i, (name, network)) in d.network.iter().enumerate() {
            let adapter = NetworkAdapter {
                auto: network.device.is_none(),
                bridge: network.bridge.clone().unwrap_or_else(|| self.bridge.to_string()),
                device: network.device.clone().unwrap_or_else(|| format!("hyd{}n{}", self.vmid, i)),
            };
            let netdev = format!("net-{}", name);
            let mac = network.mac.clone().unwrap_or_else(|| get_mac(&format!("{}/{}", uuid, name)));
            let kind = network.kind.unwrap_or(NicType::Virtio);

            qemu = qemu.netdev_tap(&netdev, &adapter.device);
            qemu = match kind {
                NicType::Usb => qemu.network_device(nic_model(kind), &netdev, &mac, &usb_bus, None),
                _ => qemu.network_device(nic_model(kind), &netdev, &mac, self.bus(), Some(NIC_SLOT_BASE + i as u32)),
            };
            adapters.push(adapter);
        }
        (qemu, adapters)
    }
}
