use std::{
    collections::BTreeMap,
    fs::{OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

pub mod utils;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to parse descriptor: {0}")]
    YAML(#[from] serde_yaml::Error),
    #[error("Failed to parse descriptor: {0}")]
    JSON(#[from] serde_json::Error),
    #[error("Descriptor not accessible: {0}")]
    IO(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn resolve(base: &Path, relative: &Path) -> PathBuf {
    if relative.is_absolute() {
        return relative.to_path_buf();
    }
    let absolute_base = std::path::absolute(base).unwrap_or_else(|_| base.to_path_buf());
    let base_path = absolute_base.parent().unwrap_or(Path::new("/"));
    base_path.join(relative)
}

fn unresolve(base: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(base) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Bios {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub uefi: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Cpu {
    pub options: Vec<String>,
    pub sockets: u16,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for Cpu {
    fn default() -> Self {
        Cpu { options: Vec::new(), sockets: 1, kind: "host".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Devices {
    /// Controller used by drives that don't name a type.
    pub bus: DriveType,
    pub display: String,
    pub input: String,
    pub iommu: bool,
    pub sound: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devicetree: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osk: Option<String>,
}

impl Default for Devices {
    fn default() -> Self {
        Devices {
            bus: DriveType::Virtio,
            display: "virtio".to_string(),
            input: "usb".to_string(),
            iommu: false,
            sound: false,
            tpm: None,
            kernel: None,
            initrd: None,
            devicetree: None,
            cmdline: None,
            osk: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Ide,
    #[serde(alias = "cdrom")]
    Cd,
    #[serde(alias = "ahci")]
    Sata,
    Scsi,
    Virtio,
    Usb,
    #[serde(alias = "bios")]
    Pflash,
}

impl DriveType {
    /// Drives on the emulated IDE/CD bus, which only has four slots.
    pub fn is_legacy(&self) -> bool {
        matches!(self, DriveType::Ide | DriveType::Cd)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Drive {
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DriveType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub discard: bool,
    #[serde(default)]
    pub direct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NicType {
    Virtio,
    #[serde(alias = "intel")]
    E1000,
    E1000e,
    #[serde(alias = "realtek")]
    Rtl8139,
    Vmxnet3,
    Usb,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Network {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<NicType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Memory {
    /// Megabytes.
    pub size: u32,
    /// Back guest RAM with reserved hugepages.
    pub reserve: bool,
}

impl Default for Memory {
    fn default() -> Self {
        Memory { size: 1024, reserve: false }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Machine {
    pub accel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    pub debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub spice: bool,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for Machine {
    fn default() -> Self {
        Machine {
            accel: "kvm".to_string(),
            binary: None,
            debug: false,
            extra: None,
            name: None,
            spice: false,
            kind: "q35".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub bios: Bios,
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub dev: Devices,
    #[serde(default)]
    pub drives: BTreeMap<String, Drive>,
    #[serde(default)]
    pub network: BTreeMap<String, Network>,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub vm: Machine,
}

enum Format {
    Yaml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Format {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

impl Descriptor {
    pub fn parse(text: &str, json: bool) -> Result<Self> {
        if json {
            Ok(serde_json::from_str(text)?)
        } else {
            Ok(serde_yaml::from_str(text)?)
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut descriptor = Self::parse(&text, matches!(Format::of(path), Format::Json))?;
        descriptor.map_paths(|p| resolve(path, p));
        Ok(descriptor)
    }

    /// Writes the descriptor readable by its owner only, paths relative to its directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let base = std::path::absolute(path)?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let mut unresolved = self.clone();
        unresolved.map_paths(|p| unresolve(&base, p));
        let text = match Format::of(path) {
            Format::Json => serde_json::to_string_pretty(&unresolved)?,
            Format::Yaml => serde_yaml::to_string(&unresolved)?,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(text.as_bytes())?;
        std::fs::set_permissions(path, Permissions::from_mode(0o600))?;
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.vm.name.as_deref()
    }

    fn map_paths(&mut self, f: impl Fn(&Path) -> PathBuf) {
        for drive in self.drives.values_mut() {
            drive.file = f(&drive.file);
        }
        let optional = [
            &mut self.bios.file,
            &mut self.dev.tpm,
            &mut self.dev.kernel,
            &mut self.dev.initrd,
            &mut self.dev.devicetree,
            &mut self.vm.binary,
        ];
        for path in optional.into_iter().flatten() {
            *path = f(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
vmid: 3
bios:
  file: ovmf.fd
  uefi: true
drives:
  root:
    file: disks/root.qcow2
    type: virtio
    format: qcow2
  install:
    file: /iso/install.iso
    type: cdrom
network:
  lan:
    type: intel
vm:
  name: builder
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let descriptor = Descriptor::parse(SAMPLE, false).unwrap();
        assert_eq!(descriptor.vmid, Some(3));
        assert_eq!(descriptor.cpu.kind, "host");
        assert_eq!(descriptor.memory.size, 1024);
        assert_eq!(descriptor.vm.kind, "q35");
        assert_eq!(descriptor.drives["install"].kind, Some(DriveType::Cd));
        assert_eq!(descriptor.network["lan"].kind, Some(NicType::E1000));
        assert_eq!(descriptor.dev.bus, DriveType::Virtio);
    }

    #[test]
    fn relative_paths_resolve_against_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("builder.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let descriptor = Descriptor::load(&path).unwrap();
        assert_eq!(descriptor.drives["root"].file, dir.path().join("disks/root.qcow2"));
        assert_eq!(descriptor.drives["install"].file, PathBuf::from("/iso/install.iso"));
        assert_eq!(descriptor.bios.file, Some(dir.path().join("ovmf.fd")));
    }

    #[test]
    fn save_is_private_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("builder.json");
        let mut descriptor = Descriptor::parse(SAMPLE, false).unwrap();
        descriptor.drives.get_mut("root").unwrap().file = dir.path().join("disks/root.qcow2");
        descriptor.save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["drives"]["root"]["file"], "disks/root.qcow2");
        assert_eq!(Descriptor::load(&path).unwrap().drives["root"].file, dir.path().join("disks/root.qcow2"));
    }
}
