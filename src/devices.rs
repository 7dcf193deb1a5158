use std::path::{Path, PathBuf};

use serde::Serialize;
use vm_types::Descriptor;

use crate::{constants::DESCRIPTOR_EXTENSIONS, error::Error, resources::UsbId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDevice {
    pub name: String,
    pub path: PathBuf,
    pub id: UsbId,
}

/// Host USB devices from sysfs, and descriptor files from the configured search dirs.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    usb_root: PathBuf,
    search: Vec<PathBuf>,
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn has_descriptor_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DESCRIPTOR_EXTENSIONS.contains(&ext))
}

impl DeviceDirectory {
    pub fn new<P: AsRef<Path>>(usb_root: P, search: Vec<PathBuf>) -> Self {
        DeviceDirectory { usb_root: usb_root.as_ref().to_path_buf(), search }
    }

    pub fn usb_devices(&self) -> Result<Vec<UsbDevice>, Error> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(&self.usb_root)? {
            let path = entry?.path();
            // Interfaces and hubs without ids are skipped.
            let (Some(vendor), Some(product)) = (read_attr(&path, "idVendor"), read_attr(&path, "idProduct")) else {
                continue;
            };
            let id = match format!("{}:{}", vendor, product).parse::<UsbId>() {
                Ok(id) => id,
                Err(_) => {
                    log::debug!("Skipping {:?}: unreadable ids", path);
                    continue;
                },
            };
            let name = read_attr(&path, "product")
                .or_else(|| read_attr(&path, "manufacturer"))
                .unwrap_or_else(|| id.to_string());
            devices.push(UsbDevice { name, path, id });
        }
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    pub fn find_usb(&self, id: &UsbId) -> Result<Option<UsbDevice>, Error> {
        Ok(self.usb_devices()?.into_iter().find(|device| device.id == *id))
    }

    /// Finds the descriptor for `target`: a path, a file name in a search dir
    /// (extension optional), or the `vm.name` of a descriptor there.
    pub fn resolve(&self, target: &str) -> Result<PathBuf, Error> {
        let direct = Path::new(target);
        if direct.is_file() {
            return Ok(std::path::absolute(direct)?);
        }

        for dir in &self.search {
            let exact = dir.join(target);
            if exact.is_file() {
                return Ok(exact);
            }
            for ext in DESCRIPTOR_EXTENSIONS {
                let candidate = dir.join(format!("{}.{}", target, ext));
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        for dir in &self.search {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.is_file() && has_descriptor_extension(path))
                .collect();
            paths.sort();
            for path in paths {
                match Descriptor::load(&path) {
                    Ok(descriptor) if descriptor.name() == Some(target) => return Ok(path),
                    Ok(_) => {},
                    Err(e) => log::debug!("Skipping {:?}: {}", path, e),
                }
            }
        }

        Err(Error::VMNotFound(target.to_string()))
    }
}
