use std::{collections::BTreeMap, fmt::Display, path::{Path, PathBuf}, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Host USB device key, written `vvvv:pppp` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbId {
    pub fn new(vendor: u16, product: u16) -> Self {
        UsbId { vendor, product }
    }
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

impl FromStr for UsbId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Invalid(format!("bad USB id {:?}, expected vendor:product", s));
        let (vendor, product) = s.trim().split_once(':').ok_or_else(invalid)?;
        Ok(UsbId {
            vendor: u16::from_str_radix(vendor, 16).map_err(|_| invalid())?,
            product: u16::from_str_radix(product, 16).map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for UsbId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbId> for String {
    fn from(value: UsbId) -> Self {
        value.to_string()
    }
}

/// Fleet-wide USB ownership: a device belongs to at most one VM.
#[derive(Debug, Default)]
pub struct UsbOwners {
    owners: BTreeMap<UsbId, u32>,
}

impl UsbOwners {
    pub fn owner(&self, id: &UsbId) -> Option<u32> {
        self.owners.get(id).copied()
    }

    pub fn claim(&mut self, id: UsbId, vmid: u32) -> Result<(), Error> {
        match self.owners.get(&id) {
            Some(&owner) if owner != vmid => Err(Error::Usb(format!("{} is already attached to VM {}", id, owner))),
            _ => {
                self.owners.insert(id, vmid);
                Ok(())
            },
        }
    }

    pub fn release(&mut self, id: &UsbId, vmid: u32) {
        if self.owners.get(id) == Some(&vmid) {
            self.owners.remove(id);
        }
    }

    pub fn release_all(&mut self, vmid: u32) {
        self.owners.retain(|_, owner| *owner != vmid);
    }
}

/// Per-VM hugepage reservations. The knob always holds the sum of all entries.
#[derive(Debug)]
pub struct HugepageLedger {
    knob: PathBuf,
    page_kb: u64,
    pages: BTreeMap<u32, u64>,
}

impl HugepageLedger {
    pub fn new<P: AsRef<Path>>(knob: P, page_kb: u64) -> Self {
        HugepageLedger { knob: knob.as_ref().to_path_buf(), page_kb: page_kb.max(1), pages: BTreeMap::new() }
    }

    pub fn pages_for(&self, size_mb: u32) -> u64 {
        (size_mb as u64 * 1024).div_ceil(self.page_kb)
    }

    pub fn total(&self) -> u64 {
        self.pages.values().sum()
    }

    pub fn reserved(&self, vmid: u32) -> u64 {
        self.pages.get(&vmid).copied().unwrap_or(0)
    }

    /// Reserves enough pages for `size_mb` of guest RAM. The kernel may grant fewer
    /// pages than asked, in which case the entry is rolled back.
    pub fn reserve(&mut self, vmid: u32, size_mb: u32) -> Result<u64, Error> {
        let pages = self.pages_for(size_mb);
        let previous = self.pages.insert(vmid, pages);
        let wanted = self.total();

        let granted = self.write_knob(wanted).and_then(|_| self.read_knob());
        match granted {
            Ok(granted) if granted >= wanted => {
                log::debug!("VM {} reserved {} hugepages, {} total", vmid, pages, wanted);
                Ok(pages)
            },
            outcome => {
                match previous {
                    Some(previous) => self.pages.insert(vmid, previous),
                    None => self.pages.remove(&vmid),
                };
                if let Err(e) = self.write_knob(self.total()) {
                    log::warn!("Failed to restore hugepage count: {}", e);
                }
                Err(match outcome {
                    Ok(granted) => Error::Resource(format!("only {} of {} hugepages available", granted, wanted)),
                    Err(e) => Error::Resource(format!("hugepage reservation failed: {}", e)),
                })
            },
        }
    }

    /// Releasing a VM without a reservation changes nothing.
    pub fn release(&mut self, vmid: u32) {
        if self.pages.remove(&vmid).is_none() {
            return;
        }
        if let Err(e) = self.write_knob(self.total()) {
            log::warn!("VM {}: failed to release hugepages: {}", vmid, e);
        }
    }

    pub fn clear(&mut self) -> Result<(), Error> {
        self.pages.clear();
        self.write_knob(0)
    }

    fn write_knob(&self, pages: u64) -> Result<(), Error> {
        std::fs::write(&self.knob, format!("{}\n", pages))?;
        Ok(())
    }

    fn read_knob(&self) -> Result<u64, Error> {
        let text = std::fs::read_to_string(&self.knob)?;
        text.trim()
            .parse()
            .map_err(|_| Error::Resource(format!("unreadable hugepage count {:?}", text.trim())))
    }
}

#[derive(Debug)]
pub struct Resources {
    pub usb: UsbOwners,
    pub hugepages: HugepageLedger,
}

impl Resources {
    pub fn new(hugepages: HugepageLedger) -> Self {
        Resources { usb: UsbOwners::default(), hugepages }
    }
}
