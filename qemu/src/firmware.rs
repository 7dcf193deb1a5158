use std::path::Path;

use crate::{Props, QEMU};

impl QEMU {
    pub fn bios<P: AsRef<Path>>(self, file: P) -> Self {
        self.option("-bios", file.as_ref().to_string_lossy())
    }

    pub fn uefi<P: AsRef<Path>>(self, code: P) -> Self {
        self.pflash(code, "raw", true)
    }

    pub fn smbios_bios(self, version: &str) -> Self {
        self.option("-smbios", Props::new("type=0").set("version", version))
    }

    pub fn smbios_system(self, uuid: &str) -> Self {
        self.option("-smbios", Props::new("type=1").set("uuid", uuid))
    }
}
