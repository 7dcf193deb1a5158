use std::path::Path;

use crate::{Props, QEMU};

#[derive(Debug, Clone, Default)]
pub struct DriveOptions {
    pub format: String,
    pub readonly: bool,
    pub discard: bool,
    pub direct: bool,
    pub cdrom: bool,
}

impl QEMU {
    pub fn drive<P: AsRef<Path>>(self, id: &str, filename: P, options: &DriveOptions) -> Self {
        let mut drive = Props::empty()
            .set("file", filename.as_ref().to_string_lossy())
            .set("if", "none")
            .set("id", id)
            .set("format", &options.format);
        if options.cdrom {
            drive = drive.set("media", "cdrom");
        }
        drive = drive.flag("readonly", options.readonly);
        if options.discard {
            drive = drive.set("discard", "unmap");
        }
        if options.direct {
            drive = drive.set("cache.direct", "on").set("aio", "native");
        }
        self.option("-drive", drive)
    }

    pub fn pflash<P: AsRef<Path>>(self, filename: P, format: &str, readonly: bool) -> Self {
        self.option(
            "-drive",
            Props::empty()
                .set("if", "pflash")
                .set("format", format)
                .flag("readonly", readonly)
                .set("file", filename.as_ref().to_string_lossy()),
        )
    }
}
