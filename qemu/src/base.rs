use std::path::Path;

use crate::{Props, QEMU, escape};

impl QEMU {
    pub fn nodefaults(self) -> Self {
        self.arg("-nodefaults").arg("-no-user-config")
    }

    pub fn memory(self, megabytes: u32) -> Self {
        self.option("-m", format!("{}M", megabytes))
    }

    pub fn mem_path<P: AsRef<Path>>(self, path: P) -> Self {
        self.option("-mem-path", path.as_ref().to_string_lossy())
            .arg("-mem-prealloc")
    }

    pub fn smp(self, sockets: u16) -> Self {
        self.option("-smp", format!("{},sockets={}", sockets, sockets))
    }

    pub fn cpu(self, model: &str, flags: &[String]) -> Self {
        let mut cpu = Props::new(model);
        for flag in flags {
            cpu = cpu.raw(flag);
        }
        self.option("-cpu", cpu)
    }

    pub fn machine(self, kind: &str, accel: &str) -> Self {
        self.option("-machine", Props::empty().set("type", kind).set("accel", accel))
    }

    pub fn qmp<P: AsRef<Path>>(self, unix: P) -> Self {
        self.option("-qmp", format!("unix:{},server=on,wait=off", escape(&unix.as_ref().to_string_lossy())))
    }

    pub fn pidfile<P: AsRef<Path>>(self, path: P) -> Self {
        self.option("-pidfile", path.as_ref().to_string_lossy())
    }

    pub fn vnc<P: AsRef<Path>>(self, unix: P) -> Self {
        self.option("-vnc", format!("unix:{}", escape(&unix.as_ref().to_string_lossy())))
    }

    pub fn spice<P: AsRef<Path>>(self, unix: P) -> Self {
        self.option(
            "-spice",
            Props::empty()
                .set("unix", "on")
                .set("addr", unix.as_ref().to_string_lossy())
                .set("disable-ticketing", "on"),
        )
    }

    pub fn name(self, name: &str) -> Self {
        self.option("-name", escape(name))
    }

    pub fn uuid(self, uuid: &str) -> Self {
        self.option("-uuid", uuid)
    }

    pub fn runas(self, user: &str) -> Self {
        self.option("-runas", user)
    }

    pub fn sandbox(self) -> Self {
        self.option("-sandbox", "on,obsolete=deny,elevateprivileges=deny,spawn=deny,resourcecontrol=deny")
    }

    pub fn headless(self) -> Self {
        self.option("-display", "none").option("-monitor", "none")
    }

    pub fn serial(self, target: Option<&Path>) -> Self {
        match target {
            Some(path) => self.option("-serial", format!("file:{}", path.to_string_lossy())),
            None => self.option("-serial", "none"),
        }
    }

    pub fn debug_log(self) -> Self {
        self.option("-d", "guest_errors")
    }

    pub fn chardev_socket<P: AsRef<Path>>(self, id: &str, path: P) -> Self {
        self.option(
            "-chardev",
            Props::new("socket")
                .set("id", id)
                .set("path", path.as_ref().to_string_lossy())
                .set("server", "on")
                .set("wait", "off"),
        )
    }

    pub fn kernel<P: AsRef<Path>>(self, path: P) -> Self {
        self.option("-kernel", path.as_ref().to_string_lossy())
    }

    pub fn initrd<P: AsRef<Path>>(self, path: P) -> Self {
        self.option("-initrd", path.as_ref().to_string_lossy())
    }

    pub fn dtb<P: AsRef<Path>>(self, path: P) -> Self {
        self.option("-dtb", path.as_ref().to_string_lossy())
    }

    pub fn append(self, cmdline: &str) -> Self {
        self.option("-append", cmdline)
    }
}
