use std::path::Path;

use crate::{Props, QEMU};

pub enum MediaType {
    Disk,
    Cdrom,
}

impl QEMU {
    pub fn device(self, props: Props) -> Self {
        self.option("-device", props)
    }

    pub fn ide_device(self, drive_id: &str, boot_index: Option<u32>, media_type: MediaType, bus: &str, unit: Option<u32>) -> Self {
        let device_type = match media_type {
            MediaType::Disk => "ide-hd",
            MediaType::Cdrom => "ide-cd",
        };
        self.device(
            Props::new(device_type)
                .set("drive", drive_id)
                .set("bus", bus)
                .opt("unit", unit)
                .opt("bootindex", boot_index),
        )
    }

    pub fn ahci_controller(self, id: &str, bus: &str) -> Self {
        self.device(Props::new("ahci").set("id", id).set("bus", bus))
    }

    pub fn scsi_controller(self, id: &str, bus: &str) -> Self {
        self.device(Props::new("virtio-scsi-pci").set("id", id).set("bus", bus))
    }

    pub fn scsi_device(self, drive_id: &str, boot_index: Option<u32>, controller: &str) -> Self {
        self.device(
            Props::new("scsi-hd")
                .set("bus", format!("{}.0", controller))
                .set("drive", drive_id)
                .opt("bootindex", boot_index),
        )
    }

    pub fn virtio_blk(self, drive_id: &str, boot_index: Option<u32>, bus: &str) -> Self {
        self.device(
            Props::new("virtio-blk-pci")
                .set("drive", drive_id)
                .set("bus", bus)
                .opt("bootindex", boot_index),
        )
    }

    pub fn usb_storage(self, drive_id: &str, boot_index: Option<u32>, usb_bus: &str) -> Self {
        self.device(
            Props::new("usb-storage")
                .set("bus", usb_bus)
                .set("drive", drive_id)
                .opt("bootindex", boot_index),
        )
    }

    pub fn xhci_controller(self, id: &str) -> Self {
        self.device(Props::new("qemu-xhci").set("id", id))
    }

    pub fn netdev_tap(self, id: &str, ifname: &str) -> Self {
        self.option(
            "-netdev",
            Props::new("tap")
                .set("id", id)
                .set("ifname", ifname)
                .set("script", "no")
                .set("downscript", "no"),
        )
    }

    /// Guest visible adapter. `addr` is a PCI slot; `None` places the device on the USB bus.
    pub fn network_device(self, model: &str, netdev_id: &str, mac: &str, bus: &str, addr: Option<u32>) -> Self {
        self.device(
            Props::new(model)
                .set("netdev", netdev_id)
                .set("mac", mac)
                .set("bus", bus)
                .opt("addr", addr.map(|slot| format!("0x{:x}", slot))),
        )
    }

    pub fn guest_agent(self, chardev: &str) -> Self {
        self.device(Props::new("virtio-serial-pci").set("id", "serial0"))
            .device(
                Props::new("virtserialport")
                    .set("bus", "serial0.0")
                    .set("chardev", chardev)
                    .set("name", "org.qemu.guest_agent.0"),
            )
    }

    pub fn tpm_passthrough<P: AsRef<Path>>(self, path: P, model: &str) -> Self {
        self.option(
            "-tpmdev",
            Props::new("passthrough").set("id", "tpm0").set("path", path.as_ref().to_string_lossy()),
        )
        .device(Props::new(model).set("tpmdev", "tpm0"))
    }
}
