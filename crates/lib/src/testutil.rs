//! Shared fixtures for unit tests.

use std::cell::RefCell;

use anyhow::Result;
use bootplace_utils::{CmdOutput, Executor};

use crate::devicegraph::*;

pub(crate) fn disk(name: &str, label: Option<LabelType>) -> BlockDevice {
    let mut d = BlockDevice::new(name, DeviceKind::Disk);
    d.label = label;
    d
}

pub(crate) fn part(disk: &str, number: u32) -> BlockDevice {
    let sep = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    let mut d = BlockDevice::new(format!("{disk}{sep}{number}"), DeviceKind::Partition);
    d.parents = vec![disk.to_owned()];
    d.partition = Some(PartitionInfo {
        number,
        kind: if number > 4 {
            PartitionKind::Logical
        } else {
            PartitionKind::Primary
        },
        id: PartitionId::Linux,
        boot: false,
        legacy_boot: false,
    });
    d
}

pub(crate) fn virt(name: &str, kind: DeviceKind, parents: &[&str]) -> BlockDevice {
    let mut d = BlockDevice::new(name, kind);
    d.parents = parents.iter().map(|s| s.to_string()).collect();
    d
}

/// Builder-style tweaks on fixture devices.
pub(crate) trait DeviceFixture: Sized {
    fn dev(&mut self) -> &mut BlockDevice;

    fn mounted(mut self, path: &str, fstype: FsType) -> Self {
        let d = self.dev();
        let n = d.name.trim_start_matches("/dev/").replace('/', "-");
        d.filesystem = Some(Filesystem {
            fstype,
            mount_path: Some(path.to_owned()),
            label: None,
            uuid: Some(format!("uuid-{n}")),
            mount_by: None,
        });
        self
    }

    fn mount_by(mut self, mount_by: MountBy) -> Self {
        if let Some(f) = self.dev().filesystem.as_mut() {
            f.mount_by = Some(mount_by);
        }
        self
    }

    fn fs_label(mut self, label: &str) -> Self {
        if let Some(f) = self.dev().filesystem.as_mut() {
            f.label = Some(label.to_owned());
        }
        self
    }

    fn pkind(mut self, kind: PartitionKind) -> Self {
        if let Some(p) = self.dev().partition.as_mut() {
            p.kind = kind;
            if kind == PartitionKind::Extended {
                p.id = PartitionId::Extended;
            }
        }
        self
    }

    fn pid(mut self, id: PartitionId) -> Self {
        if let Some(p) = self.dev().partition.as_mut() {
            p.id = id;
        }
        self
    }

    fn boot_flag(mut self) -> Self {
        if let Some(p) = self.dev().partition.as_mut() {
            p.boot = true;
        }
        self
    }

    fn legacy_boot_flag(mut self) -> Self {
        if let Some(p) = self.dev().partition.as_mut() {
            p.legacy_boot = true;
        }
        self
    }

    fn bios_id(mut self, id: &str) -> Self {
        self.dev().bios_id = Some(id.to_owned());
        self
    }

    fn by_id(mut self, link: &str) -> Self {
        self.dev().udev.by_id.push(link.to_owned());
        self
    }

    fn planned(mut self) -> Self {
        self.dev().exists_in_probed = false;
        self
    }
}

impl DeviceFixture for BlockDevice {
    fn dev(&mut self) -> &mut BlockDevice {
        self
    }
}

pub(crate) fn graph(devices: Vec<BlockDevice>) -> DeviceGraph {
    let g = DeviceGraph {
        revision: 1,
        devices,
        network_mounts: Vec::new(),
    };
    g.validate().unwrap();
    g
}

/// Single msdos disk, separate /boot on the first partition.
pub(crate) fn single_disk_separate_boot() -> DeviceGraph {
    graph(vec![
        disk("/dev/sda", Some(LabelType::Msdos)).by_id("/dev/disk/by-id/ata-DISK_A"),
        part("/dev/sda", 1)
            .mounted("/boot", FsType::Ext4)
            .by_id("/dev/disk/by-id/ata-DISK_A-part1"),
        part("/dev/sda", 2).mounted("/", FsType::Ext4),
        part("/dev/sda", 3).pid(PartitionId::Swap),
    ])
}

/// /boot and / on software RAID1 over two msdos disks.
pub(crate) fn raid1_boot() -> DeviceGraph {
    graph(vec![
        disk("/dev/sda", Some(LabelType::Msdos)),
        disk("/dev/sdb", Some(LabelType::Msdos)),
        part("/dev/sda", 1).pid(PartitionId::Raid),
        part("/dev/sda", 2).pid(PartitionId::Raid),
        part("/dev/sdb", 1).pid(PartitionId::Raid),
        part("/dev/sdb", 2).pid(PartitionId::Raid),
        virt("/dev/md0", DeviceKind::MdRaid, &["/dev/sda1", "/dev/sdb1"])
            .mounted("/boot", FsType::Ext4),
        virt("/dev/md1", DeviceKind::MdRaid, &["/dev/sda2", "/dev/sdb2"])
            .mounted("/", FsType::Ext4),
    ])
}

/// Ten plain disks; / on the fifth.
pub(crate) fn ten_disks() -> DeviceGraph {
    let mut devices = Vec::new();
    for c in 'a'..='j' {
        devices.push(disk(&format!("/dev/sd{c}"), Some(LabelType::Msdos)));
    }
    devices.push(part("/dev/sde", 1).mounted("/", FsType::Ext4));
    graph(devices)
}

/// PowerPC GPT disk with an existing and a planned PReP partition.
pub(crate) fn ppc_two_prep() -> DeviceGraph {
    graph(vec![
        disk("/dev/sda", Some(LabelType::Gpt)),
        part("/dev/sda", 1).pid(PartitionId::Prep),
        part("/dev/sda", 2).pid(PartitionId::Prep).planned(),
        part("/dev/sda", 3).mounted("/", FsType::Xfs),
    ])
}

/// Separate /boot on XFS.
pub(crate) fn xfs_boot() -> DeviceGraph {
    graph(vec![
        disk("/dev/sda", Some(LabelType::Msdos)),
        part("/dev/sda", 1).mounted("/boot", FsType::Xfs),
        part("/dev/sda", 2).mounted("/", FsType::Ext4),
    ])
}

/// A fake executor recording each command line; commands starting with
/// one of the `failing` prefixes exit 1.
#[derive(Debug, Default)]
pub(crate) struct RecordingExecutor {
    pub(crate) commands: RefCell<Vec<String>>,
    failing: Vec<String>,
}

impl RecordingExecutor {
    pub(crate) fn failing(prefixes: &[&str]) -> Self {
        Self {
            commands: Default::default(),
            failing: prefixes.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl Executor for RecordingExecutor {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let fail = self.failing.iter().any(|f| line.starts_with(f.as_str()));
        self.commands.borrow_mut().push(line);
        Ok(CmdOutput {
            exit_code: Some(if fail { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if fail { "simulated failure".into() } else { String::new() },
        })
    }
}
