//! The storage inventory the placement logic operates on.
//!
//! A [`DeviceGraph`] is a flat list of block devices, each naming the
//! devices it is built from (`parents`). Partitions name their disk,
//! an MD RAID names its members, an LVM logical volume names its volume
//! group, and so on. The graph is either produced by [`crate::probe`]
//! or loaded from a JSON description.

use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// What a block device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// A physical disk, or a loop device
    Disk,
    /// A partition of a disk-like device
    Partition,
    /// Linux software RAID
    MdRaid,
    /// Firmware ("fake") RAID; acts as a disk from the bootloader's view
    BiosRaid,
    /// A device-mapper multipath device over several path devices
    Multipath,
    /// LVM volume group
    LvmVg,
    /// LVM logical volume
    LvmLv,
    /// A dm-crypt/LUKS mapping
    Encryption,
    /// Anything else
    Other,
}

impl DeviceKind {
    /// Whether the device carries its own boot sector and partition table.
    pub fn is_disk_like(self) -> bool {
        matches!(self, Self::Disk | Self::BiosRaid | Self::Multipath)
    }
}

/// Partition table type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    /// GUID partition table
    Gpt,
    /// Classic DOS partition table
    #[serde(alias = "dos")]
    Msdos,
}

/// Position of a partition in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// One of the (at most four) msdos primary slots, or any GPT partition
    #[default]
    Primary,
    /// The msdos container for logical partitions
    Extended,
    /// A partition inside the extended partition
    Logical,
}

/// The partition type, reduced to the values placement cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionId {
    /// Linux filesystem data
    #[default]
    Linux,
    /// Linux swap
    Swap,
    /// PowerPC PReP boot
    Prep,
    /// GRUB BIOS boot partition on GPT
    BiosBoot,
    /// EFI system partition
    Esp,
    /// LVM physical volume
    Lvm,
    /// Linux RAID member
    Raid,
    /// msdos extended partition
    Extended,
    /// Anything else
    #[serde(other)]
    Other,
}

/// Partition-specific data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionInfo {
    /// Partition number, starting at 1
    pub number: u32,
    /// Primary, extended or logical
    #[serde(default)]
    pub kind: PartitionKind,
    /// Partition type
    #[serde(default)]
    pub id: PartitionId,
    /// The msdos "active" flag
    #[serde(default)]
    pub boot: bool,
    /// The GPT legacy BIOS bootable attribute
    #[serde(default)]
    pub legacy_boot: bool,
}

impl PartitionInfo {
    /// Whether the partition carries the bootable flag matching `label`.
    pub fn is_flagged(&self, label: Option<LabelType>) -> bool {
        match label {
            Some(LabelType::Gpt) => self.legacy_boot,
            Some(LabelType::Msdos) => self.boot,
            None => false,
        }
    }
}

/// Filesystem types placement distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    /// ext2
    Ext2,
    /// ext3
    Ext3,
    /// ext4
    Ext4,
    /// btrfs
    Btrfs,
    /// XFS
    Xfs,
    /// FAT
    Vfat,
    /// Swap space
    Swap,
    /// Anything else
    #[serde(other)]
    Other,
}

impl FsType {
    /// Map a blkid/lsblk filesystem name.
    pub fn from_blkid(s: &str) -> Self {
        match s {
            "ext2" => Self::Ext2,
            "ext3" => Self::Ext3,
            "ext4" => Self::Ext4,
            "btrfs" => Self::Btrfs,
            "xfs" => Self::Xfs,
            "vfat" => Self::Vfat,
            "swap" => Self::Swap,
            _ => Self::Other,
        }
    }
}

/// How a filesystem is referenced in persistent configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountBy {
    /// Kernel device name
    Device,
    /// `/dev/disk/by-uuid`
    Uuid,
    /// `/dev/disk/by-label`
    Label,
    /// `/dev/disk/by-id`
    Id,
    /// `/dev/disk/by-path`
    Path,
}

/// A filesystem residing directly on a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    /// Filesystem type
    #[serde(rename = "type")]
    pub fstype: FsType,
    /// Where it is mounted, if anywhere
    pub mount_path: Option<String>,
    /// Filesystem label
    pub label: Option<String>,
    /// Filesystem UUID
    pub uuid: Option<String>,
    /// The configured reference style, if any
    pub mount_by: Option<MountBy>,
}

/// Persistent udev links of a device, as absolute paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UdevLinks {
    /// `/dev/disk/by-id/...`
    #[serde(default)]
    pub by_id: Vec<String>,
    /// `/dev/disk/by-path/...`
    #[serde(default)]
    pub by_path: Vec<String>,
    /// Any other name resolving to this device, e.g. `/dev/md/boot`
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// A single block device of the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockDevice {
    /// Kernel device name, e.g. `/dev/sda1`
    pub name: String,
    /// What the device is
    pub kind: DeviceKind,
    /// Names of the devices this one is built from
    #[serde(default)]
    pub parents: Vec<String>,
    /// Set for partitions
    #[serde(default)]
    pub partition: Option<PartitionInfo>,
    /// Partition table of a disk-like device
    #[serde(default)]
    pub label: Option<LabelType>,
    /// Firmware-reported BIOS id, e.g. `0x80`
    #[serde(default)]
    pub bios_id: Option<String>,
    /// Persistent links
    #[serde(default)]
    pub udev: UdevLinks,
    /// Filesystem directly on the device
    #[serde(default)]
    pub filesystem: Option<Filesystem>,
    /// False for devices planned but not yet created on disk
    #[serde(default = "default_true")]
    pub exists_in_probed: bool,
}

impl BlockDevice {
    /// A device with only a name and kind set.
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parents: Vec::new(),
            partition: None,
            label: None,
            bios_id: None,
            udev: UdevLinks::default(),
            filesystem: None,
            exists_in_probed: true,
        }
    }

    /// `/dev/disk/by-uuid/...` for the filesystem on this device.
    pub fn uuid_path(&self) -> Option<String> {
        let uuid = self.filesystem.as_ref()?.uuid.as_deref()?;
        Some(format!("/dev/disk/by-uuid/{uuid}"))
    }

    /// `/dev/disk/by-label/...` for the filesystem on this device.
    pub fn label_path(&self) -> Option<String> {
        let label = self.filesystem.as_ref()?.label.as_deref()?;
        Some(format!("/dev/disk/by-label/{label}"))
    }

    /// The name of this device in the given style, if it has one.
    pub fn path_for_mount_by(&self, mount_by: MountBy) -> Option<String> {
        match mount_by {
            MountBy::Device => Some(self.name.clone()),
            MountBy::Uuid => self.uuid_path(),
            MountBy::Label => self.label_path(),
            MountBy::Id => self.udev.by_id.first().cloned(),
            MountBy::Path => self.udev.by_path.first().cloned(),
        }
    }

    /// Whether `name` refers to this device by kernel name or any alias.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name
            || self.udev.by_id.iter().any(|l| l == name)
            || self.udev.by_path.iter().any(|l| l == name)
            || self.udev.aliases.iter().any(|l| l == name)
            || self.uuid_path().as_deref() == Some(name)
            || self.label_path().as_deref() == Some(name)
    }

    /// Partition number, if this is a partition.
    pub fn partition_number(&self) -> Option<u32> {
        self.partition.as_ref().map(|p| p.number)
    }

    /// Whether this is a logical partition.
    pub fn is_logical(&self) -> bool {
        self.partition
            .as_ref()
            .is_some_and(|p| p.kind == PartitionKind::Logical)
    }
}

/// The whole storage inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceGraph {
    /// Changes whenever the underlying storage changes; consumers use it
    /// to invalidate derived data.
    #[serde(default)]
    pub revision: u64,
    /// All block devices; names are unique
    pub devices: Vec<BlockDevice>,
    /// Mount points backed by network filesystems (e.g. NFS)
    #[serde(default)]
    pub network_mounts: Vec<String>,
}

impl DeviceGraph {
    /// Parse and validate a JSON inventory.
    pub fn from_json(buf: &str) -> Result<Self> {
        let graph: Self = serde_json::from_str(buf).context("Parsing device graph")?;
        graph.validate()?;
        Ok(graph)
    }

    /// Load a JSON inventory from a file.
    #[context("Loading device graph from {path}")]
    pub fn from_file(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::from_json(&buf)
    }

    /// Check that names are unique and all parents exist.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for dev in &self.devices {
            if !seen.insert(dev.name.as_str()) {
                anyhow::bail!("Duplicate device {}", dev.name);
            }
        }
        for dev in &self.devices {
            for parent in &dev.parents {
                if !seen.contains(parent.as_str()) {
                    anyhow::bail!("Device {} has unknown parent {parent}", dev.name);
                }
            }
            if dev.kind == DeviceKind::Partition && dev.partition.is_none() {
                anyhow::bail!("Partition {} lacks partition data", dev.name);
            }
        }
        Ok(())
    }

    /// Find a device by exact kernel name.
    pub fn find_by_name(&self, name: &str) -> Option<&BlockDevice> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Find a device by kernel name or any persistent alias; the kernel
    /// name wins over aliases of other devices.
    pub fn find_by_any_name(&self, name: &str) -> Option<&BlockDevice> {
        self.find_by_name(name)
            .or_else(|| self.devices.iter().find(|d| d.answers_to(name)))
    }

    /// The devices built directly on top of `name`.
    pub fn children(&self, name: &str) -> impl Iterator<Item = &BlockDevice> + '_ {
        let name = name.to_owned();
        self.devices
            .iter()
            .filter(move |d| d.parents.contains(&name))
    }

    /// All devices built (transitively) on top of `name`, nearest first.
    pub fn descendants(&self, name: &str) -> Vec<&BlockDevice> {
        let mut seen = BTreeSet::new();
        let mut queue = vec![name];
        let mut r = Vec::new();
        while !queue.is_empty() {
            let mut next = Vec::new();
            for n in queue {
                for child in self.children(n) {
                    if seen.insert(child.name.as_str()) {
                        r.push(child);
                        next.push(child.name.as_str());
                    }
                }
            }
            queue = next;
        }
        r
    }

    /// The devices `dev` is built from.
    pub fn parents_of(&self, dev: &BlockDevice) -> Vec<&BlockDevice> {
        dev.parents
            .iter()
            .filter_map(|p| self.find_by_name(p))
            .collect()
    }

    /// The partitionable device holding a partition.
    pub fn partitionable_of(&self, partition: &BlockDevice) -> Option<&BlockDevice> {
        self.parents_of(partition).into_iter().next()
    }

    /// Partitions of a disk, ordered by number.
    pub fn partitions_of(&self, disk: &str) -> Vec<&BlockDevice> {
        let mut r: Vec<_> = self
            .children(disk)
            .filter(|d| d.kind == DeviceKind::Partition)
            .collect();
        r.sort_by_key(|d| d.partition_number());
        r
    }

    /// The extended partition of a disk, if any.
    pub fn extended_partition_of(&self, disk: &str) -> Option<&BlockDevice> {
        self.partitions_of(disk).into_iter().find(|p| {
            p.partition
                .as_ref()
                .is_some_and(|i| i.kind == PartitionKind::Extended)
        })
    }

    /// The device holding the filesystem mounted at `path`.
    pub fn mounted_at(&self, path: &str) -> Option<&BlockDevice> {
        self.devices.iter().find(|d| {
            d.filesystem
                .as_ref()
                .and_then(|f| f.mount_path.as_deref())
                == Some(path)
        })
    }

    /// Whether `path` is a network filesystem mount point.
    pub fn is_network_mount(&self, path: &str) -> bool {
        self.network_mounts.iter().any(|m| m == path)
    }

    /// All PReP boot partitions, in inventory order.
    pub fn prep_partitions(&self) -> Vec<&BlockDevice> {
        self.devices
            .iter()
            .filter(|d| {
                d.partition
                    .as_ref()
                    .is_some_and(|p| p.id == PartitionId::Prep)
            })
            .collect()
    }

    /// Devices the BIOS can see as disks: plain disks, firmware RAIDs and
    /// multipath devices, excluding the members of the latter two.
    pub fn disk_devices(&self) -> Vec<&BlockDevice> {
        self.devices
            .iter()
            .filter(|d| d.kind.is_disk_like())
            .filter(|d| {
                !self
                    .children(&d.name)
                    .any(|c| matches!(c.kind, DeviceKind::BiosRaid | DeviceKind::Multipath))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const GRAPH: &str = indoc! { r#"
        {
          "revision": 3,
          "devices": [
            { "name": "/dev/sda", "kind": "disk", "label": "msdos",
              "udev": { "by-id": ["/dev/disk/by-id/ata-DISK_A"] } },
            { "name": "/dev/sda1", "kind": "partition", "parents": ["/dev/sda"],
              "partition": { "number": 1, "boot": true },
              "filesystem": { "type": "ext4", "mount-path": "/boot", "uuid": "1111-aaaa" } },
            { "name": "/dev/sda2", "kind": "partition", "parents": ["/dev/sda"],
              "partition": { "number": 2, "kind": "extended", "id": "extended" } },
            { "name": "/dev/sda5", "kind": "partition", "parents": ["/dev/sda"],
              "partition": { "number": 5, "kind": "logical", "id": "some-new-id" },
              "filesystem": { "type": "zfs", "mount-path": "/", "label": "root" } },
            { "name": "/dev/sdb", "kind": "disk" },
            { "name": "/dev/sdc", "kind": "disk" },
            { "name": "/dev/mapper/mpatha", "kind": "multipath",
              "parents": ["/dev/sdb", "/dev/sdc"] }
          ],
          "network-mounts": ["/srv"]
        }
    "# };

    #[test]
    fn test_parse_and_query() -> Result<()> {
        let g = DeviceGraph::from_json(GRAPH)?;
        assert_eq!(g.revision, 3);
        let root = g.mounted_at("/").unwrap();
        assert_eq!(root.name, "/dev/sda5");
        assert!(root.is_logical());
        assert_eq!(root.partition.as_ref().unwrap().id, PartitionId::Other);
        assert_eq!(root.filesystem.as_ref().unwrap().fstype, FsType::Other);
        assert_eq!(
            g.find_by_any_name("/dev/disk/by-label/root").unwrap().name,
            "/dev/sda5"
        );
        assert_eq!(
            g.find_by_any_name("/dev/disk/by-uuid/1111-aaaa").unwrap().name,
            "/dev/sda1"
        );
        assert_eq!(
            g.find_by_any_name("/dev/disk/by-id/ata-DISK_A").unwrap().name,
            "/dev/sda"
        );
        assert!(g.find_by_any_name("/dev/sdz").is_none());
        let parts: Vec<_> = g.partitions_of("/dev/sda").iter().map(|d| d.name.as_str()).collect();
        assert_eq!(parts, ["/dev/sda1", "/dev/sda2", "/dev/sda5"]);
        assert_eq!(g.extended_partition_of("/dev/sda").unwrap().name, "/dev/sda2");
        assert!(g.is_network_mount("/srv"));
        assert!(!g.is_network_mount("/"));
        Ok(())
    }

    #[test]
    fn test_disk_devices() -> Result<()> {
        let g = DeviceGraph::from_json(GRAPH)?;
        let disks: Vec<_> = g.disk_devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(disks, ["/dev/sda", "/dev/mapper/mpatha"]);
        let desc: Vec<_> = g.descendants("/dev/sdb").iter().map(|d| d.name.as_str()).collect();
        assert_eq!(desc, ["/dev/mapper/mpatha"]);
        Ok(())
    }

    #[test]
    fn test_validate() {
        let bad = r#"{ "devices": [ { "name": "/dev/sda1", "kind": "partition",
            "parents": ["/dev/sda"], "partition": { "number": 1 } } ] }"#;
        let e = DeviceGraph::from_json(bad).unwrap_err();
        assert!(e.to_string().contains("unknown parent"));
        let dup = r#"{ "devices": [ { "name": "/dev/sda", "kind": "disk" },
            { "name": "/dev/sda", "kind": "disk" } ] }"#;
        assert!(DeviceGraph::from_json(dup).is_err());
    }
}
