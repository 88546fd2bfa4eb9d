//! Facts about where the system boots from.

use anyhow::Result;

use crate::arch::Architecture;
use crate::cache::RevisionCache;
use crate::devicegraph::{BlockDevice, DeviceGraph, DeviceKind, FsType};
use crate::error::Stage1Error;
use crate::stage1_device::UnderlyingDeviceResolver;
use crate::udev::UdevMapping;

/// Boot-relevant data derived from an inventory. All device names are
/// kernel names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFacts {
    /// Revision of the inventory these facts were computed from
    pub revision: u64,
    /// Device holding `/`
    pub root_partition: Option<String>,
    /// Device holding `/boot`; the root device when `/boot` is not separate
    pub boot_partition: Option<String>,
    /// Whether `/boot` is a filesystem of its own
    pub separated_boot: bool,
    /// Real devices below the boot partition
    pub boot_devices: Vec<String>,
    /// Disks below the boot partition
    pub boot_disks: Vec<String>,
    /// Disks below the root partition
    pub root_disks: Vec<String>,
    /// Whether every layer below the boot partition was understood
    pub boot_fully_resolved: bool,
    /// Set when the boot partition is a logical partition
    pub extended_partition: Option<String>,
    /// Filesystem type of `/boot`
    pub boot_fs: Option<FsType>,
    /// Whether `/boot` is served over the network
    pub boot_fs_network: bool,
}

impl BootFacts {
    /// Compute the facts for `graph`.
    pub fn compute(graph: &DeviceGraph) -> Self {
        let resolver = UnderlyingDeviceResolver::new(graph);
        let root = graph.mounted_at("/");
        let boot_mount = graph.mounted_at("/boot");
        let boot = boot_mount.or(root);
        let separated_boot = boot_mount.is_some() && boot_mount != root;
        let boot_path = if boot_mount.is_some() || graph.is_network_mount("/boot") {
            "/boot"
        } else {
            "/"
        };
        let resolution = boot.map(|b| resolver.resolve(&b.name));
        let boot_devices = resolution
            .as_ref()
            .map(|r| r.devices().to_vec())
            .unwrap_or_default();
        let boot_disks = resolver.disks_of(&boot_devices);
        let root_disks = root.map(|r| resolver.disks(&r.name)).unwrap_or_default();
        let extended_partition = boot_devices
            .first()
            .and_then(|d| graph.find_by_name(d))
            .filter(|d| d.is_logical())
            .and_then(|d| graph.partitionable_of(d))
            .and_then(|disk| graph.extended_partition_of(&disk.name))
            .map(|e| e.name.clone());
        let facts = Self {
            revision: graph.revision,
            root_partition: root.map(|d| d.name.clone()),
            boot_partition: boot.map(|d| d.name.clone()),
            separated_boot,
            boot_devices,
            boot_disks,
            root_disks,
            boot_fully_resolved: resolution.is_some_and(|r| r.is_complete()),
            extended_partition,
            boot_fs: boot.and_then(|b| b.filesystem.as_ref()).map(|f| f.fstype),
            boot_fs_network: graph.is_network_mount(boot_path),
        };
        tracing::debug!("Boot facts: {facts:?}");
        facts
    }
}

/// An inventory plus the boot facts derived from it, for one architecture.
#[derive(Debug, Clone)]
pub struct BootStorage<'a> {
    graph: &'a DeviceGraph,
    arch: Architecture,
    facts: BootFacts,
}

impl<'a> BootStorage<'a> {
    /// Compute the boot facts of `graph`.
    pub fn new(graph: &'a DeviceGraph, arch: Architecture) -> Self {
        Self {
            graph,
            arch,
            facts: BootFacts::compute(graph),
        }
    }

    /// Like [`Self::new`], reusing facts computed for the same inventory
    /// revision.
    pub fn with_cache(
        graph: &'a DeviceGraph,
        arch: Architecture,
        cache: &mut RevisionCache<BootFacts>,
    ) -> Result<Self> {
        let facts = cache.get_or_try_insert_with(graph.revision, || Ok(BootFacts::compute(graph)))?;
        Ok(Self { graph, arch, facts })
    }

    /// The inventory.
    pub fn graph(&self) -> &'a DeviceGraph {
        self.graph
    }

    /// The target architecture.
    pub fn arch(&self) -> Architecture {
        self.arch
    }

    /// Boot facts of the inventory.
    pub fn facts(&self) -> &BootFacts {
        &self.facts
    }

    /// Name resolution over the inventory.
    pub fn udev(&self) -> UdevMapping<'a> {
        UdevMapping::new(self.graph)
    }

    /// Underlying device resolution over the inventory.
    pub fn resolver(&self) -> UnderlyingDeviceResolver<'a> {
        UnderlyingDeviceResolver::new(self.graph)
    }

    /// The boot partition, failing when neither `/boot` nor `/` is on a
    /// local device.
    pub fn boot_partition(&self) -> Result<&'a BlockDevice> {
        self.facts
            .boot_partition
            .as_deref()
            .and_then(|n| self.graph.find_by_name(n))
            .ok_or_else(|| Stage1Error::NoBootLocation("no local /boot or / filesystem".into()).into())
    }

    /// The disk whose MBR is the primary candidate for stage1.
    pub fn mbr_disk(&self) -> Option<&str> {
        self.facts.boot_disks.first().map(|s| s.as_str())
    }

    /// Whether stage1 may be written into the boot partition's own boot
    /// record.
    pub fn can_use_boot(&self) -> bool {
        let Ok(boot) = self.boot_partition() else {
            return false;
        };
        // XFS keeps its superblock in the first sector.
        if self.facts.boot_fs == Some(FsType::Xfs) {
            tracing::debug!("Cannot use /boot boot record: XFS");
            return false;
        }
        let on_lvm =
            matches!(boot.kind, DeviceKind::LvmLv | DeviceKind::LvmVg) || self.lvm_below(boot);
        if on_lvm {
            tracing::debug!("Cannot use /boot boot record: on LVM");
            return false;
        }
        let all_partitions = !self.facts.boot_devices.is_empty()
            && self.facts.boot_devices.iter().all(|d| {
                self.graph
                    .find_by_name(d)
                    .is_some_and(|d| d.kind == DeviceKind::Partition)
            });
        if !all_partitions {
            tracing::debug!("Cannot use /boot boot record: not on partitions");
        }
        all_partitions
    }

    fn lvm_below(&self, dev: &BlockDevice) -> bool {
        self.graph.parents_of(dev).into_iter().any(|p| {
            matches!(p.kind, DeviceKind::LvmLv | DeviceKind::LvmVg) || self.lvm_below(p)
        })
    }

    /// Whether a disk uses a GPT partition table.
    pub fn is_gpt(&self, disk: &str) -> bool {
        self.graph
            .find_by_name(disk)
            .is_some_and(|d| d.label == Some(crate::devicegraph::LabelType::Gpt))
    }
}
