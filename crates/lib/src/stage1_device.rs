//! Peeling virtual storage layers down to the devices a boot record can
//! live on.
//!
//! A boot record has to be written to a real partition or disk. For a
//! filesystem on LVM, MD RAID or an encrypted device, the boot code must
//! go onto the devices underneath instead.

use crate::devicegraph::{BlockDevice, DeviceGraph, DeviceKind};

/// The real devices backing a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every layer was understood.
    FullyResolved(Vec<String>),
    /// Some layer could not be peeled; it is kept in `devices` as is so
    /// the caller can still make a conservative choice.
    PartiallyResolved {
        /// Real devices found, plus the unsupported layer itself
        devices: Vec<String>,
        /// Description of the layer which stopped resolution
        unsupported: String,
    },
}

impl Resolution {
    /// The resolved devices, regardless of completeness.
    pub fn devices(&self) -> &[String] {
        match self {
            Self::FullyResolved(d) => d,
            Self::PartiallyResolved { devices, .. } => devices,
        }
    }

    /// Whether every layer was resolved.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::FullyResolved(_))
    }
}

enum Layer<'a> {
    Real,
    Virtual(Vec<&'a BlockDevice>),
    Unsupported(String),
}

/// Maps devices of one inventory to the partitions and disks below them.
#[derive(Debug, Clone, Copy)]
pub struct UnderlyingDeviceResolver<'a> {
    graph: &'a DeviceGraph,
}

impl<'a> UnderlyingDeviceResolver<'a> {
    /// Resolve devices of `graph`.
    pub fn new(graph: &'a DeviceGraph) -> Self {
        Self { graph }
    }

    /// Resolve the kernel device `dev` to the real partitions or disks
    /// backing it. Unknown devices resolve to themselves.
    pub fn resolve(&self, dev: &str) -> Resolution {
        let Some(dev) = self.graph.find_by_name(dev) else {
            tracing::warn!("Resolving {dev}: not in inventory");
            return Resolution::PartiallyResolved {
                devices: vec![dev.to_owned()],
                unsupported: format!("{dev} is unknown"),
            };
        };
        let mut devices = Vec::new();
        let mut unsupported = None;
        self.peel(dev, &mut devices, &mut unsupported);
        match unsupported {
            None => Resolution::FullyResolved(devices),
            Some(unsupported) => {
                tracing::debug!("Partial resolution of {}: {unsupported}", dev.name);
                Resolution::PartiallyResolved {
                    devices,
                    unsupported,
                }
            }
        }
    }

    /// The disks holding the given real devices, deduplicated in order.
    pub fn disks_of(&self, devices: &[String]) -> Vec<String> {
        let mut r: Vec<String> = Vec::new();
        for name in devices {
            let disk = match self.graph.find_by_name(name) {
                Some(d) if d.kind == DeviceKind::Partition => self
                    .graph
                    .partitionable_of(d)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| name.clone()),
                _ => name.clone(),
            };
            if !r.contains(&disk) {
                r.push(disk);
            }
        }
        r
    }

    /// Shorthand for the disks below `dev`.
    pub fn disks(&self, dev: &str) -> Vec<String> {
        self.disks_of(self.resolve(dev).devices())
    }

    fn peel(&self, dev: &'a BlockDevice, out: &mut Vec<String>, unsupported: &mut Option<String>) {
        match self.layer(dev) {
            Layer::Real => push_unique(out, &dev.name),
            Layer::Virtual(parents) if parents.is_empty() => {
                tracing::warn!("{} has no underlying devices", dev.name);
                push_unique(out, &dev.name);
            }
            Layer::Virtual(parents) => {
                for p in parents {
                    self.peel(p, out, unsupported);
                }
            }
            Layer::Unsupported(why) => {
                unsupported.get_or_insert(why);
                push_unique(out, &dev.name);
            }
        }
    }

    fn layer(&self, dev: &'a BlockDevice) -> Layer<'a> {
        let parents = self.graph.parents_of(dev);
        match dev.kind {
            DeviceKind::Disk | DeviceKind::BiosRaid | DeviceKind::Multipath => Layer::Real,
            DeviceKind::Partition => match parents.first() {
                Some(p) if !p.kind.is_disk_like() => {
                    Layer::Unsupported(format!("{} is a partition of {}", dev.name, p.name))
                }
                _ => Layer::Real,
            },
            DeviceKind::MdRaid => {
                if let Some(nested) = parents.iter().find(|p| p.kind == DeviceKind::MdRaid) {
                    Layer::Unsupported(format!("{} is nested on RAID {}", dev.name, nested.name))
                } else {
                    Layer::Virtual(parents)
                }
            }
            DeviceKind::LvmVg | DeviceKind::LvmLv => {
                // Boot code cannot go onto physical volumes spanning a whole
                // disk; only partitions are usable.
                let (usable, whole): (Vec<_>, Vec<_>) =
                    parents.into_iter().partition(|p| !p.kind.is_disk_like());
                for w in &whole {
                    tracing::debug!("Skipping whole-disk physical volume {}", w.name);
                }
                if usable.is_empty() && !whole.is_empty() {
                    Layer::Unsupported(format!("{} is on whole-disk physical volumes", dev.name))
                } else {
                    Layer::Virtual(usable)
                }
            }
            DeviceKind::Encryption => Layer::Virtual(parents),
            DeviceKind::Other => Layer::Unsupported(format!("unknown layer {}", dev.name)),
        }
    }
}

fn push_unique(v: &mut Vec<String>, s: &str) {
    if !v.iter().any(|e| e == s) {
        v.push(s.to_owned());
    }
}
