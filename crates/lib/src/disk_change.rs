//! Noticing when storage changes invalidate a chosen stage1 location.

use anyhow::Result;

use crate::devicegraph::{DeviceKind, PartitionId};
use crate::stage1::{Location, Stage1};
use crate::storage::BootStorage;

/// Snapshot of the boot layout at the time a stage1 location was chosen.
#[derive(Debug, Clone)]
pub struct DiskChangeDetector {
    revision: u64,
    selected: Vec<(Location, Option<String>)>,
    custom: Vec<String>,
}

fn location_device(storage: &BootStorage, location: Location) -> Option<String> {
    let facts = storage.facts();
    match location {
        Location::Boot => facts.boot_partition.clone(),
        Location::Root => facts.root_partition.clone(),
        Location::Mbr => storage.mbr_disk().map(|s| s.to_owned()),
        Location::Extended => facts.extended_partition.clone(),
    }
}

fn location_label(location: Location) -> &'static str {
    match location {
        Location::Boot => "\"/boot\"",
        Location::Root => "\"/\"",
        Location::Mbr => "MBR",
        Location::Extended => "\"extended partition\"",
    }
}

impl DiskChangeDetector {
    /// Record which locations `stage1` covers on `storage`.
    pub fn new(storage: &BootStorage, stage1: &Stage1) -> Result<Self> {
        let mut selected = Vec::new();
        for (loc, covered) in [
            (Location::Boot, stage1.is_boot_partition(storage)?),
            (Location::Root, stage1.is_root_partition(storage)?),
            (Location::Mbr, stage1.is_mbr(storage)?),
            (Location::Extended, stage1.is_extended_partition(storage)?),
        ] {
            if covered {
                selected.push((loc, location_device(storage, loc)));
            }
        }
        Ok(Self {
            revision: storage.graph().revision,
            selected,
            custom: stage1.custom_devices(storage)?,
        })
    }

    /// Human readable descriptions of what no longer holds on `current`.
    pub fn changes(&self, current: &BootStorage) -> Vec<String> {
        if current.graph().revision == self.revision {
            return Vec::new();
        }
        let mut r = Vec::new();
        for (loc, recorded) in &self.selected {
            let now = location_device(current, *loc);
            if now != *recorded {
                r.push(format!(
                    "Selected bootloader location {} is not on {} any more.",
                    location_label(*loc),
                    now.as_deref().unwrap_or("any device")
                ));
            }
        }
        for dev in &self.custom {
            if !is_possible_location(current, dev) {
                r.push(format!(
                    "Selected custom bootloader partition {dev} is not available any more."
                ));
            }
        }
        for m in &r {
            tracing::warn!("{m}");
        }
        r
    }
}

/// Whether `dev` resolves to a partition or disk able to hold stage1.
pub fn is_possible_location(storage: &BootStorage, dev: &str) -> bool {
    let Ok(found) = storage.udev().device(dev) else {
        return false;
    };
    match found.kind {
        DeviceKind::Partition => found
            .partition
            .as_ref()
            .is_some_and(|p| !matches!(p.id, PartitionId::Swap | PartitionId::BiosBoot)),
        k => k.is_disk_like(),
    }
}

/// Stored stage1 devices which are unknown or unusable on `storage`.
pub fn invalid_devices(storage: &BootStorage, stage1: &Stage1) -> Vec<String> {
    stage1
        .devices()
        .iter()
        .filter(|d| !is_possible_location(storage, d))
        .cloned()
        .collect()
}
