//! Per-architecture stage1 placement rules.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::arch::ArchFamily;
use crate::device_map::{BiosSlot, DeviceMap};
use crate::devicegraph::{BlockDevice, FsType, LabelType};
use crate::error::Stage1Error;
use crate::stage1::{Location, PmbrAction, Stage1};
use crate::storage::BootStorage;

pub(crate) trait Proposal {
    fn propose(&self, storage: &BootStorage, device_map: &DeviceMap) -> Result<Stage1>;

    fn available_locations(&self, _storage: &BootStorage) -> Result<BTreeMap<Location, String>> {
        Ok(BTreeMap::new())
    }
}

pub(crate) fn for_family(family: ArchFamily) -> &'static dyn Proposal {
    match family {
        ArchFamily::X86 => &X86Proposal,
        ArchFamily::PowerPc => &PpcProposal,
        ArchFamily::S390 => &S390Proposal,
    }
}

/// Kernel devices a symbolic location stands for.
fn location_kernel_devices(storage: &BootStorage, location: Location) -> Vec<String> {
    let facts = storage.facts();
    let resolver = storage.resolver();
    match location {
        Location::Boot => facts.boot_devices.clone(),
        Location::Root => facts
            .root_partition
            .as_deref()
            .map(|r| resolver.resolve(r).devices().to_vec())
            .unwrap_or_default(),
        Location::Extended => facts.extended_partition.iter().cloned().collect(),
        Location::Mbr => facts.boot_disks.clone(),
    }
}

fn assign(storage: &BootStorage, location: Location) -> Result<Vec<String>> {
    let udev = storage.udev();
    let mut r: Vec<String> = Vec::new();
    for d in location_kernel_devices(storage, location) {
        let alias = udev.to_persistent_alias(&d);
        if !r.contains(&alias) {
            r.push(alias);
        }
    }
    if r.is_empty() {
        return Err(Stage1Error::NoBootLocation(format!("nothing to write for {location}")).into());
    }
    tracing::debug!("Location {location}: {r:?}");
    Ok(r)
}

/// Whether any partition on `disks` already carries the bootable flag.
fn any_flagged(storage: &BootStorage, disks: &[String]) -> bool {
    let graph = storage.graph();
    disks.iter().any(|disk| {
        let label = graph.find_by_name(disk).and_then(|d| d.label);
        graph.partitions_of(disk).iter().any(|p| {
            let flagged = p.partition.as_ref().is_some_and(|i| i.is_flagged(label));
            if flagged {
                tracing::debug!("{} is already flagged bootable", p.name);
            }
            flagged
        })
    })
}

#[derive(Debug)]
struct X86Proposal;

impl Proposal for X86Proposal {
    fn propose(&self, storage: &BootStorage, device_map: &DeviceMap) -> Result<Stage1> {
        storage.boot_partition()?;
        let facts = storage.facts();
        let graph = storage.graph();
        let udev = storage.udev();
        let hd0 = device_map
            .system_device_for(BiosSlot(0))
            .map(|d| udev.to_kernel_name(d).unwrap_or_else(|_| d.to_owned()));
        let boot_logical = facts
            .boot_devices
            .iter()
            .any(|d| graph.find_by_name(d).is_some_and(|d| d.is_logical()));

        let mut location = Location::Mbr;
        match facts.boot_disks.as_slice() {
            [disk] if hd0.as_deref() == Some(disk.as_str()) => {
                location = if facts.separated_boot {
                    Location::Boot
                } else {
                    Location::Root
                };
            }
            [disk] => tracing::debug!("/boot is on {disk}, which is not the first BIOS disk"),
            disks => tracing::debug!("/boot spans {} disks", disks.len()),
        }
        if location != Location::Mbr
            && facts.boot_fs == Some(FsType::Btrfs)
            && (boot_logical || facts.separated_boot)
        {
            tracing::debug!("btrfs /boot; using MBR");
            location = Location::Mbr;
        }
        if location != Location::Mbr && !storage.can_use_boot() {
            location = Location::Mbr;
        }

        let (location, activate, generic_mbr) = if location == Location::Mbr {
            (location, !any_flagged(storage, &facts.boot_disks), false)
        } else if boot_logical && facts.extended_partition.is_some() {
            (Location::Extended, true, true)
        } else {
            (location, true, true)
        };
        let pmbr_action = if facts.boot_disks.iter().any(|d| storage.is_gpt(d)) {
            PmbrAction::Add
        } else {
            PmbrAction::Nothing
        };
        let devices = assign(storage, location)?;
        Ok(Stage1::proposed(devices, activate, generic_mbr, pmbr_action))
    }

    fn available_locations(&self, storage: &BootStorage) -> Result<BTreeMap<Location, String>> {
        let facts = storage.facts();
        let mut r = BTreeMap::new();
        if storage.can_use_boot() {
            let (loc, dev) = if facts.separated_boot {
                (Location::Boot, facts.boot_partition.clone())
            } else {
                (Location::Root, facts.root_partition.clone())
            };
            if let Some(dev) = dev {
                r.insert(loc, dev);
            }
            if let Some(ext) = facts.extended_partition.clone() {
                r.insert(Location::Extended, ext);
            }
        }
        if let Some(mbr) = storage.mbr_disk() {
            r.insert(Location::Mbr, mbr.to_owned());
        }
        Ok(r)
    }
}

#[derive(Debug)]
struct PpcProposal;

impl Proposal for PpcProposal {
    fn propose(&self, storage: &BootStorage, _device_map: &DeviceMap) -> Result<Stage1> {
        let graph = storage.graph();
        let facts = storage.facts();
        let preps = graph.prep_partitions();
        let on_root_disk = |p: &BlockDevice| {
            graph
                .partitionable_of(p)
                .is_some_and(|d| facts.root_disks.contains(&d.name))
        };
        let chosen = preps
            .iter()
            .find(|p| !p.exists_in_probed)
            .or_else(|| preps.iter().find(|p| on_root_disk(**p)))
            .or_else(|| preps.first());
        let Some(prep) = chosen else {
            if facts.boot_fs_network {
                tracing::info!("No PReP partition, but /boot is on the network; nothing to install");
                return Ok(Stage1::proposed(Vec::new(), false, false, PmbrAction::Nothing));
            }
            return Err(Stage1Error::NoBootLocation("no PReP partition".into()).into());
        };
        tracing::debug!("Using PReP partition {}", prep.name);
        let gpt = graph
            .partitionable_of(prep)
            .is_some_and(|d| d.label == Some(LabelType::Gpt));
        let devices = vec![storage.udev().to_persistent_alias(&prep.name)];
        Ok(Stage1::proposed(devices, !gpt, false, PmbrAction::Nothing))
    }
}

#[derive(Debug)]
struct S390Proposal;

impl Proposal for S390Proposal {
    fn propose(&self, _storage: &BootStorage, _device_map: &DeviceMap) -> Result<Stage1> {
        Ok(Stage1::proposed(Vec::new(), false, false, PmbrAction::Nothing))
    }
}
