//! # Bootloader stage1 placement
//!
//! This crate decides where the first stage of a BIOS-style bootloader
//! is written on a Linux system (MBR, a partition boot record, the
//! extended partition, or a PReP partition), proposes the BIOS disk
//! order, and performs the supporting disk writes: boot-record backups,
//! the generic MBR, and partition activation flags.

mod arch;
mod backup;
mod cache;
pub mod cli;
mod config;
mod device_map;
mod devicegraph;
mod disk_change;
mod error;
mod mbr_update;
mod pmbr;
mod probe;
mod proposal;
mod stage1;
mod stage1_device;
mod storage;
mod udev;

#[cfg(test)]
mod testutil;

pub use arch::{ArchFamily, Architecture};
pub use backup::{BootRecordBackup, BOOT_CODE_SIZE, BOOT_RECORD_SIZE};
pub use cache::RevisionCache;
pub use config::{BackupConfig, Config, ExecConfig, FilesConfig, MbrPayloads};
pub use device_map::{BiosSlot, DeviceMap, BIOS_LIMIT};
pub use devicegraph::{
    BlockDevice, DeviceGraph, DeviceKind, Filesystem, FsType, LabelType, MountBy, PartitionId,
    PartitionInfo, PartitionKind, UdevLinks,
};
pub use disk_change::{invalid_devices, is_possible_location, DiskChangeDetector};
pub use error::Stage1Error;
pub use mbr_update::{Activation, MbrUpdate};
pub use pmbr::{gpt_disks, pmbr_setup};
pub use probe::probe;
pub use stage1::{Location, PmbrAction, Stage1, Stage1State};
pub use stage1_device::{Resolution, UnderlyingDeviceResolver};
pub use storage::{BootFacts, BootStorage};
pub use udev::{normalize_device_ref, UdevMapping};
