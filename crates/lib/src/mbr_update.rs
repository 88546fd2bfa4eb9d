//! Writing the generic MBR and setting partition boot flags.

use anyhow::Result;
use bootplace_utils::Executor;
use fn_error_context::context;

use crate::arch::ArchFamily;
use crate::backup::BootRecordBackup;
use crate::config::{BackupConfig, MbrPayloads};
use crate::device_map::DeviceMap;
use crate::devicegraph::{BlockDevice, DeviceKind, LabelType, PartitionId};
use crate::stage1::Stage1;
use crate::storage::BootStorage;

/// A partition to flag bootable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Activation {
    /// Kernel name of the disk
    pub disk: String,
    /// Partition number on `disk`
    pub number: u32,
}

/// Applies a [`Stage1`] configuration to the disks' system areas.
#[derive(Debug)]
pub struct MbrUpdate<'a> {
    storage: &'a BootStorage<'a>,
    device_map: &'a DeviceMap,
    executor: &'a dyn Executor,
    payloads: &'a MbrPayloads,
    backup: Option<&'a BackupConfig>,
}

impl<'a> MbrUpdate<'a> {
    /// Update the disks of `storage`, running commands through `executor`.
    pub fn new(
        storage: &'a BootStorage<'a>,
        device_map: &'a DeviceMap,
        executor: &'a dyn Executor,
        payloads: &'a MbrPayloads,
    ) -> Self {
        Self {
            storage,
            device_map,
            executor,
            payloads,
            backup: None,
        }
    }

    /// Back up every boot record about to be touched before writing.
    pub fn with_backups(self, config: &'a BackupConfig) -> Self {
        Self {
            backup: Some(config),
            ..self
        }
    }

    fn mbr_disk(&self) -> Result<&'a str> {
        self.storage
            .mbr_disk()
            .ok_or_else(|| anyhow::anyhow!("No MBR disk"))
    }

    /// Run the update. Returns `false` if any disk command failed; the
    /// remaining devices are still processed. Errors are reserved for
    /// failures which make continuing unsafe (backups, timeouts,
    /// unresolvable devices).
    #[context("Updating disk system area")]
    pub fn run(&self, stage1: &Stage1) -> Result<bool> {
        tracing::info!("Updating disk system area: {stage1}");
        if stage1.devices().is_empty() {
            tracing::info!("No stage1 devices; nothing to update");
            return Ok(true);
        }
        let mbr_disk = self.mbr_disk()?;
        let loader_devices = stage1.kernel_devices(&self.storage.udev())?;

        if let Some(config) = self.backup {
            self.create_backups(config, &loader_devices)?;
        }

        let mut ret = true;
        if stage1.generic_mbr() && !loader_devices.iter().any(|d| d == mbr_disk) {
            let payload = if self.storage.is_gpt(mbr_disk) {
                &self.payloads.payload_gpt
            } else {
                &self.payloads.payload_msdos
            };
            for disk in self.mbrs_to_rewrite(&loader_devices) {
                tracing::info!("Copying generic MBR code {payload} to {disk}");
                let input = format!("if={payload}");
                let output = format!("of={disk}");
                ret &= self.run_logged("dd", &["bs=440", "count=1", &input, &output])?;
            }
        }
        if stage1.activate() {
            for act in self.partitions_to_activate(&loader_devices) {
                ret &= self.activate(&act)?;
            }
        }
        if !ret {
            tracing::warn!("Some disk system area updates failed");
        }
        Ok(ret)
    }

    fn create_backups(&self, config: &BackupConfig, loader_devices: &[String]) -> Result<()> {
        let mbr_disk = self.mbr_disk()?;
        let mut targets = self.mbrs_to_rewrite(loader_devices);
        for d in loader_devices.iter().map(|s| s.as_str()).chain([mbr_disk]) {
            if !targets.iter().any(|t| t == d) {
                targets.push(d.to_owned());
            }
        }
        tracing::debug!("Backing up boot records of {targets:?}");
        for t in &targets {
            BootRecordBackup::new(t.as_str(), config).write(t == mbr_disk)?;
        }
        Ok(())
    }

    /// Loader devices, with the boot RAID added.
    fn boot_devices(&self, loader_devices: &[String]) -> Vec<String> {
        let mut devs: Vec<String> = Vec::new();
        if let Some(boot) = self.storage.facts().boot_partition.as_deref() {
            if self
                .storage
                .graph()
                .find_by_name(boot)
                .is_some_and(|d| d.kind == DeviceKind::MdRaid)
            {
                devs.push(boot.to_owned());
            }
        }
        for d in loader_devices {
            if !devs.contains(d) {
                devs.push(d.clone());
            }
        }
        devs
    }

    /// [`Self::boot_devices`] with RAIDs replaced by their members.
    fn base_devices(&self, loader_devices: &[String]) -> Vec<String> {
        let graph = self.storage.graph();
        let mut r: Vec<String> = Vec::new();
        for d in self.boot_devices(loader_devices) {
            let expanded = match graph.find_by_name(&d) {
                Some(md) if md.kind == DeviceKind::MdRaid && !md.parents.is_empty() => {
                    md.parents.clone()
                }
                _ => vec![d],
            };
            for e in expanded {
                if !r.contains(&e) {
                    r.push(e);
                }
            }
        }
        r
    }

    /// Disks whose MBR gets the generic boot code: the MBR disk, plus the
    /// other disks of a redundant boot setup which includes it.
    pub fn mbrs_to_rewrite(&self, loader_devices: &[String]) -> Vec<String> {
        let Ok(mbr_disk) = self.mbr_disk() else {
            return Vec::new();
        };
        let mbrs: Vec<String> = self
            .base_devices(loader_devices)
            .iter()
            .map(|d| {
                self.partition_to_activate(d)
                    .map(|a| a.disk)
                    .unwrap_or_else(|| mbr_disk.to_owned())
            })
            .collect();
        let mut r = vec![mbr_disk.to_owned()];
        if mbrs.iter().any(|d| d == mbr_disk) {
            for d in mbrs {
                if !r.contains(&d) {
                    r.push(d);
                }
            }
        }
        r
    }

    /// Partitions to flag bootable for the given loader devices, at most
    /// one per disk. A RAID resolves to its first member in BIOS order.
    pub fn partitions_to_activate(&self, loader_devices: &[String]) -> Vec<Activation> {
        let mut r: Vec<Activation> = Vec::new();
        for d in self.boot_devices(loader_devices) {
            let Some(a) = self.partition_to_activate(&d) else {
                continue;
            };
            match r.iter().find(|p| p.disk == a.disk) {
                Some(p) if p.number != a.number => tracing::warn!(
                    "Not activating partition {} of {}; partition {} is already chosen",
                    a.number,
                    a.disk,
                    p.number
                ),
                Some(_) => {}
                None => r.push(a),
            }
        }
        r
    }

    /// The member of an MD RAID whose disk comes first in BIOS order.
    fn first_ordered_member(&self, md: &'a BlockDevice) -> Option<&'a BlockDevice> {
        let graph = self.storage.graph();
        let members = graph.parents_of(md);
        members.into_iter().enumerate().min_by_key(|(i, m)| {
            let slot = graph
                .partitionable_of(m)
                .and_then(|disk| self.device_map.grub_device_for(&disk.name));
            // Unmapped disks sort last
            (slot.is_none(), slot, *i)
        })
        .map(|(_, m)| m)
    }

    /// The partition to flag for one loader device.
    pub fn partition_to_activate(&self, dev: &str) -> Option<Activation> {
        let graph = self.storage.graph();
        let Some(mut dev) = graph.find_by_name(dev) else {
            tracing::warn!("Cannot activate unknown device {dev}");
            return None;
        };
        if dev.kind == DeviceKind::MdRaid {
            dev = self.first_ordered_member(dev)?;
        }
        let (disk, number) = match dev.kind {
            DeviceKind::Partition => (graph.partitionable_of(dev)?, dev.partition_number()?),
            k if k.is_disk_like() => (dev, 0),
            _ => {
                tracing::warn!("Cannot activate {}: not a partition or disk", dev.name);
                return None;
            }
        };
        let candidates: Vec<_> = graph
            .partitions_of(&disk.name)
            .into_iter()
            .filter(|p| {
                p.partition.as_ref().is_some_and(|i| {
                    !matches!(
                        i.id,
                        PartitionId::Swap | PartitionId::BiosBoot | PartitionId::Prep
                    )
                })
            })
            .collect();
        let mut number = number;
        if number == 0 {
            let Some(first) = candidates.first() else {
                tracing::warn!("No partition to activate on {}", disk.name);
                return None;
            };
            number = first.partition_number()?;
            tracing::debug!("{} is a disk; using its partition {number}", disk.name);
        }
        if number > 4 && disk.label != Some(LabelType::Gpt) {
            let Some(ext) = graph.extended_partition_of(&disk.name) else {
                tracing::warn!(
                    "Partition {number} of {} is logical but there is no extended partition",
                    disk.name
                );
                return None;
            };
            number = ext.partition_number()?;
            tracing::debug!("Using extended partition {number} instead");
        }
        Some(Activation {
            disk: disk.name.clone(),
            number,
        })
    }

    fn activate(&self, act: &Activation) -> Result<bool> {
        let graph = self.storage.graph();
        let label = graph.find_by_name(&act.disk).and_then(|d| d.label);
        let gpt = label == Some(LabelType::Gpt);
        if gpt && matches!(self.storage.arch().family(), Ok(ArchFamily::PowerPc)) {
            tracing::debug!("Not activating on GPT disk {} on PowerPC", act.disk);
            return Ok(true);
        }
        let flag = if gpt { "legacy_boot" } else { "boot" };
        let mut ret = true;
        for p in graph.partitions_of(&act.disk) {
            let Some(info) = p.partition.as_ref() else {
                continue;
            };
            if info.number != act.number && info.is_flagged(label) {
                tracing::info!("Clearing {flag} flag of {}", p.name);
                let n = info.number.to_string();
                ret &= self.run_logged("parted", &["-s", &act.disk, "set", &n, flag, "off"])?;
            }
        }
        tracing::info!("Activating partition {} on {}", act.number, act.disk);
        let n = act.number.to_string();
        ret &= self.run_logged("parted", &["-s", &act.disk, "set", &n, flag, "on"])?;
        Ok(ret)
    }

    fn run_logged(&self, program: &str, args: &[&str]) -> Result<bool> {
        let out = self.executor.run(program, args)?;
        if !out.success() {
            tracing::error!(
                "{program} {} failed: exit={:?} stdout={:?} stderr={:?}",
                args.join(" "),
                out.exit_code,
                out.stdout.trim(),
                out.stderr.trim()
            );
        }
        Ok(out.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::device_map::BiosSlot;
    use crate::devicegraph::*;
    use crate::testutil::*;

    fn payloads() -> MbrPayloads {
        MbrPayloads {
            payload_msdos: "/p/mbr.bin".into(),
            payload_gpt: "/p/gptmbr.bin".into(),
        }
    }

    #[test]
    fn test_generic_mbr_and_activate() -> Result<()> {
        let g = single_disk_separate_boot();
        let s = BootStorage::new(&g, Architecture::X86_64);
        let map = DeviceMap::propose(&g, Architecture::X86_64, &s.facts().boot_disks)?;
        let st = Stage1::propose(&s, &map)?;
        let exec = RecordingExecutor::default();
        let p = payloads();
        assert!(MbrUpdate::new(&s, &map, &exec, &p).run(&st)?);
        assert_eq!(
            exec.commands(),
            [
                "dd bs=440 count=1 if=/p/mbr.bin of=/dev/sda",
                "parted -s /dev/sda set 1 boot on"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_no_generic_mbr_on_target() -> Result<()> {
        let g = single_disk_separate_boot();
        let s = BootStorage::new(&g, Architecture::X86_64);
        let map = DeviceMap::new();
        let st = Stage1::new()
            .with_device(&s, "/dev/sda")?
            .with_generic_mbr(true);
        let exec = RecordingExecutor::default();
        let p = payloads();
        assert!(MbrUpdate::new(&s, &map, &exec, &p).run(&st)?);
        assert!(exec.commands().is_empty());
        Ok(())
    }

    #[test]
    fn test_activation_clears_others() -> Result<()> {
        let g = graph(vec![
            disk("/dev/sda", Some(LabelType::Gpt)),
            part("/dev/sda", 1).pid(PartitionId::BiosBoot),
            part("/dev/sda", 2).pid(PartitionId::Swap),
            part("/dev/sda", 3).legacy_boot_flag(),
            part("/dev/sda", 4).mounted("/", FsType::Ext4),
        ]);
        let s = BootStorage::new(&g, Architecture::X86_64);
        let map = DeviceMap::new();
        let st = Stage1::new().with_device(&s, "/dev/sda4")?.with_activate(true);
        let exec = RecordingExecutor::default();
        let p = payloads();
        let u = MbrUpdate::new(&s, &map, &exec, &p);
        assert!(u.run(&st)?);
        assert_eq!(
            exec.commands(),
            [
                "parted -s /dev/sda set 3 legacy_boot off",
                "parted -s /dev/sda set 4 legacy_boot on"
            ]
        );
        // A whole disk activates its first ordinary partition
        assert_eq!(
            u.partition_to_activate("/dev/sda"),
            Some(Activation {
                disk: "/dev/sda".into(),
                number: 3
            })
        );
        Ok(())
    }

    #[test]
    fn test_logical_uses_extended() {
        let g = graph(vec![
            disk("/dev/sda", Some(LabelType::Msdos)),
            part("/dev/sda", 1).mounted("/", FsType::Ext4),
            part("/dev/sda", 2).pkind(PartitionKind::Extended),
            part("/dev/sda", 5).mounted("/boot", FsType::Ext4),
        ]);
        let s = BootStorage::new(&g, Architecture::X86_64);
        let map = DeviceMap::new();
        let exec = RecordingExecutor::default();
        let p = payloads();
        let u = MbrUpdate::new(&s, &map, &exec, &p);
        assert_eq!(u.partition_to_activate("/dev/sda5").unwrap().number, 2);
    }

    #[test]
    fn test_raid() -> Result<()> {
        let g = raid1_boot();
        let s = BootStorage::new(&g, Architecture::X86_64);
        let mut map = DeviceMap::new();
        map.add_mapping(BiosSlot(0), "/dev/sdb");
        map.add_mapping(BiosSlot(1), "/dev/sda");
        let exec = RecordingExecutor::default();
        let p = payloads();
        let u = MbrUpdate::new(&s, &map, &exec, &p);
        // The member on the first BIOS disk wins
        let md = g.find_by_name("/dev/md0").unwrap();
        assert_eq!(u.first_ordered_member(md).unwrap().name, "/dev/sdb1");
        // With MBR targets, both disks' first partitions get flagged
        let st = Stage1::propose(&s, &map)?;
        let devs = st.kernel_devices(&s.udev())?;
        assert_eq!(devs, ["/dev/sda", "/dev/sdb"]);
        assert_eq!(u.mbrs_to_rewrite(&devs), ["/dev/sda", "/dev/sdb"]);
        let acts: Vec<_> = u
            .partitions_to_activate(&devs)
            .into_iter()
            .map(|a| format!("{}:{}", a.disk, a.number))
            .collect();
        assert_eq!(acts, ["/dev/sdb:1", "/dev/sda:1"]);
        Ok(())
    }

    #[test]
    fn test_run_raid_boot() -> Result<()> {
        let g = raid1_boot();
        let s = BootStorage::new(&g, Architecture::X86_64);
        let mut map = DeviceMap::new();
        map.add_mapping(BiosSlot(0), "/dev/sdb");
        map.add_mapping(BiosSlot(1), "/dev/sda");
        let st = Stage1::new()
            .with_device(&s, "/dev/sda")?
            .with_device(&s, "/dev/sdb")?
            .with_activate(true);
        let exec = RecordingExecutor::default();
        let p = payloads();
        assert!(MbrUpdate::new(&s, &map, &exec, &p).run(&st)?);
        // /dev/md0 holds /boot; its member on hd0 is flagged first
        assert_eq!(
            exec.commands(),
            [
                "parted -s /dev/sdb set 1 boot on",
                "parted -s /dev/sda set 1 boot on"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_one_flag_per_disk() -> Result<()> {
        let g = graph(vec![
            disk("/dev/sda", Some(LabelType::Gpt)),
            part("/dev/sda", 1).mounted("/boot", FsType::Ext4),
            part("/dev/sda", 2)
                .mounted("/", FsType::Ext4)
                .legacy_boot_flag(),
        ]);
        let s = BootStorage::new(&g, Architecture::X86_64);
        let map = DeviceMap::new();
        let st = Stage1::new()
            .with_device(&s, "/dev/sda1")?
            .with_device(&s, "/dev/sda2")?
            .with_activate(true);
        let exec = RecordingExecutor::default();
        let p = payloads();
        let u = MbrUpdate::new(&s, &map, &exec, &p);
        assert!(u.run(&st)?);
        assert_eq!(
            exec.commands(),
            [
                "parted -s /dev/sda set 2 legacy_boot off",
                "parted -s /dev/sda set 1 legacy_boot on"
            ]
        );

        // Whole disk plus one of its partitions
        let devs = vec!["/dev/sda".to_owned(), "/dev/sda2".to_owned()];
        assert_eq!(
            u.partitions_to_activate(&devs),
            [Activation {
                disk: "/dev/sda".into(),
                number: 1
            }]
        );
        Ok(())
    }

    #[test]
    fn test_failures_aggregate() -> Result<()> {
        let g = raid1_boot();
        let s = BootStorage::new(&g, Architecture::X86_64);
        let map = DeviceMap::new();
        let st = Stage1::propose(&s, &map)?.with_generic_mbr(true);
        let exec = RecordingExecutor::failing(&["dd bs=440 count=1 if=/p/mbr.bin of=/dev/sda"]);
        let p = payloads();
        // sda is a stage1 target, so no generic MBR; activation of both
        // disks is still attempted
        assert!(MbrUpdate::new(&s, &map, &exec, &p).run(&st)?);
        let exec = RecordingExecutor::failing(&["parted -s /dev/sda"]);
        assert!(!MbrUpdate::new(&s, &map, &exec, &p).run(&st)?);
        assert_eq!(exec.commands().len(), 2);
        Ok(())
    }

    #[test]
    fn test_backups_before_writes() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = camino::Utf8PathBuf::try_from(td.path().to_owned())?;
        let disk_path = root.join("vda");
        std::fs::write(&disk_path, vec![7u8; 2048])?;
        let g = graph(vec![
            disk(disk_path.as_str(), Some(LabelType::Msdos)),
            part(disk_path.as_str(), 1).mounted("/", FsType::Ext4),
        ]);
        let s = BootStorage::new(&g, Architecture::X86_64);
        let map = DeviceMap::new();
        let st = Stage1::propose(&s, &map)?;
        let config = BackupConfig {
            dir: root.join("backup"),
            log_dir: root.join("log"),
            boot_copy: root.join("boot/backup_mbr"),
            kept: 10,
        };
        let exec = RecordingExecutor::default();
        let p = payloads();
        assert!(MbrUpdate::new(&s, &map, &exec, &p)
            .with_backups(&config)
            .run(&st)?);
        assert!(BootRecordBackup::new(disk_path.as_str(), &config).exists());
        assert_eq!(std::fs::read(&config.boot_copy)?, vec![7u8; 512]);
        Ok(())
    }
}
