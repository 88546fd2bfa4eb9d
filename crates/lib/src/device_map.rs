//! The BIOS disk order (`hd0`, `hd1`, ...) as the bootloader sees it.

use std::collections::BTreeMap;
use std::fmt::{Display, Write as _};
use std::str::FromStr;

use anyhow::{Context, Result};
use bootplace_utils::iterator_split;
use camino::Utf8Path;
use fn_error_context::context;

use crate::arch::{ArchFamily, Architecture};
use crate::devicegraph::DeviceGraph;
use crate::error::Stage1Error;
use crate::udev::UdevMapping;

/// Number of disks the BIOS can address.
pub const BIOS_LIMIT: usize = 8;

/// BIOS id of the first hard disk.
const FIRST_BIOS_ID: u32 = 0x80;

/// A BIOS disk slot; slot 0 is the disk the firmware boots from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BiosSlot(pub u32);

impl Display for BiosSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hd{}", self.0)
    }
}

impl FromStr for BiosSlot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(s);
        let n = inner
            .strip_prefix("hd")
            .ok_or_else(|| anyhow::anyhow!("Invalid BIOS slot: {s}"))?;
        let n = n.parse().with_context(|| format!("Invalid BIOS slot: {s}"))?;
        Ok(Self(n))
    }
}

impl serde::Serialize for BiosSlot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parse a firmware BIOS id like `0x81` into a slot index.
fn bios_slot_index(family: ArchFamily, bios_id: &str) -> Result<Option<u32>> {
    if family != ArchFamily::X86 {
        return Err(Stage1Error::UnsupportedArchitecture(format!(
            "BIOS ids are only meaningful on x86, got {bios_id}"
        ))
        .into());
    }
    let parsed = match bios_id.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => bios_id.parse(),
    };
    match parsed {
        Ok(id) if id >= FIRST_BIOS_ID => Ok(Some(id - FIRST_BIOS_ID)),
        Ok(id) => {
            tracing::warn!("Ignoring BIOS id {id:#x} below the first hard disk");
            Ok(None)
        }
        Err(e) => {
            tracing::warn!("Ignoring unparsable BIOS id {bios_id}: {e}");
            Ok(None)
        }
    }
}

/// Mapping of BIOS slots to disks.
///
/// No two slots map the same disk. Entries are ordered by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap {
    slots: BTreeMap<BiosSlot, String>,
}

impl DeviceMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose a device map for `graph`.
    ///
    /// Disks with a firmware BIOS id take the matching slot, the rest fill
    /// the lowest free slots in inventory order. The first of
    /// `priority_disks` found in the map is moved to `hd0` unless a disk
    /// already occupies it per firmware report. Slots are then renumbered
    /// without gaps and truncated to [`BIOS_LIMIT`].
    #[context("Proposing device map")]
    pub fn propose(
        graph: &DeviceGraph,
        arch: Architecture,
        priority_disks: &[String],
    ) -> Result<Self> {
        let family = arch.family()?;
        // slot -> (disk, slot came from firmware)
        let mut slots: BTreeMap<u32, (String, bool)> = BTreeMap::new();
        let disks = graph.disk_devices();
        for disk in disks.iter() {
            let Some(bios_id) = disk.bios_id.as_deref() else {
                continue;
            };
            let Some(idx) = bios_slot_index(family, bios_id)? else {
                continue;
            };
            if let Some((other, _)) = slots.get(&idx) {
                tracing::warn!(
                    "{} and {other} both report BIOS id {bios_id}; ignoring it for {}",
                    disk.name,
                    disk.name
                );
                continue;
            }
            slots.insert(idx, (disk.name.clone(), true));
        }
        for disk in disks {
            if slots.values().any(|(d, _)| *d == disk.name) {
                continue;
            }
            let idx = (0..).find(|i| !slots.contains_key(i)).unwrap_or_default();
            slots.insert(idx, (disk.name.clone(), false));
        }

        order_boot_device(&mut slots, priority_disks);

        let ordered: Vec<String> = slots.into_values().map(|(d, _)| d).collect();
        let (kept, dropped) = iterator_split(ordered.into_iter(), BIOS_LIMIT);
        for d in dropped {
            tracing::info!("Dropping {d} from device map: BIOS addresses at most {BIOS_LIMIT} disks");
        }
        let slots = (0u32..).map(BiosSlot).zip(kept).collect();
        let r = Self { slots };
        tracing::debug!("Proposed device map: {r}");
        Ok(r)
    }

    /// Map `slot` to `disk`, replacing any previous mapping of either.
    pub fn add_mapping(&mut self, slot: BiosSlot, disk: impl Into<String>) {
        let disk = disk.into();
        self.slots.retain(|_, d| *d != disk);
        self.slots.insert(slot, disk);
    }

    /// Remove the mapping of `slot`, returning the disk it held.
    pub fn remove_mapping(&mut self, slot: BiosSlot) -> Option<String> {
        self.slots.remove(&slot)
    }

    /// Remove all mappings.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of mapped slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is mapped.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slot holding `disk`, compared verbatim.
    pub fn grub_device_for(&self, disk: &str) -> Option<BiosSlot> {
        self.slots
            .iter()
            .find_map(|(s, d)| (d == disk).then_some(*s))
    }

    /// The disk in `slot`.
    pub fn system_device_for(&self, slot: BiosSlot) -> Option<&str> {
        self.slots.get(&slot).map(|s| s.as_str())
    }

    /// Whether `disk` is mapped, under its own name or any name resolving
    /// to the same device.
    pub fn contains_disk(&self, disk: &str, udev: &UdevMapping) -> bool {
        if self.grub_device_for(disk).is_some() {
            return true;
        }
        let Ok(kernel) = udev.to_kernel_name(disk) else {
            return false;
        };
        self.slots
            .values()
            .any(|d| udev.to_kernel_name(d).is_ok_and(|k| k == kernel))
    }

    /// Disks in slot order.
    pub fn ordered_disks(&self) -> Vec<&str> {
        self.slots.values().map(|s| s.as_str()).collect()
    }

    /// Slot/disk pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (BiosSlot, &str)> {
        self.slots.iter().map(|(s, d)| (*s, d.as_str()))
    }

    /// Parse the `(hdN)<whitespace>device` file format; `#` starts a comment.
    pub fn parse(buf: &str) -> Result<Self> {
        let mut r = Self::new();
        for (i, line) in buf.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(slot), Some(disk), None) = (parts.next(), parts.next(), parts.next())
            else {
                anyhow::bail!("Invalid device map line {}: {line}", i + 1);
            };
            let slot: BiosSlot = slot.parse()?;
            if r.slots.contains_key(&slot) {
                anyhow::bail!("Duplicate device map entry for {slot}");
            }
            r.add_mapping(slot, disk);
        }
        Ok(r)
    }

    /// Render in the file format accepted by [`Self::parse`].
    pub fn to_file_contents(&self) -> String {
        self.slots.iter().fold(String::new(), |mut s, (slot, disk)| {
            let _ = writeln!(s, "({slot})\t{disk}");
            s
        })
    }

    /// Load from a file.
    #[context("Reading device map {path}")]
    pub fn read(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    /// Write to a file, replacing it.
    #[context("Writing device map {path}")]
    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        tracing::info!("Writing device map: {self}");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_file_contents())?;
        Ok(())
    }
}

impl Display for DeviceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (slot, disk) in &self.slots {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{slot}={disk}")?;
        }
        Ok(())
    }
}

fn order_boot_device(slots: &mut BTreeMap<u32, (String, bool)>, priority_disks: &[String]) {
    let Some((hd0, firmware)) = slots.get(&0).cloned() else {
        return;
    };
    if priority_disks.contains(&hd0) {
        return;
    }
    if firmware {
        tracing::info!("Keeping {hd0} in hd0 as reported by firmware");
        return;
    }
    let Some((idx, priority)) = priority_disks.iter().find_map(|p| {
        slots
            .iter()
            .find_map(|(i, (d, _))| (d == p).then(|| (*i, p.clone())))
    }) else {
        tracing::warn!("None of the priority disks {priority_disks:?} are in the device map");
        return;
    };
    tracing::info!("Moving {priority} to hd0, {hd0} to hd{idx}");
    if let Some(entry) = slots.remove(&idx) {
        if let Some(old) = slots.insert(0, entry) {
            slots.insert(idx, old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicegraph::*;
    use crate::testutil::*;
    use indoc::indoc;

    fn disks(n: usize) -> Vec<BlockDevice> {
        ('a'..).take(n).map(|c| disk(&format!("/dev/sd{c}"), None)).collect()
    }

    #[test]
    fn test_slot() -> Result<()> {
        assert_eq!("hd3".parse::<BiosSlot>()?, BiosSlot(3));
        assert_eq!("(hd0)".parse::<BiosSlot>()?, BiosSlot(0));
        assert!("fd0".parse::<BiosSlot>().is_err());
        assert!("hdx".parse::<BiosSlot>().is_err());
        assert_eq!(BiosSlot(7).to_string(), "hd7");
        Ok(())
    }

    #[test]
    fn test_propose_simple() -> Result<()> {
        let g = single_disk_separate_boot();
        let m = DeviceMap::propose(&g, Architecture::X86_64, &["/dev/sda".into()])?;
        assert_eq!(m.ordered_disks(), ["/dev/sda"]);
        assert_eq!(m.grub_device_for("/dev/sda"), Some(BiosSlot(0)));
        assert_eq!(m.system_device_for(BiosSlot(1)), None);
        Ok(())
    }

    #[test]
    fn test_propose_ten_disks() -> Result<()> {
        let g = ten_disks();
        let m = DeviceMap::propose(&g, Architecture::X86_64, &["/dev/sde".into()])?;
        assert_eq!(m.len(), BIOS_LIMIT);
        assert_eq!(
            m.ordered_disks(),
            [
                "/dev/sde", "/dev/sdb", "/dev/sdc", "/dev/sdd", "/dev/sda", "/dev/sdf",
                "/dev/sdg", "/dev/sdh"
            ]
        );
        Ok(())
    }

    #[test]
    fn test_propose_bios_ids() -> Result<()> {
        let mut devices = disks(5);
        devices[2] = devices[2].clone().bios_id("0x80");
        devices[3] = devices[3].clone().bios_id("0x85");
        // Duplicate id is ignored; disk is placed in the first free slot
        devices[4] = devices[4].clone().bios_id("0x80");
        let g = graph(devices);
        let m = DeviceMap::propose(&g, Architecture::X86_64, &["/dev/sda".into()])?;
        // sdc stays in hd0 as reported; the gap in front of sdd is closed
        assert_eq!(
            m.ordered_disks(),
            ["/dev/sdc", "/dev/sda", "/dev/sdb", "/dev/sde", "/dev/sdd"]
        );
        // Device maps need BIOS ids only on x86
        assert!(DeviceMap::propose(&g, Architecture::Ppc64le, &[]).is_err());
        let g = graph(disks(2));
        assert!(DeviceMap::propose(&g, Architecture::S390x, &[]).is_ok());
        Ok(())
    }

    #[test]
    fn test_propose_excludes_members() -> Result<()> {
        let mut devices = disks(3);
        devices.push(virt(
            "/dev/mapper/isw_raid",
            DeviceKind::BiosRaid,
            &["/dev/sdb", "/dev/sdc"],
        ));
        let g = graph(devices);
        let m = DeviceMap::propose(&g, Architecture::X86_64, &[])?;
        assert_eq!(m.ordered_disks(), ["/dev/sda", "/dev/mapper/isw_raid"]);
        Ok(())
    }

    #[test]
    fn test_mapping_ops() {
        let g = single_disk_separate_boot();
        let udev = UdevMapping::new(&g);
        let mut m = DeviceMap::new();
        m.add_mapping(BiosSlot(0), "/dev/disk/by-id/ata-DISK_A");
        m.add_mapping(BiosSlot(1), "/dev/sdb");
        assert!(m.contains_disk("/dev/sda", &udev));
        assert!(m.contains_disk("/dev/sdb", &udev));
        assert!(!m.contains_disk("/dev/sdc", &udev));
        // Re-adding a disk moves it
        m.add_mapping(BiosSlot(2), "/dev/sdb");
        assert_eq!(m.len(), 2);
        assert_eq!(m.remove_mapping(BiosSlot(2)).as_deref(), Some("/dev/sdb"));
        m.clear();
        assert!(m.is_empty());
    }

    #[test]
    fn test_file_format() -> Result<()> {
        let buf = indoc! { "
            # generated
            (hd0)\t/dev/disk/by-id/ata-DISK_A
            (hd1)   /dev/sdb
        " };
        let m = DeviceMap::parse(buf)?;
        assert_eq!(m.system_device_for(BiosSlot(1)), Some("/dev/sdb"));
        similar_asserts::assert_eq!(
            m.to_file_contents(),
            "(hd0)\t/dev/disk/by-id/ata-DISK_A\n(hd1)\t/dev/sdb\n"
        );
        assert_eq!(DeviceMap::parse(&m.to_file_contents())?, m);
        assert!(DeviceMap::parse("(hd0) /dev/sda extra").is_err());
        assert!(DeviceMap::parse("(hd0) /dev/sda\n(hd0) /dev/sdb").is_err());
        Ok(())
    }
}
