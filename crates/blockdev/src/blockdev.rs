//! Block device enumeration through lsblk, sfdisk, parted and findmnt.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use bootplace_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk -J -O`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Device name, e.g. `sda1`, or `vg-root` for a device mapper node
    pub name: String,
    /// Internal kernel name, e.g. `dm-0` for a device mapper node
    pub kname: Option<String>,
    /// lsblk device type, e.g. `disk`, `part`, `raid1` or `lvm`
    #[serde(rename = "type")]
    pub kind: String,
    /// Hardware serial number
    pub serial: Option<String>,
    /// Hardware model
    pub model: Option<String>,
    /// GPT partition name
    pub partlabel: Option<String>,
    /// Partition type GUID, or the dos type byte (`0x83`)
    pub parttype: Option<String>,
    /// Partition UUID
    pub partuuid: Option<String>,
    /// Devices built on this one
    pub children: Option<Vec<Device>>,
    /// Size in bytes
    pub size: u64,
    /// Kernel `major:minor` numbers
    #[serde(rename = "maj:min")]
    pub maj_min: Option<String>,
    // NOTE this one is not available on older util-linux, and
    // will also not exist for whole blockdevs (as opposed to partitions).
    /// Partition number
    pub partn: Option<u32>,
    /// Partition table type of a whole disk, e.g. `gpt` or `dos`
    pub pttype: Option<String>,

    // Filesystem-related properties
    /// Filesystem label
    pub label: Option<String>,
    /// Filesystem type as named by blkid
    pub fstype: Option<String>,
    /// Filesystem UUID
    pub uuid: Option<String>,
    /// Device node
    pub path: Option<String>,
    /// Mount points; `null` entries stand for unmounted
    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,
}

impl Device {
    /// The device node.
    // RHEL8's lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    /// Mount points of this device, skipping the placeholders lsblk emits
    /// for unmounted devices.
    pub fn mountpoints(&self) -> impl Iterator<Item = &str> {
        self.mountpoints.iter().flatten().map(|s| s.as_str())
    }

    // The "partn" column was only added in a fairly recent util-linux.
    fn backfill_partn(&mut self) -> Result<()> {
        if self.partn.is_some() || self.kind != "part" {
            return Ok(());
        }
        let Some(majmin) = self.maj_min.as_deref() else {
            // This shouldn't happen
            return Ok(());
        };
        let sysfs_partn_path = format!("/sys/dev/block/{majmin}/partition");
        if Utf8Path::new(&sysfs_partn_path).try_exists()? {
            let partn = std::fs::read_to_string(&sysfs_partn_path)
                .with_context(|| format!("Reading {sysfs_partn_path}"))?;
            tracing::debug!("backfilled partn to {partn}");
            self.partn = Some(
                partn
                    .trim()
                    .parse()
                    .context("Parsing sysfs partition property")?,
            );
        }
        Ok(())
    }

    // Partition types may be missing as well; sfdisk knows them.
    fn backfill_parttype(&mut self) -> Result<()> {
        let missing = |c: &Device| c.kind == "part" && c.parttype.is_none();
        if self.pttype.is_none() || !self.children.iter().flatten().any(missing) {
            return Ok(());
        }
        let table = partitions_of(Utf8Path::new(&self.path()))?;
        for child in self.children.iter_mut().flatten().filter(|c| missing(&**c)) {
            if let Some(p) = table.find(&child.path()) {
                tracing::debug!("backfilled parttype of {} to {}", p.node, p.parttype);
                child.parttype = Some(p.parttype.clone());
            }
        }
        Ok(())
    }

    /// Older versions of util-linux may be missing some properties. Backfill them if they're missing.
    pub fn backfill_missing(&mut self) -> Result<()> {
        // Add new properties to backfill here
        self.backfill_partn()?;
        self.backfill_parttype()?;
        // And recurse to child devices
        for child in self.children.iter_mut().flatten() {
            child.backfill_missing()?;
        }
        Ok(())
    }
}

fn lsblk(dev: Option<&Utf8Path>) -> Result<Vec<Device>> {
    let mut devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .args(dev)
        .log_debug()
        .run_and_parse_json()?;
    for dev in devs.blockdevices.iter_mut() {
        dev.backfill_missing()?;
    }
    Ok(devs.blockdevices)
}

/// All toplevel block devices of the host, with their children.
#[context("Listing block devices")]
pub fn list_all() -> Result<Vec<Device>> {
    lsblk(None)
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// A partition as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct Partition {
    /// Device node
    pub node: String,
    /// First sector
    pub start: u64,
    /// Size in sectors
    pub size: u64,
    /// Partition type GUID, or the dos type byte without `0x`
    #[serde(rename = "type")]
    pub parttype: String,
}

/// Partition table types sfdisk knows.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// DOS (msdos) table
    Dos,
    /// GUID partition table
    Gpt,
    /// Anything else sfdisk reports
    Unknown(String),
}

/// A partition table as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    /// Table type
    pub label: PartitionType,
    /// Disk identifier
    pub id: String,
    /// Device node of the disk
    pub device: String,
    // We're not using these fields
    // pub unit: String,
    // pub firstlba: u64,
    // pub lastlba: u64,
    // pub sectorsize: u64,
    /// Partitions in table order
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Find the partition with the given device name
    pub fn find<'a>(&'a self, devname: &str) -> Option<&'a Partition> {
        self.partitions.iter().find(|p| p.node.as_str() == devname)
    }
}

/// Read the partition table of `dev` with sfdisk.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

/// A partition as reported by `parted -m print`.
#[derive(Debug, PartialEq, Eq)]
pub struct PartedPartition {
    /// Partition number
    pub number: u32,
    /// Flags set on the partition, e.g. `boot` or `legacy_boot`
    pub flags: Vec<String>,
}

impl PartedPartition {
    /// Whether `flag` is set.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// A disk as reported by `parted -m print`.
#[derive(Debug, PartialEq, Eq)]
pub struct PartedDisk {
    /// Device node
    pub path: String,
    /// Partitions in table order
    pub partitions: Vec<PartedPartition>,
}

impl PartedDisk {
    /// The partition numbered `number`.
    pub fn partition(&self, number: u32) -> Option<&PartedPartition> {
        self.partitions.iter().find(|p| p.number == number)
    }
}

fn split_flags(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Parse the "machine" output of parted, which looks like:
///
/// ```text
/// BYT;
/// /dev/sda:41943040s:scsi:512:512:gpt:ATA QEMU HARDDISK:pmbr_boot;
/// 1:2048s:4095s:2048s:::bios_grub;
/// ```
fn parse_parted(buf: &str) -> Result<PartedDisk> {
    let mut lines = buf
        .lines()
        .map(|l| l.trim().trim_end_matches(';'))
        .filter(|l| !l.is_empty());
    match lines.next() {
        Some("BYT") | Some("CHS") | Some("CYL") => {}
        o => anyhow::bail!("Unexpected parted header: {o:?}"),
    }
    let disk = lines.next().ok_or_else(|| anyhow!("Missing disk line"))?;
    let fields: Vec<&str> = disk.split(':').collect();
    let [path, _size, _transport, _lsec, _psec, _label, _model, _flags] = fields.as_slice() else {
        anyhow::bail!("Invalid parted disk line: {disk}");
    };
    let partitions = lines
        .map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            let [number, _start, _end, _size, _fs, _name, flags] = fields.as_slice() else {
                anyhow::bail!("Invalid parted partition line: {line}");
            };
            Ok(PartedPartition {
                number: number
                    .parse()
                    .with_context(|| format!("Parsing partition number in {line}"))?,
                flags: split_flags(flags),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PartedDisk {
        path: path.to_string(),
        partitions,
    })
}

/// Query partition flags of a disk via parted.
#[context("Reading partition flags of {dev}")]
pub fn parted_print(dev: &Utf8Path) -> Result<PartedDisk> {
    let buf = Command::new("parted")
        .args(["-m", "-s", dev.as_str(), "unit", "s", "print"])
        .log_debug()
        .run_get_string()?;
    parse_parted(&buf)
}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<Mount>,
}

/// A mounted filesystem as reported by findmnt.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Mount {
    /// Mount point
    pub target: String,
    /// What is mounted, e.g. `server:/export`
    pub source: String,
    /// Filesystem type
    pub fstype: String,
}

/// Filesystem types backed by a network server rather than a local disk
pub const NETWORK_FSTYPES: &[&str] = &["nfs", "nfs4", "cifs", "smb3", "9p"];

/// List mounted network filesystems.
#[context("Listing network mounts")]
pub fn network_mounts() -> Result<Vec<Mount>> {
    let types = NETWORK_FSTYPES.join(",");
    let o = Command::new("findmnt")
        .args(["-J", "-l", "-o", "TARGET,SOURCE,FSTYPE", "-t", types.as_str()])
        .log_debug()
        .output()
        .context("Spawning findmnt")?;
    // findmnt exits 1 without output if nothing matched
    if o.status.code() == Some(1) && o.stdout.is_empty() {
        return Ok(Vec::new());
    }
    if !o.status.success() {
        anyhow::bail!(
            "findmnt failed: {}: {}",
            o.status,
            String::from_utf8_lossy(&o.stderr).trim()
        );
    }
    let o: FindmntOutput = serde_json::from_slice(&o.stdout).context("Parsing findmnt output")?;
    Ok(o.filesystems)
}
