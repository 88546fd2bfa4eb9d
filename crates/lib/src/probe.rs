//! Building a [`DeviceGraph`] from the running host.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use bootplace_blockdev::{Device, PartedDisk};
use bootplace_utils::dev_path;
use camino::Utf8Path;
use fn_error_context::context;

use crate::devicegraph::{
    BlockDevice, DeviceGraph, DeviceKind, Filesystem, FsType, LabelType, PartitionId,
    PartitionInfo, PartitionKind, UdevLinks,
};

/// Directories of udev symlinks and which list they feed.
const LINK_DIRS: &[(&str, LinkKind)] = &[
    ("/dev/disk/by-id", LinkKind::Id),
    ("/dev/disk/by-path", LinkKind::Path),
    ("/dev/md", LinkKind::Alias),
    ("/dev/mapper", LinkKind::Alias),
];

#[derive(Debug, Clone, Copy)]
enum LinkKind {
    Id,
    Path,
    Alias,
}

/// parted's view of each partitioned device, keyed by device node.
pub(crate) type PartitionFlags = HashMap<String, PartedDisk>;

/// Inspect host storage and build the device graph.
#[context("Probing host storage")]
pub fn probe() -> Result<DeviceGraph> {
    let devices = bootplace_blockdev::list_all()?;
    let links = scan_links()?;
    let mut flags = PartitionFlags::new();
    for dev in partitioned(&devices) {
        let path = dev.path();
        match bootplace_blockdev::parted_print(Utf8Path::new(&path)) {
            Ok(disk) => {
                flags.insert(path, disk);
            }
            // Not fatal; the device only loses its flag information
            Err(e) => tracing::warn!("{e:#}"),
        }
    }
    let network = bootplace_blockdev::network_mounts()?
        .into_iter()
        .map(|m| m.target)
        .collect();
    let graph = graph_from_lsblk(&devices, &links, &flags, network)?;
    tracing::debug!(
        "Probed {} devices, revision {:x}",
        graph.devices.len(),
        graph.revision
    );
    Ok(graph)
}

/// Every device in the tree carrying a partition table.
fn partitioned(devices: &[Device]) -> Vec<&Device> {
    let mut r = Vec::new();
    let mut stack: Vec<&Device> = devices.iter().collect();
    while let Some(dev) = stack.pop() {
        let seen = r.iter().any(|d: &&Device| d.name == dev.name);
        if dev.pttype.is_some() && dev.kind != "part" && !seen {
            r.push(dev);
        }
        stack.extend(dev.children.iter().flatten());
    }
    r
}

/// Collect udev symlinks, keyed by the device node they resolve to.
fn scan_links() -> Result<HashMap<String, UdevLinks>> {
    let mut r: HashMap<String, UdevLinks> = HashMap::new();
    for (dir, kind) in LINK_DIRS {
        let entries = match Utf8Path::new(dir).read_dir_utf8() {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Listing {dir}")),
        };
        for entry in entries {
            let entry = entry?;
            let link = entry.path();
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            let Ok(target) = link.canonicalize_utf8() else {
                tracing::debug!("Dangling link {link}");
                continue;
            };
            let links = r.entry(target.into_string()).or_default();
            let list = match kind {
                LinkKind::Id => &mut links.by_id,
                LinkKind::Path => &mut links.by_path,
                LinkKind::Alias => &mut links.aliases,
            };
            list.push(link.to_string());
        }
    }
    for links in r.values_mut() {
        links.by_id.sort();
        links.by_path.sort();
        links.aliases.sort();
    }
    Ok(r)
}

fn device_kind(lsblk_type: &str) -> DeviceKind {
    match lsblk_type {
        "disk" | "loop" => DeviceKind::Disk,
        "part" => DeviceKind::Partition,
        "md" => DeviceKind::MdRaid,
        t if t.starts_with("raid") => DeviceKind::MdRaid,
        "mpath" => DeviceKind::Multipath,
        "dmraid" => DeviceKind::BiosRaid,
        "lvm" => DeviceKind::LvmLv,
        "crypt" => DeviceKind::Encryption,
        _ => DeviceKind::Other,
    }
}

fn label_type(pttype: Option<&str>) -> Option<LabelType> {
    match pttype? {
        "gpt" => Some(LabelType::Gpt),
        "dos" | "msdos" => Some(LabelType::Msdos),
        _ => None,
    }
}

/// Map a GPT type GUID or a dos type byte (`0x83`) to a partition id.
pub(crate) fn partition_id(parttype: Option<&str>) -> PartitionId {
    let Some(t) = parttype else {
        return PartitionId::Linux;
    };
    let t = t.to_ascii_lowercase();
    match t.strip_prefix("0x").unwrap_or(&t) {
        "21686148-6449-6e6f-744e-656564454649" => PartitionId::BiosBoot,
        "9e1a2d38-c612-4316-aa26-8b49521e5a8b" | "41" => PartitionId::Prep,
        "c12a7328-f81f-11d2-ba4b-00a0c93ec93b" | "ef" => PartitionId::Esp,
        "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f" | "82" => PartitionId::Swap,
        "e6d6d379-f507-44c2-a23c-238f2a3df928" | "8e" => PartitionId::Lvm,
        "a19d880f-05fc-4d3b-a006-743f0f84911e" | "fd" => PartitionId::Raid,
        "5" | "f" | "85" => PartitionId::Extended,
        "0fc63daf-8483-4772-8e79-3d69d8477de4" | "83" => PartitionId::Linux,
        _ => PartitionId::Other,
    }
}

/// The mount point to record when a filesystem is mounted in several places.
fn primary_mountpoint(dev: &Device) -> Option<String> {
    let mut mounts: Vec<&str> = dev.mountpoints().filter(|m| m.starts_with('/')).collect();
    for preferred in ["/boot", "/"] {
        if mounts.contains(&preferred) {
            return Some(preferred.to_string());
        }
    }
    mounts.sort();
    mounts.first().map(|m| m.to_string())
}

fn partition_number(dev: &Device) -> Option<u32> {
    if let Some(n) = dev.partn {
        return Some(n);
    }
    let digits = dev.name.len() - dev.name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    dev.name[dev.name.len() - digits..].parse().ok()
}

struct Walker<'a> {
    links: &'a HashMap<String, UdevLinks>,
    flags: &'a PartitionFlags,
    devices: Vec<BlockDevice>,
    index: HashMap<String, usize>,
}

impl Walker<'_> {
    fn visit(&mut self, dev: &Device, parent: Option<(&str, Option<LabelType>)>) -> Result<()> {
        let name = dev.path();
        if let Some(&i) = self.index.get(&name) {
            // Devices stacked on several parents show up once per parent
            if let Some((p, _)) = parent {
                let parents = &mut self.devices[i].parents;
                if !parents.iter().any(|x| x == p) {
                    parents.push(p.to_string());
                }
            }
            return Ok(());
        }
        let mut bd = BlockDevice::new(name.as_str(), device_kind(&dev.kind));
        if let Some((p, _)) = parent {
            bd.parents.push(p.to_string());
        }
        bd.label = label_type(dev.pttype.as_deref());
        if bd.kind == DeviceKind::Partition {
            let (table, parent_label) = parent
                .with_context(|| format!("Partition {name} without a parent"))?;
            let number = partition_number(dev)
                .with_context(|| format!("Finding partition number of {name}"))?;
            let id = partition_id(dev.parttype.as_deref());
            let kind = if id == PartitionId::Extended {
                PartitionKind::Extended
            } else if parent_label == Some(LabelType::Msdos) && number > 4 {
                PartitionKind::Logical
            } else {
                PartitionKind::Primary
            };
            let parted = self.flags.get(table).and_then(|d| d.partition(number));
            let has_flag = |flag: &str| parted.is_some_and(|p| p.has_flag(flag));
            bd.partition = Some(PartitionInfo {
                number,
                kind,
                id,
                boot: has_flag("boot"),
                legacy_boot: has_flag("legacy_boot"),
            });
        }
        if let Some(fstype) = dev.fstype.as_deref() {
            bd.filesystem = Some(Filesystem {
                fstype: FsType::from_blkid(fstype),
                mount_path: primary_mountpoint(dev),
                label: dev.label.clone(),
                uuid: dev.uuid.clone(),
                mount_by: None,
            });
        }
        let kpath = dev_path(dev.kname.as_deref().unwrap_or(&dev.name));
        for key in [kpath.as_str(), name.as_str()] {
            if let Some(links) = self.links.get(key) {
                let mut links = links.clone();
                links.aliases.retain(|a| *a != name);
                bd.udev = links;
                break;
            }
        }
        let label = bd.label;
        self.index.insert(name.clone(), self.devices.len());
        self.devices.push(bd);
        for child in dev.children.iter().flatten() {
            self.visit(child, Some((&name, label)))?;
        }
        Ok(())
    }
}

/// Assemble a graph from lsblk's tree, udev links (keyed by device node)
/// and parted flags. The revision is derived from the content, so probing
/// unchanged storage twice yields the same revision.
pub(crate) fn graph_from_lsblk(
    devices: &[Device],
    links: &HashMap<String, UdevLinks>,
    flags: &PartitionFlags,
    network_mounts: Vec<String>,
) -> Result<DeviceGraph> {
    let mut w = Walker {
        links,
        flags,
        devices: Vec::new(),
        index: HashMap::new(),
    };
    for dev in devices {
        w.visit(dev, None)?;
    }
    let mut graph = DeviceGraph {
        revision: 0,
        devices: w.devices,
        network_mounts,
    };
    graph.validate()?;
    graph.revision = content_revision(&graph)?;
    Ok(graph)
}

fn content_revision(graph: &DeviceGraph) -> Result<u64> {
    // Sorted so lsblk ordering differences do not matter
    let sorted: BTreeMap<&str, &BlockDevice> = graph
        .devices
        .iter()
        .map(|d| (d.name.as_str(), d))
        .collect();
    let buf = serde_json::to_string(&(sorted, &graph.network_mounts))
        .context("Serializing device graph")?;
    let mut hasher = openssl::hash::Hasher::new(openssl::hash::MessageDigest::sha256())
        .context("Creating hasher")?;
    hasher.update(buf.as_bytes()).context("Hashing device graph")?;
    let digest = hasher.finish().context("Finishing digest")?;
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(prefix))
}
