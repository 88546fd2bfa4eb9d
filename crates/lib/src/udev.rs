//! Translation between kernel device names and persistent udev aliases.
//!
//! Configuration files should name devices by something stable across
//! reboots (`/dev/disk/by-uuid/...` and friends), while the code deciding
//! about placement works on kernel names. Everything stored in a
//! [`crate::Stage1`] is an alias produced here.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

use crate::devicegraph::{BlockDevice, DeviceGraph, DeviceKind, MountBy};
use crate::error::Stage1Error;

fn tag_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"^(UUID|LABEL)="?([^"]+)"?$"#).unwrap())
}

/// Turn the `UUID="..."` / `LABEL="..."` notation used in some
/// configuration files into the matching `/dev/disk/by-*` path; other
/// references are returned unchanged.
pub fn normalize_device_ref(dev: &str) -> String {
    let Some(c) = tag_regex().captures(dev.trim()) else {
        return dev.to_owned();
    };
    let dir = match &c[1] {
        "UUID" => "by-uuid",
        _ => "by-label",
    };
    format!("/dev/disk/{dir}/{}", &c[2])
}

/// Resolves device references against one inventory.
#[derive(Debug, Clone, Copy)]
pub struct UdevMapping<'a> {
    graph: &'a DeviceGraph,
}

impl<'a> UdevMapping<'a> {
    /// Resolve names against `graph`.
    pub fn new(graph: &'a DeviceGraph) -> Self {
        Self { graph }
    }

    /// Look up a device by kernel name or alias, mapping the wires of a
    /// multipath device to the multipath device itself.
    pub fn device(&self, dev: &str) -> Result<&'a BlockDevice> {
        let normalized = normalize_device_ref(dev);
        let found = self
            .graph
            .find_by_any_name(&normalized)
            .ok_or_else(|| Stage1Error::UnknownDevice(dev.to_owned()))?;
        if found.kind == DeviceKind::Disk {
            if let Some(mp) = self
                .graph
                .descendants(&found.name)
                .into_iter()
                .find(|d| d.kind == DeviceKind::Multipath)
            {
                tracing::debug!("{dev} is a wire of multipath device {}", mp.name);
                return Ok(mp);
            }
        }
        Ok(found)
    }

    /// The kernel name of `dev`; fails with [`Stage1Error::UnknownDevice`]
    /// when nothing in the inventory answers to it.
    pub fn to_kernel_name(&self, dev: &str) -> Result<String> {
        let found = self.device(dev)?;
        tracing::debug!("Kernel name of {dev}: {}", found.name);
        Ok(found.name.clone())
    }

    /// The preferred persistent alias of `dev`.
    ///
    /// The filesystem's configured reference style wins; after that the
    /// label, uuid, id and path links are tried in order. Devices without
    /// any alias, and unknown devices, keep the name they were given.
    pub fn to_persistent_alias(&self, dev: &str) -> String {
        let found = match self.device(dev) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("{e:#}; keeping {dev} as is");
                return dev.to_owned();
            }
        };
        let alias = preferred_alias(found).unwrap_or_else(|| found.name.clone());
        tracing::debug!("Persistent alias of {dev}: {alias}");
        alias
    }
}

fn preferred_alias(dev: &BlockDevice) -> Option<String> {
    let configured = dev
        .filesystem
        .as_ref()
        .and_then(|f| f.mount_by)
        .and_then(|mb| dev.path_for_mount_by(mb));
    configured
        .or_else(|| dev.path_for_mount_by(MountBy::Label))
        .or_else(|| dev.path_for_mount_by(MountBy::Uuid))
        .or_else(|| dev.path_for_mount_by(MountBy::Id))
        .or_else(|| dev.path_for_mount_by(MountBy::Path))
}
