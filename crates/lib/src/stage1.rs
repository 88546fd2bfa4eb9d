//! Where stage1 goes, plus its two companion flags.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use serde::Serialize;

use crate::device_map::DeviceMap;
use crate::proposal;
use crate::storage::BootStorage;
use crate::udev::UdevMapping;

const PMBR_KEY: &str = "pmbr=";

/// Symbolic stage1 targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// Boot record of the separate `/boot` partition
    Boot,
    /// Boot record of the partition holding `/`
    Root,
    /// Boot record of the extended partition
    Extended,
    /// Master boot record of the boot disk(s)
    Mbr,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Boot => "boot",
            Self::Root => "root",
            Self::Extended => "extended",
            Self::Mbr => "mbr",
        };
        f.write_str(s)
    }
}

impl FromStr for Location {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let r = match s {
            "boot" => Self::Boot,
            "root" => Self::Root,
            "extended" => Self::Extended,
            "mbr" => Self::Mbr,
            o => anyhow::bail!("Unknown location: {o}"),
        };
        Ok(r)
    }
}

/// What to do with the protective MBR boot flag of GPT disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PmbrAction {
    /// Leave it alone
    #[default]
    Nothing,
    /// Set `pmbr_boot`
    Add,
    /// Clear `pmbr_boot`
    Remove,
}

/// Where a [`Stage1`] value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage1State {
    /// Nothing decided yet
    #[default]
    Unset,
    /// Computed by the proposal
    Proposed,
    /// Changed by the user after proposal or load
    Customized,
    /// Persisted, or loaded from persistent configuration
    Written,
}

/// The stage1 configuration: target devices (as persistent aliases),
/// whether to set the bootable flag, and whether to write a generic MBR.
///
/// Values are immutable; every change produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Stage1 {
    devices: Vec<String>,
    activate: bool,
    generic_mbr: bool,
    pmbr_action: PmbrAction,
    state: Stage1State,
}

impl Stage1 {
    /// An empty, unset configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn proposed(
        devices: Vec<String>,
        activate: bool,
        generic_mbr: bool,
        pmbr_action: PmbrAction,
    ) -> Self {
        Self {
            devices,
            activate,
            generic_mbr,
            pmbr_action,
            state: Stage1State::Proposed,
        }
    }

    /// Compute the recommended configuration for this system.
    #[context("Proposing stage1 location")]
    pub fn propose(storage: &BootStorage, device_map: &DeviceMap) -> Result<Self> {
        let r = proposal::for_family(storage.arch().family()?).propose(storage, device_map)?;
        tracing::info!("Proposed stage1: {r}");
        Ok(r)
    }

    /// The symbolic targets legal on this system, with the kernel device
    /// each stands for.
    pub fn available_locations(storage: &BootStorage) -> Result<BTreeMap<Location, String>> {
        proposal::for_family(storage.arch().family()?).available_locations(storage)
    }

    /// Target devices, as persistent aliases where available.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    /// Whether to flag the boot partition active.
    pub fn activate(&self) -> bool {
        self.activate
    }

    /// Whether to write generic boot code to the MBR.
    pub fn generic_mbr(&self) -> bool {
        self.generic_mbr
    }

    /// What to do with the protective MBR boot flag.
    pub fn pmbr_action(&self) -> PmbrAction {
        self.pmbr_action
    }

    /// Lifecycle state.
    pub fn state(&self) -> Stage1State {
        self.state
    }

    fn customized(&self) -> Self {
        Self {
            state: Stage1State::Customized,
            ..self.clone()
        }
    }

    /// Add `dev`: it is resolved to its real devices and each is stored
    /// under its persistent alias.
    pub fn with_device(&self, storage: &BootStorage, dev: &str) -> Result<Self> {
        let udev = storage.udev();
        let kernel = udev.to_kernel_name(dev)?;
        let mut r = self.customized();
        for real in storage.resolver().resolve(&kernel).devices() {
            let alias = udev.to_persistent_alias(real);
            if !r.devices.contains(&alias) {
                r.devices.push(alias);
            }
        }
        Ok(r)
    }

    /// Remove the stored device which resolves to the same kernel device
    /// as `dev`.
    pub fn without_device(&self, storage: &BootStorage, dev: &str) -> Result<Self> {
        let udev = storage.udev();
        let kernel = udev.to_kernel_name(dev)?;
        let mut r = self.customized();
        r.devices
            .retain(|d| udev.to_kernel_name(d).map_or(true, |k| k != kernel));
        Ok(r)
    }

    /// Remove all devices.
    pub fn cleared(&self) -> Self {
        Self {
            devices: Vec::new(),
            ..self.customized()
        }
    }

    /// Set [`Self::activate`].
    pub fn with_activate(&self, activate: bool) -> Self {
        Self {
            activate,
            ..self.customized()
        }
    }

    /// Set [`Self::generic_mbr`].
    pub fn with_generic_mbr(&self, generic_mbr: bool) -> Self {
        Self {
            generic_mbr,
            ..self.customized()
        }
    }

    /// Set [`Self::pmbr_action`].
    pub fn with_pmbr_action(&self, pmbr_action: PmbrAction) -> Self {
        Self {
            pmbr_action,
            ..self.customized()
        }
    }

    /// Mark as persisted.
    pub fn written(&self) -> Self {
        Self {
            state: Stage1State::Written,
            ..self.clone()
        }
    }

    /// Combine with `other`, e.g. a configuration imported from elsewhere.
    ///
    /// If `other` names no devices only its flags are taken into account
    /// (OR-ed with ours); otherwise its devices and flags replace ours.
    pub fn merge(&self, other: &Stage1, storage: &BootStorage) -> Result<Self> {
        let mut r = if other.devices.is_empty() {
            Self {
                activate: self.activate || other.activate,
                generic_mbr: self.generic_mbr || other.generic_mbr,
                ..self.customized()
            }
        } else {
            let mut r = Self {
                activate: other.activate,
                generic_mbr: other.generic_mbr,
                ..self.cleared()
            };
            for d in &other.devices {
                r = r.with_device(storage, d)?;
            }
            r
        };
        if other.pmbr_action != PmbrAction::Nothing {
            r.pmbr_action = other.pmbr_action;
        }
        tracing::debug!("Merged stage1: {r}");
        Ok(r)
    }

    /// Kernel names of the stored devices.
    pub fn kernel_devices(&self, udev: &UdevMapping) -> Result<Vec<String>> {
        self.devices.iter().map(|d| udev.to_kernel_name(d)).collect()
    }

    fn includes_all(&self, storage: &BootStorage, kernel_dev: &str) -> Result<bool> {
        let ours = self.kernel_devices(&storage.udev())?;
        let r = storage
            .resolver()
            .resolve(kernel_dev)
            .devices()
            .iter()
            .all(|d| ours.contains(d));
        Ok(r)
    }

    /// Whether every real device below `dev` is a stage1 target.
    pub fn include(&self, storage: &BootStorage, dev: &str) -> Result<bool> {
        let kernel = storage.udev().to_kernel_name(dev)?;
        self.includes_all(storage, &kernel)
    }

    fn includes_opt(&self, storage: &BootStorage, dev: Option<&str>) -> Result<bool> {
        match dev {
            Some(d) => self.includes_all(storage, d),
            None => Ok(false),
        }
    }

    /// Whether stage1 goes to the boot partition.
    pub fn is_boot_partition(&self, storage: &BootStorage) -> Result<bool> {
        self.includes_opt(storage, storage.facts().boot_partition.as_deref())
    }

    /// Whether stage1 goes to the root partition.
    pub fn is_root_partition(&self, storage: &BootStorage) -> Result<bool> {
        self.includes_opt(storage, storage.facts().root_partition.as_deref())
    }

    /// Whether stage1 goes to the MBR of the boot disk.
    pub fn is_mbr(&self, storage: &BootStorage) -> Result<bool> {
        self.includes_opt(storage, storage.mbr_disk())
    }

    /// Whether stage1 goes to the extended partition.
    pub fn is_extended_partition(&self, storage: &BootStorage) -> Result<bool> {
        self.includes_opt(storage, storage.facts().extended_partition.as_deref())
    }

    /// Stored devices not corresponding to any symbolic location.
    pub fn custom_devices(&self, storage: &BootStorage) -> Result<Vec<String>> {
        let udev = storage.udev();
        let facts = storage.facts();
        let known: Vec<&str> = [
            facts.boot_partition.as_deref(),
            facts.root_partition.as_deref(),
            storage.mbr_disk(),
            facts.extended_partition.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        let mut r = Vec::new();
        for d in &self.devices {
            let k = udev.to_kernel_name(d)?;
            if !known.contains(&k.as_str()) {
                r.push(d.clone());
            }
        }
        Ok(r)
    }

    /// Parse the install-device file: one device per line, plus the
    /// keyword lines `activate` and `generic_mbr`, and `pmbr=<action>`.
    pub fn parse_install_device(buf: &str) -> Result<Self> {
        let mut r = Self {
            state: Stage1State::Written,
            ..Self::default()
        };
        for line in buf.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line {
                "activate" => r.activate = true,
                "generic_mbr" => r.generic_mbr = true,
                l if l.starts_with('#') => {}
                l if l.starts_with(PMBR_KEY) => {
                    r.pmbr_action = match &l[PMBR_KEY.len()..] {
                        "add" => PmbrAction::Add,
                        "remove" => PmbrAction::Remove,
                        "nothing" => PmbrAction::Nothing,
                        o => anyhow::bail!("Invalid protective MBR action: {o}"),
                    };
                }
                l if l.starts_with('/') || l.contains('=') => {
                    if !r.devices.iter().any(|d| d == l) {
                        r.devices.push(l.to_owned());
                    }
                }
                l => anyhow::bail!("Invalid install device line: {l}"),
            }
        }
        Ok(r)
    }

    /// Render in the format read by [`Self::parse_install_device`].
    pub fn to_install_device_contents(&self) -> String {
        let mut s = String::new();
        for d in &self.devices {
            s.push_str(d);
            s.push('\n');
        }
        if self.activate {
            s.push_str("activate\n");
        }
        if self.generic_mbr {
            s.push_str("generic_mbr\n");
        }
        match self.pmbr_action {
            PmbrAction::Nothing => {}
            PmbrAction::Add => s.push_str("pmbr=add\n"),
            PmbrAction::Remove => s.push_str("pmbr=remove\n"),
        }
        s
    }

    /// Load the install-device file.
    #[context("Reading stage1 configuration {path}")]
    pub fn read(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse_install_device(&buf)
    }

    /// Persist to the install-device file, returning the written value.
    #[context("Writing stage1 configuration {path}")]
    pub fn write(&self, path: &Utf8Path) -> Result<Self> {
        tracing::info!("Writing stage1: {self}");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_install_device_contents())?;
        Ok(self.written())
    }
}

impl Display for Stage1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "devices={:?} activate={} generic_mbr={} pmbr={:?}",
            self.devices, self.activate, self.generic_mbr, self.pmbr_action
        )
    }
}
