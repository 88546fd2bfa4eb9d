//! Tool configuration, read from TOML.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Default location of the configuration file.
pub(crate) const CONFIG_PATH: &str = "/etc/bootplace/config.toml";

/// Where boot record backups go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BackupConfig {
    /// Primary backup directory; rotated copies are kept here
    pub dir: Utf8PathBuf,
    /// A second copy of the most recent backup
    pub log_dir: Utf8PathBuf,
    /// Extra copy of the MBR disk's boot record
    pub boot_copy: Utf8PathBuf,
    /// Number of rotated backups kept per device
    pub kept: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: "/var/lib/bootplace/backup_boot_sectors".into(),
            log_dir: "/var/log/bootplace".into(),
            boot_copy: "/boot/backup_mbr".into(),
            kept: 10,
        }
    }
}

/// Generic MBR boot code images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct MbrPayloads {
    /// For msdos partitioned disks
    pub payload_msdos: Utf8PathBuf,
    /// For GPT partitioned disks
    pub payload_gpt: Utf8PathBuf,
}

impl Default for MbrPayloads {
    fn default() -> Self {
        Self {
            payload_msdos: "/usr/share/syslinux/mbr.bin".into(),
            payload_gpt: "/usr/share/syslinux/gptmbr.bin".into(),
        }
    }
}

/// External command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ExecConfig {
    /// Time budget for each external command
    pub timeout_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

impl ExecConfig {
    /// The external command timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Persistent bootloader configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct FilesConfig {
    /// The GRUB BIOS device map
    pub device_map: Utf8PathBuf,
    /// The stage1 device list
    pub install_device: Utf8PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            device_map: "/boot/grub2/device.map".into(),
            install_device: "/etc/default/grub_installdevice".into(),
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    /// Boot record backups
    pub backup: BackupConfig,
    /// Generic MBR payloads
    pub mbr: MbrPayloads,
    /// External commands
    pub exec: ExecConfig,
    /// Persistent bootloader configuration
    pub files: FilesConfig,
}

impl Config {
    /// Parse TOML; unknown keys are errors.
    pub fn parse(buf: &str) -> Result<Self> {
        toml::from_str(buf).context("Parsing configuration")
    }

    /// Load from `path`, or from the default location when `None`. A
    /// missing default file means defaults; an explicitly given file must
    /// exist.
    #[context("Loading configuration")]
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Utf8Path::new(CONFIG_PATH), false),
        };
        let buf = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!("No {path}; using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let r = Self::parse(&buf).with_context(|| format!("In {path}"))?;
        tracing::debug!("Loaded {path}: {r:?}");
        Ok(r)
    }
}
