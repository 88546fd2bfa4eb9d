//! Backups of boot records, taken before anything writes boot code.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use bootplace_utils::{device_file_name, format_rotation_timestamp, try_parse_rotation_timestamp};
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::BackupConfig;
use crate::error::Stage1Error;

/// Size of a full boot record, including the partition table.
pub const BOOT_RECORD_SIZE: usize = 512;

/// Size of the boot code area; restores write only this much so the
/// partition table is never touched.
pub const BOOT_CODE_SIZE: usize = 440;

/// Backup handling for the boot record of one device.
#[derive(Debug)]
pub struct BootRecordBackup<'a> {
    device: String,
    config: &'a BackupConfig,
}

fn read_head(path: &Utf8Path, len: usize) -> Result<Vec<u8>> {
    let f = File::open(path).with_context(|| format!("Opening {path}"))?;
    let mut buf = Vec::with_capacity(len);
    f.take(len as u64)
        .read_to_end(&mut buf)
        .with_context(|| format!("Reading {path}"))?;
    Ok(buf)
}

/// Sort key of a rotated backup suffix: `<timestamp>` or, for a second
/// rotation within the same second, `<timestamp>.<n>`.
fn rotation_key(suffix: &str) -> Option<(i64, u32)> {
    let (ts, n) = match suffix.split_once('.') {
        Some((ts, n)) => (ts, n.parse().ok()?),
        None => (suffix, 0),
    };
    Some((try_parse_rotation_timestamp(ts)?.timestamp(), n))
}

fn write_copy(path: &Utf8Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    std::fs::write(path, data).with_context(|| format!("Writing {path}"))
}

impl<'a> BootRecordBackup<'a> {
    /// Backups of `device` (a path to a block device) under `config`.
    pub fn new(device: impl Into<String>, config: &'a BackupConfig) -> Self {
        Self {
            device: device.into(),
            config,
        }
    }

    fn file_name(&self) -> String {
        device_file_name(&self.device)
    }

    /// Path of the current backup.
    pub fn backup_path(&self) -> Utf8PathBuf {
        self.config.dir.join(self.file_name())
    }

    /// Whether a non-empty backup exists.
    pub fn exists(&self) -> bool {
        std::fs::metadata(self.backup_path()).is_ok_and(|m| m.len() > 0)
    }

    /// Rotated backups, newest first.
    pub fn rotated(&self) -> Result<Vec<Utf8PathBuf>> {
        let prefix = format!("{}-", self.file_name());
        let mut r = Vec::new();
        let entries = match self.config.dir.read_dir_utf8() {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Listing {}", self.config.dir)),
        };
        for entry in entries {
            let entry = entry?;
            let key = entry.file_name().strip_prefix(&prefix).and_then(rotation_key);
            if let Some(key) = key {
                r.push((key, entry.into_path()));
            }
        }
        r.sort();
        Ok(r.into_iter().rev().map(|(_, p)| p).collect())
    }

    fn rotate(&self) -> Result<()> {
        let current = self.backup_path();
        let mtime = std::fs::metadata(&current)
            .and_then(|m| m.modified())
            .with_context(|| format!("Querying {current}"))?;
        let base = format!("{}-{}", self.file_name(), format_rotation_timestamp(mtime));
        let mut rotated = self.config.dir.join(&base);
        let mut n = 0;
        while rotated.try_exists()? {
            n += 1;
            rotated = self.config.dir.join(format!("{base}.{n}"));
        }
        tracing::debug!("Rotating {current} to {rotated}");
        std::fs::rename(&current, &rotated).with_context(|| format!("Renaming {current}"))?;
        for old in self.rotated()?.into_iter().skip(self.config.kept) {
            tracing::debug!("Removing old backup {old}");
            std::fs::remove_file(&old).with_context(|| format!("Removing {old}"))?;
        }
        Ok(())
    }

    /// Back up the device's boot record, rotating any earlier backup.
    /// For the primary MBR disk an extra copy goes to the boot partition.
    pub fn write(&self, is_mbr_disk: bool) -> Result<()> {
        self.write_impl(is_mbr_disk)
            .with_context(|| format!("Backing up boot record of {}", self.device))
    }

    fn write_impl(&self, is_mbr_disk: bool) -> Result<()> {
        std::fs::create_dir_all(&self.config.dir)
            .with_context(|| format!("Creating {}", self.config.dir))?;
        if self.exists() {
            self.rotate()?;
        }
        let data = read_head(Utf8Path::new(&self.device), BOOT_RECORD_SIZE)?;
        if data.len() < BOOT_RECORD_SIZE {
            tracing::warn!("Short read of {} bytes from {}", data.len(), self.device);
        }
        write_copy(&self.backup_path(), &data)?;
        write_copy(&self.config.log_dir.join(self.file_name()), &data)?;
        if is_mbr_disk {
            write_copy(&self.config.boot_copy, &data)?;
        }
        tracing::info!("Backed up boot record of {}", self.device);
        Ok(())
    }

    /// Copy the boot code part of the backup back to the device.
    pub fn restore(&self) -> Result<()> {
        if !self.exists() {
            return Err(Stage1Error::BackupMissing(self.device.clone()).into());
        }
        let path = self.backup_path();
        let data = read_head(&path, BOOT_CODE_SIZE)?;
        if data.len() < BOOT_CODE_SIZE {
            anyhow::bail!("Backup {path} is truncated ({} bytes)", data.len());
        }
        let mut dev = OpenOptions::new()
            .write(true)
            .open(&self.device)
            .with_context(|| format!("Opening {}", self.device))?;
        dev.seek(SeekFrom::Start(0))?;
        dev.write_all(&data)
            .and_then(|_| dev.sync_all())
            .with_context(|| format!("Restoring boot code of {}", self.device))?;
        tracing::info!("Restored boot code of {} from {path}", self.device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _td: tempfile::TempDir,
        root: Utf8PathBuf,
        config: BackupConfig,
        device: Utf8PathBuf,
    }

    fn fixture() -> Result<Fixture> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_owned())?;
        let config = BackupConfig {
            dir: root.join("backup"),
            log_dir: root.join("log"),
            boot_copy: root.join("boot/backup_mbr"),
            kept: 10,
        };
        let device = root.join("disk");
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&device, data)?;
        Ok(Fixture {
            _td: td,
            root,
            config,
            device,
        })
    }

    #[test]
    fn test_write_restore() -> Result<()> {
        let f = fixture()?;
        let b = BootRecordBackup::new(f.device.as_str(), &f.config);
        assert!(!b.exists());
        let e = b.restore().unwrap_err();
        assert_eq!(
            e.downcast_ref::<Stage1Error>(),
            Some(&Stage1Error::BackupMissing(f.device.to_string()))
        );

        b.write(true)?;
        let orig = std::fs::read(&f.device)?;
        let backup = std::fs::read(b.backup_path())?;
        assert_eq!(backup, orig[..BOOT_RECORD_SIZE]);
        assert_eq!(std::fs::read(f.config.log_dir.join(device_file_name(f.device.as_str())))?, backup);
        assert_eq!(std::fs::read(&f.config.boot_copy)?, backup);

        // Clobber the whole first sector, then restore
        let mut dev = std::fs::read(&f.device)?;
        dev[..BOOT_RECORD_SIZE].fill(0xff);
        std::fs::write(&f.device, &dev)?;
        b.restore()?;
        let restored = std::fs::read(&f.device)?;
        assert_eq!(restored.len(), 1024);
        assert_eq!(restored[..BOOT_CODE_SIZE], orig[..BOOT_CODE_SIZE]);
        // The partition table area is left alone
        assert!(restored[BOOT_CODE_SIZE..BOOT_RECORD_SIZE].iter().all(|&b| b == 0xff));
        assert_eq!(restored[BOOT_RECORD_SIZE..], orig[BOOT_RECORD_SIZE..]);
        Ok(())
    }

    #[test]
    fn test_no_boot_copy() -> Result<()> {
        let f = fixture()?;
        BootRecordBackup::new(f.device.as_str(), &f.config).write(false)?;
        assert!(!f.config.boot_copy.exists());
        assert!(!f.root.join("boot").exists());
        Ok(())
    }

    #[test]
    fn test_rotation() -> Result<()> {
        let f = fixture()?;
        let b = BootRecordBackup::new(f.device.as_str(), &f.config);
        std::fs::create_dir_all(&f.config.dir)?;
        // Twelve rotated backups from the past, plus a stray file
        for day in 1..=12 {
            let p = f
                .config
                .dir
                .join(format!("{}-2020-01-{day:02}-10-00-00", b.file_name()));
            std::fs::write(p, b"old")?;
        }
        let unrelated = f.config.dir.join(format!("{}1-2020-01-01-10-00-00", b.file_name()));
        std::fs::write(&unrelated, b"other device")?;
        std::fs::write(b.backup_path(), b"previous")?;

        b.write(false)?;
        let rotated = b.rotated()?;
        assert_eq!(rotated.len(), 10);
        // The previous backup was rotated and is the newest
        assert_eq!(std::fs::read(&rotated[0])?, b"previous");
        // The oldest ones are gone
        let names: Vec<_> = rotated.iter().filter_map(|p| p.file_name()).collect();
        assert!(names.iter().any(|n| n.ends_with("2020-01-12-10-00-00")));
        assert!(!names.iter().any(|n| n.ends_with("2020-01-03-10-00-00")));
        assert!(unrelated.exists());
        Ok(())
    }

    #[test]
    fn test_rotation_same_second() -> Result<()> {
        let f = fixture()?;
        let b = BootRecordBackup::new(f.device.as_str(), &f.config);
        std::fs::create_dir_all(&f.config.dir)?;
        let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        for content in ["first", "second", "third"] {
            std::fs::write(b.backup_path(), content)?;
            File::options()
                .write(true)
                .open(b.backup_path())?
                .set_modified(mtime)?;
            b.rotate()?;
        }
        let rotated = b.rotated()?;
        let names: Vec<_> = rotated.iter().filter_map(|p| p.file_name()).collect();
        let base = format!("{}-2023-11-14-22-13-20", b.file_name());
        assert_eq!(names, [format!("{base}.2"), format!("{base}.1"), base.clone()]);
        assert_eq!(std::fs::read(&rotated[0])?, b"third");
        assert_eq!(std::fs::read(&rotated[2])?, b"first");
        Ok(())
    }
}
