//! The protective MBR boot flag of GPT disks.

use anyhow::Result;
use bootplace_utils::Executor;

use crate::stage1::{PmbrAction, Stage1};
use crate::storage::BootStorage;

/// GPT disks below the stage1 devices.
pub fn gpt_disks(storage: &BootStorage, stage1: &Stage1) -> Result<Vec<String>> {
    let resolver = storage.resolver();
    let mut r: Vec<String> = Vec::new();
    for dev in stage1.kernel_devices(&storage.udev())? {
        for disk in resolver.disks(&dev) {
            if storage.is_gpt(&disk) && !r.contains(&disk) {
                r.push(disk);
            }
        }
    }
    Ok(r)
}

/// Apply `action` to the `pmbr_boot` flag of `disks`. Returns `false` if
/// any `parted` invocation failed.
pub fn pmbr_setup(action: PmbrAction, disks: &[String], executor: &dyn Executor) -> Result<bool> {
    let state = match action {
        PmbrAction::Nothing => return Ok(true),
        PmbrAction::Add => "on",
        PmbrAction::Remove => "off",
    };
    let mut ret = true;
    for disk in disks {
        tracing::info!("Setting pmbr_boot {state} on {disk}");
        let out = executor.run("parted", &["-s", disk, "disk_set", "pmbr_boot", state])?;
        if !out.success() {
            tracing::error!("Setting pmbr_boot on {disk} failed: {}", out.stderr.trim());
            ret = false;
        }
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::devicegraph::*;
    use crate::testutil::*;

    #[test]
    fn test_pmbr() -> Result<()> {
        let g = graph(vec![
            disk("/dev/sda", Some(LabelType::Gpt)),
            disk("/dev/sdb", Some(LabelType::Msdos)),
            part("/dev/sda", 1).mounted("/", FsType::Ext4),
        ]);
        let s = BootStorage::new(&g, Architecture::X86_64);
        let st = Stage1::new()
            .with_device(&s, "/dev/sda1")?
            .with_device(&s, "/dev/sdb")?;
        let disks = gpt_disks(&s, &st)?;
        assert_eq!(disks, ["/dev/sda"]);

        let exec = RecordingExecutor::default();
        assert!(pmbr_setup(PmbrAction::Nothing, &disks, &exec)?);
        assert!(exec.commands().is_empty());
        assert!(pmbr_setup(PmbrAction::Add, &disks, &exec)?);
        assert!(pmbr_setup(PmbrAction::Remove, &disks, &exec)?);
        assert_eq!(
            exec.commands(),
            [
                "parted -s /dev/sda disk_set pmbr_boot on",
                "parted -s /dev/sda disk_set pmbr_boot off"
            ]
        );
        let exec = RecordingExecutor::failing(&["parted"]);
        assert!(!pmbr_setup(PmbrAction::Add, &disks, &exec)?);
        Ok(())
    }
}
