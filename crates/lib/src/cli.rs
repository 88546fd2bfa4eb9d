//! # Bootloader stage1 command line tool
//!
//! Command line tool to propose, persist and apply stage1 locations.

use std::collections::BTreeMap;
use std::ffi::OsString;

use anyhow::{Context, Result};
use bootplace_utils::HostExecutor;
use camino::Utf8PathBuf;
use clap::Parser;
use owo_colors::OwoColorize;
use serde::Serialize;

use crate::arch::Architecture;
use crate::backup::BootRecordBackup;
use crate::config::Config;
use crate::device_map::{BiosSlot, DeviceMap};
use crate::devicegraph::DeviceGraph;
use crate::disk_change::invalid_devices;
use crate::mbr_update::MbrUpdate;
use crate::pmbr::{gpt_disks, pmbr_setup};
use crate::stage1::{Location, Stage1};
use crate::storage::BootStorage;

/// Options shared by all subcommands.
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub(crate) struct GlobalOpts {
    /// Path to the configuration file
    #[clap(long, global = true)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Use a JSON storage snapshot instead of probing the host
    #[clap(long, global = true)]
    pub(crate) devicegraph: Option<Utf8PathBuf>,

    /// Target architecture; defaults to the host's
    #[clap(long, global = true)]
    pub(crate) arch: Option<Architecture>,
}

/// Options for the propose subcommand.
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub(crate) struct ProposeOpts {
    /// Persist the device map and stage1 configuration
    #[clap(long)]
    pub(crate) write: bool,

    /// Print JSON instead of text
    #[clap(long)]
    pub(crate) json: bool,

    /// Install stage1 here instead of the proposed location; may be
    /// repeated. One of `boot`, `root`, `extended` or `mbr`.
    #[clap(long = "location")]
    pub(crate) locations: Vec<Location>,
}

/// Decide where the first stage of the bootloader goes, and
/// write it there.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "bootplace")]
#[clap(rename_all = "kebab-case")]
#[clap(version, long_version = clap::crate_version!())]
pub(crate) struct Cli {
    #[clap(flatten)]
    pub(crate) global: GlobalOpts,

    #[clap(subcommand)]
    pub(crate) cmd: Opt,
}

/// Subcommands.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Propose the BIOS device map and stage1 locations.
    Propose(ProposeOpts),
    /// List the stage1 locations usable on this system.
    Locations,
    /// Show the kernel name and persistent alias of a device.
    Resolve {
        /// Device path, or a `UUID=` / `LABEL=` reference
        device: String,
    },
    /// Back up the boot record of a device.
    Backup {
        /// Disk or partition path
        device: String,
    },
    /// Restore the boot code of a device from its backup.
    ///
    /// Only the boot code area is written; the partition table is
    /// left untouched.
    Restore {
        /// Disk or partition path
        device: String,
    },
    /// Apply the persisted stage1 configuration to the disks.
    Install,
    /// Report persisted stage1 devices which are no longer usable.
    Check,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ProposalOutput<'a> {
    device_map: BTreeMap<BiosSlot, &'a str>,
    stage1: &'a Stage1,
}

/// State loaded for every subcommand.
#[derive(Debug)]
struct Session {
    config: Config,
    graph: DeviceGraph,
    arch: Architecture,
}

impl Session {
    fn load(opts: &GlobalOpts) -> Result<Self> {
        let config = Config::load(opts.config.as_deref())?;
        let graph = match opts.devicegraph.as_deref() {
            Some(p) => DeviceGraph::from_file(p)?,
            None => crate::probe::probe()?,
        };
        let arch = match opts.arch {
            Some(a) => a,
            None => Architecture::host()?,
        };
        Ok(Self {
            config,
            graph,
            arch,
        })
    }

    fn storage(&self) -> BootStorage<'_> {
        BootStorage::new(&self.graph, self.arch)
    }

    /// The persisted device map, or a fresh proposal when there is none.
    fn device_map(&self, storage: &BootStorage) -> Result<DeviceMap> {
        let path = &self.config.files.device_map;
        if path.try_exists()? {
            return DeviceMap::read(path);
        }
        tracing::debug!("No {path}; proposing a device map");
        propose_device_map(storage)
    }
}

fn propose_device_map(storage: &BootStorage) -> Result<DeviceMap> {
    if !storage.arch().is_x86() {
        return Ok(DeviceMap::new());
    }
    DeviceMap::propose(storage.graph(), storage.arch(), &storage.facts().boot_disks)
}

fn propose(ctx: &Session, opts: &ProposeOpts) -> Result<()> {
    let storage = ctx.storage();
    let device_map = propose_device_map(&storage)?;
    let mut stage1 = Stage1::propose(&storage, &device_map)?;
    if !opts.locations.is_empty() {
        let available = Stage1::available_locations(&storage)?;
        stage1 = stage1.cleared();
        for loc in &opts.locations {
            let Some(dev) = available.get(loc) else {
                anyhow::bail!("Location {loc} is not available on this system");
            };
            stage1 = stage1.with_device(&storage, dev)?;
        }
    }
    if opts.write {
        if storage.arch().is_x86() {
            device_map.write(&ctx.config.files.device_map)?;
        }
        stage1 = stage1.write(&ctx.config.files.install_device)?;
    }
    if opts.json {
        let out = ProposalOutput {
            device_map: device_map.iter().collect(),
            stage1: &stage1,
        };
        let buf = serde_json::to_string_pretty(&out).context("Serializing proposal")?;
        anstream::println!("{buf}");
    } else {
        if !device_map.is_empty() {
            anstream::println!("{}", "Device map:".bold());
            anstream::print!("{}", device_map.to_file_contents());
        }
        anstream::println!("{}", "Stage1:".bold());
        anstream::print!("{}", stage1.to_install_device_contents());
    }
    Ok(())
}

fn locations(ctx: &Session) -> Result<()> {
    let storage = ctx.storage();
    for (loc, dev) in Stage1::available_locations(&storage)? {
        anstream::println!("{loc}\t{dev}");
    }
    Ok(())
}

fn resolve(ctx: &Session, device: &str) -> Result<()> {
    let storage = ctx.storage();
    let udev = storage.udev();
    let kernel = udev.to_kernel_name(device)?;
    anstream::println!("{kernel}\t{}", udev.to_persistent_alias(device));
    let resolution = storage.resolver().resolve(&kernel);
    if !resolution.is_complete() {
        anstream::eprintln!(
            "{} {kernel} is only partially backed by supported devices",
            "warning:".yellow().bold()
        );
    }
    Ok(())
}

fn backup(ctx: &Session, device: &str) -> Result<()> {
    let storage = ctx.storage();
    let kernel = storage.udev().to_kernel_name(device)?;
    let is_mbr_disk = storage.mbr_disk() == Some(kernel.as_str());
    BootRecordBackup::new(kernel, &ctx.config.backup).write(is_mbr_disk)
}

fn restore(ctx: &Session, device: &str) -> Result<()> {
    let storage = ctx.storage();
    let kernel = storage.udev().to_kernel_name(device)?;
    BootRecordBackup::new(kernel, &ctx.config.backup).restore()
}

fn install(ctx: &Session) -> Result<()> {
    let storage = ctx.storage();
    let stage1 = Stage1::read(&ctx.config.files.install_device)?;
    let device_map = ctx.device_map(&storage)?;
    let executor = HostExecutor::new(ctx.config.exec.timeout())?;

    // Backups are taken by the MBR update, so it goes before the PMBR flag
    let mut ok = MbrUpdate::new(&storage, &device_map, &executor, &ctx.config.mbr)
        .with_backups(&ctx.config.backup)
        .run(&stage1)?;
    let gpt = gpt_disks(&storage, &stage1)?;
    ok &= pmbr_setup(stage1.pmbr_action(), &gpt, &executor)?;
    if !ok {
        anstream::eprintln!(
            "{} Some disk updates failed; the system may not boot without manual fixup.",
            "warning:".yellow().bold()
        );
    }
    Ok(())
}

fn check(ctx: &Session) -> Result<()> {
    let storage = ctx.storage();
    let stage1 = Stage1::read(&ctx.config.files.install_device)?;
    let invalid = invalid_devices(&storage, &stage1);
    if invalid.is_empty() {
        tracing::info!("All stage1 devices are usable");
        return Ok(());
    }
    for dev in &invalid {
        anstream::println!("{dev}");
    }
    anyhow::bail!(
        "{} stage1 device(s) unknown or no longer usable",
        invalid.len()
    )
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<T>(args: impl IntoIterator<Item = T>) -> Result<()>
where
    T: Into<OsString> + Clone,
{
    run_from_opt(Cli::parse_from(args))
}

fn run_from_opt(cli: Cli) -> Result<()> {
    let ctx = Session::load(&cli.global)?;
    match &cli.cmd {
        Opt::Propose(opts) => propose(&ctx, opts),
        Opt::Locations => locations(&ctx),
        Opt::Resolve { device } => resolve(&ctx, device),
        Opt::Backup { device } => backup(&ctx, device),
        Opt::Restore { device } => restore(&ctx, device),
        Opt::Install => install(&ctx),
        Opt::Check => check(&ctx),
    }
}
