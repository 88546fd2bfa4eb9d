//! Target architecture handling.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Stage1Error;

/// A concrete machine architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// 32-bit x86
    I386,
    /// 64-bit x86
    X86_64,
    /// 32-bit PowerPC
    Ppc,
    /// 64-bit big-endian PowerPC
    Ppc64,
    /// 64-bit little-endian PowerPC
    Ppc64le,
    /// 31-bit s390
    S390,
    /// 64-bit s390
    S390x,
    /// 64-bit ARM
    Aarch64,
    /// 64-bit RISC-V
    Riscv64,
}

/// Groups of architectures sharing the same stage1 placement rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchFamily {
    /// BIOS firmware: MBR, partition boot records and the BIOS disk order
    X86,
    /// Open Firmware: a PReP boot partition
    PowerPc,
    /// Mainframe: the bootloader lives outside any boot record
    S390,
}

impl Architecture {
    /// The architecture this binary was built for.
    pub fn host() -> Result<Self, Stage1Error> {
        std::env::consts::ARCH.parse()
    }

    /// The placement rules which apply; fails for architectures
    /// without a BIOS-style stage1.
    pub fn family(self) -> Result<ArchFamily, Stage1Error> {
        match self {
            Self::I386 | Self::X86_64 => Ok(ArchFamily::X86),
            Self::Ppc | Self::Ppc64 | Self::Ppc64le => Ok(ArchFamily::PowerPc),
            Self::S390 | Self::S390x => Ok(ArchFamily::S390),
            Self::Aarch64 | Self::Riscv64 => {
                Err(Stage1Error::UnsupportedArchitecture(self.to_string()))
            }
        }
    }

    /// Convenience for [`Self::family`] equal to [`ArchFamily::X86`].
    pub fn is_x86(self) -> bool {
        matches!(self.family(), Ok(ArchFamily::X86))
    }
}

impl FromStr for Architecture {
    type Err = Stage1Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let r = match s {
            "i386" | "i486" | "i586" | "i686" | "x86" => Self::I386,
            "x86_64" | "amd64" => Self::X86_64,
            "ppc" | "powerpc" => Self::Ppc,
            "ppc64" | "powerpc64" => Self::Ppc64,
            "ppc64le" => Self::Ppc64le,
            "s390" => Self::S390,
            "s390x" => Self::S390x,
            "aarch64" | "arm64" => Self::Aarch64,
            "riscv64" => Self::Riscv64,
            o => return Err(Stage1Error::UnsupportedArchitecture(o.to_owned())),
        };
        Ok(r)
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::I386 => "i386",
            Self::X86_64 => "x86_64",
            Self::Ppc => "ppc",
            Self::Ppc64 => "ppc64",
            Self::Ppc64le => "ppc64le",
            Self::S390 => "s390",
            Self::S390x => "s390x",
            Self::Aarch64 => "aarch64",
            Self::Riscv64 => "riscv64",
        };
        f.write_str(s)
    }
}
