//! TDS protocol and server product versions.

use core::fmt;

/// TDS protocol version.
///
/// The 32-bit value is sent in LOGIN7 and echoed back, possibly lowered,
/// in LOGINACK. Several wire layouts depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x7100_0000);

    /// TDS 7.1 Revision 1 (SQL Server 2000 SP1)
    pub const V7_1_REV1: Self = Self(0x7100_0001);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x7209_0002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A_0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B_0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x7400_0004);

    /// Create a TDS version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Get the raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Width of the user-type field in column metadata.
    ///
    /// TDS 7.2 widened it from 2 to 4 bytes.
    #[must_use]
    pub const fn user_type_width(self) -> usize {
        if self.0 >= Self::V7_2.0 { 4 } else { 2 }
    }

    /// Whether DONE tokens carry an 8-byte row count.
    #[must_use]
    pub const fn has_wide_row_count(self) -> bool {
        self.0 >= Self::V7_2.0
    }

    /// Parse a version name such as `"7.4"` or `"7.3B"`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7.1" => Some(Self::V7_1),
            "7.2" => Some(Self::V7_2),
            "7.3" | "7.3a" => Some(Self::V7_3A),
            "7.3b" => Some(Self::V7_3B),
            "7.4" => Some(Self::V7_4),
            _ => None,
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0x7100_0000 | 0x7100_0001 => write!(f, "TDS 7.1"),
            0x7209_0002 => write!(f, "TDS 7.2"),
            0x730A_0003 => write!(f, "TDS 7.3A"),
            0x730B_0003 => write!(f, "TDS 7.3B"),
            0x7400_0004 => write!(f, "TDS 7.4"),
            raw => write!(f, "TDS 0x{raw:08X}"),
        }
    }
}

/// SQL Server product version reported in PRELOGIN and LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerVersion {
    /// Major version (e.g. 16 for SQL Server 2022).
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
    /// Sub-build number (PRELOGIN only).
    pub sub_build: u16,
}

impl ServerVersion {
    /// Build from the big-endian `major.minor.build` word and a sub-build.
    #[must_use]
    pub const fn from_raw(raw: u32, sub_build: u16) -> Self {
        Self {
            major: (raw >> 24) as u8,
            minor: (raw >> 16) as u8,
            build: raw as u16,
            sub_build,
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}
