//! Collation wire structure and code page resolution.
//!
//! A collation is 5 bytes on the wire: a little-endian `u32` holding the
//! LCID (bits 0..20), comparison flags (bits 20..28) and a version
//! (bits 28..32), followed by a one-byte SQL sort id.
//!
//! The code page used for non-Unicode character data is resolved in order:
//!
//! 1. the UTF-8 flag selects code page 65001,
//! 2. a non-zero sort id is looked up in the SQL sort-order table,
//! 3. the LCID is looked up in the Windows locale table,
//! 4. otherwise code page 1252.
//!
//! # Supported Encodings
//!
//! | Code Page | Encoding | Languages |
//! |-----------|----------|-----------|
//! | 874 | Windows-874 (TIS-620) | Thai |
//! | 932 | Shift_JIS | Japanese |
//! | 936 | GBK | Simplified Chinese |
//! | 949 | EUC-KR | Korean |
//! | 950 | Big5 | Traditional Chinese |
//! | 1250..=1258 | Windows-125x | European, Cyrillic, Greek, Turkish, Hebrew, Arabic, Baltic, Vietnamese |
//! | 65001 | UTF-8 | `_UTF8` collations |
//!
//! The DOS code pages 437 and 850 that old SQL sort orders use have no
//! `encoding_rs` decoder; data in them is decoded as Windows-1252, which
//! agrees on the ASCII range.

use bitflags::bitflags;
use bytes::BufMut;
use encoding_rs::Encoding;

use crate::cursor::Cursor;
use crate::error::DecodeResult;

/// Code page used when nothing else matches.
pub const DEFAULT_CODEPAGE: u16 = 1252;

/// Code page number for UTF-8 collations.
pub const UTF8_CODEPAGE: u16 = 65001;

const LCID_MASK: u32 = 0x000F_FFFF;

bitflags! {
    /// Comparison flags stored in bits 20..28 of the collation word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CollationFlags: u8 {
        /// Case-insensitive comparison.
        const IGNORE_CASE = 0x01;
        /// Accent-insensitive comparison.
        const IGNORE_ACCENT = 0x02;
        /// Kana-insensitive comparison.
        const IGNORE_KANA = 0x04;
        /// Width-insensitive comparison.
        const IGNORE_WIDTH = 0x08;
        /// Binary comparison.
        const BINARY = 0x10;
        /// Code-point binary comparison.
        const BINARY2 = 0x20;
        /// Character data is UTF-8.
        const UTF8 = 0x40;
    }
}

/// A decoded collation with its resolved code page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Collation {
    lcid: u32,
    flags: CollationFlags,
    version: u8,
    sort_id: u8,
    codepage: u16,
}

impl Collation {
    /// Build a collation from its parts and resolve the code page.
    #[must_use]
    pub fn new(lcid: u32, flags: CollationFlags, version: u8, sort_id: u8) -> Self {
        let lcid = lcid & LCID_MASK;
        Self {
            lcid,
            flags,
            version: version & 0x0F,
            sort_id,
            codepage: resolve_codepage(lcid, flags, sort_id),
        }
    }

    /// Parse the 5-byte wire form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 5]) -> Self {
        let info = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self::new(
            info & LCID_MASK,
            CollationFlags::from_bits_truncate((info >> 20) as u8),
            (info >> 28) as u8,
            bytes[4],
        )
    }

    /// Read a collation from a cursor.
    pub fn decode(cur: &mut Cursor<'_>) -> DecodeResult<Self> {
        Ok(Self::from_bytes(cur.read_array()?))
    }

    /// Wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 5] {
        let info = self.lcid
            | (u32::from(self.flags.bits()) << 20)
            | (u32::from(self.version) << 28);
        let w = info.to_le_bytes();
        [w[0], w[1], w[2], w[3], self.sort_id]
    }

    /// Write the wire form.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.to_bytes());
    }

    /// Windows locale id.
    #[must_use]
    pub const fn lcid(&self) -> u32 {
        self.lcid
    }

    /// Comparison flags.
    #[must_use]
    pub const fn flags(&self) -> CollationFlags {
        self.flags
    }

    /// Collation version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// SQL sort order id, 0 for Windows collations.
    #[must_use]
    pub const fn sort_id(&self) -> u8 {
        self.sort_id
    }

    /// Resolved code page.
    #[must_use]
    pub const fn codepage(&self) -> u16 {
        self.codepage
    }

    /// Whether character data is UTF-8.
    #[must_use]
    pub const fn is_utf8(&self) -> bool {
        self.flags.contains(CollationFlags::UTF8)
    }

    /// Encoder/decoder for the resolved code page.
    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        match encoding_for_codepage(self.codepage) {
            Some(enc) => enc,
            None => {
                tracing::trace!(
                    codepage = self.codepage,
                    "no decoder for code page, using windows-1252"
                );
                encoding_rs::WINDOWS_1252
            }
        }
    }
}

impl Default for Collation {
    /// `SQL_Latin1_General_CP1_CI_AS`.
    fn default() -> Self {
        Self::new(0x0409, CollationFlags::IGNORE_CASE | CollationFlags::IGNORE_KANA | CollationFlags::IGNORE_WIDTH, 0, 52)
    }
}

fn resolve_codepage(lcid: u32, flags: CollationFlags, sort_id: u8) -> u16 {
    if flags.contains(CollationFlags::UTF8) {
        return UTF8_CODEPAGE;
    }
    if sort_id != 0 {
        if let Some(cp) = codepage_for_sort_id(sort_id) {
            return cp;
        }
    }
    codepage_for_lcid(lcid).unwrap_or(DEFAULT_CODEPAGE)
}

/// Code page of a SQL Server sort order.
#[must_use]
pub const fn codepage_for_sort_id(sort_id: u8) -> Option<u16> {
    match sort_id {
        30..=35 => Some(437),
        40..=45 | 49 | 55..=61 => Some(850),
        50..=54 | 71 | 72 | 73 | 74 | 75 | 183..=186 | 210..=217 => Some(1252),
        80..=98 => Some(1250),
        104..=108 => Some(1251),
        112..=114 | 120..=122 | 124 => Some(1253),
        128..=130 => Some(1254),
        136..=138 => Some(1255),
        144..=146 => Some(1256),
        152..=160 => Some(1257),
        192 | 193 | 200 => Some(932),
        194 | 195 => Some(949),
        196 | 197 | 201 | 202 => Some(950),
        198 | 199 | 203 => Some(936),
        204..=206 => Some(874),
        _ => None,
    }
}

/// Code page of a Windows locale id, by primary language.
#[must_use]
pub const fn codepage_for_lcid(lcid: u32) -> Option<u16> {
    match lcid & 0xFFFF {
        0x0411 => Some(932),
        0x0804 | 0x1004 => Some(936),
        0x0404 | 0x0C04 | 0x1404 => Some(950),
        0x0412 => Some(949),
        0x041E => Some(874),
        0x042A => Some(1258),
        0x0405 | 0x0415 | 0x040E | 0x041A | 0x081A | 0x141A | 0x101A | 0x041B | 0x0424
        | 0x0418 | 0x041C => Some(1250),
        0x0419 | 0x0422 | 0x0423 | 0x0402 | 0x042F | 0x0C1A | 0x201A | 0x0440 | 0x0843
        | 0x0444 | 0x0450 | 0x0485 => Some(1251),
        0x0408 => Some(1253),
        0x041F | 0x042C => Some(1254),
        0x040D => Some(1255),
        0x0401 | 0x0801 | 0x0C01 | 0x1001 | 0x1401 | 0x1801 | 0x1C01 | 0x2001 | 0x2401
        | 0x2801 | 0x2C01 | 0x3001 | 0x3401 | 0x3801 | 0x3C01 | 0x4001 | 0x0429 | 0x0420
        | 0x048C | 0x0463 => Some(1256),
        0x0425..=0x0427 => Some(1257),
        0x0409 | 0x0809 | 0x0407 | 0x040C | 0x0410 | 0x0C0A | 0x0416 | 0x0816 | 0x0413
        | 0x041D | 0x0406 | 0x0414 | 0x040B => Some(1252),
        _ => None,
    }
}

/// `encoding_rs` encoding for a code page, if one exists.
#[must_use]
pub fn encoding_for_codepage(codepage: u16) -> Option<&'static Encoding> {
    Some(match codepage {
        874 => encoding_rs::WINDOWS_874,
        932 => encoding_rs::SHIFT_JIS,
        936 => encoding_rs::GBK,
        949 => encoding_rs::EUC_KR,
        950 => encoding_rs::BIG5,
        1250 => encoding_rs::WINDOWS_1250,
        1251 => encoding_rs::WINDOWS_1251,
        1252 => encoding_rs::WINDOWS_1252,
        1253 => encoding_rs::WINDOWS_1253,
        1254 => encoding_rs::WINDOWS_1254,
        1255 => encoding_rs::WINDOWS_1255,
        1256 => encoding_rs::WINDOWS_1256,
        1257 => encoding_rs::WINDOWS_1257,
        1258 => encoding_rs::WINDOWS_1258,
        UTF8_CODEPAGE => encoding_rs::UTF_8,
        _ => return None,
    })
}
