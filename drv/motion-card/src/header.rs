// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The 32-byte identification header at address zero.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{Error, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};

/// Value of [`CardHeader::magic`] on every card in the family.
pub const MAGIC: u32 = 0x1805_2022;

/// Bytes read from address zero at bring-up.
pub const INIT_LEN: usize = 32;

/// Bytes of the printable board name field.
pub const NAME_LEN: usize = 16;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CardHeader {
    pub magic: U32,
    reserved0: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub version_patch: u8,
    pub clock_frequency: U32,
    reserved1: u8,
    pub module_count: u8,
    pub module_data_size: U16,
    pub name: [u8; NAME_LEN],
}

const_assert_eq!(core::mem::size_of::<CardHeader>(), INIT_LEN);

impl CardHeader {
    /// Parses and validates the header bytes: magic word, protocol version
    /// (a `patch` difference is only logged), and board name.
    pub fn parse(buf: &[u8; INIT_LEN]) -> Result<&Self, Error> {
        let header = CardHeader::ref_from_bytes(buf)
            .unwrap_or_else(|_| unreachable!("sizes are const-asserted"));

        if header.magic.get() != MAGIC {
            return Err(Error::Magic(header.magic.get()));
        }
        if header.version_major != VERSION_MAJOR
            || header.version_minor != VERSION_MINOR
        {
            return Err(Error::Version {
                major: header.version_major,
                minor: header.version_minor,
            });
        }
        if header.version_patch != VERSION_PATCH {
            log::info!(
                "firmware {}.{}.{} differs from driver {}.{}.{} in patch \
                 level only; consider updating one of them",
                header.version_major,
                header.version_minor,
                header.version_patch,
                VERSION_MAJOR,
                VERSION_MINOR,
                VERSION_PATCH,
            );
        }
        header.board_name()?;
        Ok(header)
    }

    /// The board name: the bytes before the first NUL, which must exist,
    /// be printable ASCII, and be non-empty.
    pub fn board_name(&self) -> Result<&str, Error> {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::Name)?;
        if len == 0 {
            return Err(Error::Name);
        }
        let name = &self.name[..len];
        if !name.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(Error::Name);
        }
        Ok(std::str::from_utf8(name)
            .unwrap_or_else(|_| unreachable!("checked ASCII above")))
    }
}
