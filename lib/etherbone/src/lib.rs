// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec for the etherbone memory-access record.
//!
//! The Ethernet transport to the card wraps every bus access in a 16-byte
//! record header followed by a list of 32-bit big-endian words. A write
//! request carries the base address in the header and the data words in the
//! payload; a read request leaves the base address zero and lists the
//! addresses to fetch in the payload. The card answers a read with the same
//! header shape and the data words in request order.
//!
//! The gateware accepts a single record per frame and at most [`MAX_WORDS`]
//! words in it, so there is no record chaining here. Sockets, retries, and
//! the transmit-queue drain live with the transport; this crate only
//! builds and parses frames.

#![forbid(unsafe_code)]

use static_assertions::const_assert_eq;
use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// First two bytes of every frame.
pub const MAGIC: [u8; 2] = [0x4e, 0x6f];

/// Protocol version 1, probe/read flags clear.
pub const VERSION: u8 = 0x10;

/// Address and port widths are both 32 bits.
pub const PORT_ADDR_32: u8 = 0x44;

/// All four byte lanes enabled; the bus does not do sub-word accesses.
pub const BYTE_ENABLE: u8 = 0x0f;

/// Size of [`RecordHeader`] on the wire.
pub const HEADER_LEN: usize = 16;

/// The word counts are single bytes.
pub const MAX_WORDS: usize = 255;

/// The 16-byte frame header.
///
/// Field names follow the record layout: `wcount`/`rcount` are the number
/// of 32-bit payload words for a write or a read, and exactly one of them
/// is non-zero in any frame we emit.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    pub magic: [u8; 2],
    pub version: u8,
    pub port_addr: u8,
    pub padding: [u8; 4],
    pub flags: u8,
    pub byte_enable: u8,
    pub wcount: u8,
    pub rcount: u8,
    pub base_addr: U32,
}

const_assert_eq!(core::mem::size_of::<RecordHeader>(), HEADER_LEN);

impl RecordHeader {
    fn new(wcount: u8, rcount: u8, base_addr: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            port_addr: PORT_ADDR_32,
            padding: [0; 4],
            flags: 0,
            byte_enable: BYTE_ENABLE,
            wcount,
            rcount,
            base_addr: U32::new(base_addr),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit a single record")]
    TooLong(usize),
    #[error("payload of {0} bytes is not a whole number of words")]
    Unaligned(usize),
    #[error("destination buffer too small for the frame")]
    BufferTooSmall,
    #[error("frame of {0} bytes is shorter than a record header")]
    Truncated(usize),
    #[error("bad record magic {0:#06x}")]
    BadMagic(u16),
    #[error("frame payload is {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
}

fn words_for(len: usize) -> Result<u8, FrameError> {
    if len % 4 != 0 {
        return Err(FrameError::Unaligned(len));
    }
    let words = len / 4;
    if words > MAX_WORDS {
        return Err(FrameError::TooLong(len));
    }
    Ok(words as u8)
}

/// Builds a request for `len` bytes starting at `addr` into `buf`,
/// returning the frame length. The payload is the list of word addresses
/// the card should fetch, in reply order.
pub fn read_request(
    addr: u32,
    len: usize,
    buf: &mut [u8],
) -> Result<usize, FrameError> {
    let words = words_for(len)?;
    let frame_len = HEADER_LEN + len;
    let frame =
        buf.get_mut(..frame_len).ok_or(FrameError::BufferTooSmall)?;

    let header = RecordHeader::new(0, words, 0);
    frame[..HEADER_LEN].copy_from_slice(header.as_bytes());
    for (i, slot) in frame[HEADER_LEN..].chunks_exact_mut(4).enumerate() {
        slot.copy_from_slice(&(addr + 4 * i as u32).to_be_bytes());
    }
    Ok(frame_len)
}

/// Builds a write of `data` to `addr` into `buf`, returning the frame
/// length. `data` must be a whole number of 32-bit words, already in wire
/// byte order.
pub fn write_request(
    addr: u32,
    data: &[u8],
    buf: &mut [u8],
) -> Result<usize, FrameError> {
    let words = words_for(data.len())?;
    let frame_len = HEADER_LEN + data.len();
    let frame =
        buf.get_mut(..frame_len).ok_or(FrameError::BufferTooSmall)?;

    let header = RecordHeader::new(words, 0, addr);
    frame[..HEADER_LEN].copy_from_slice(header.as_bytes());
    frame[HEADER_LEN..].copy_from_slice(data);
    Ok(frame_len)
}

/// Validates a received frame and returns its payload, which must be
/// exactly `expected_len` bytes of data words.
pub fn parse_reply(
    frame: &[u8],
    expected_len: usize,
) -> Result<&[u8], FrameError> {
    let (header, payload) = RecordHeader::ref_from_prefix(frame)
        .map_err(|_| FrameError::Truncated(frame.len()))?;
    if header.magic != MAGIC {
        return Err(FrameError::BadMagic(u16::from_be_bytes(header.magic)));
    }
    if payload.len() != expected_len {
        return Err(FrameError::WrongLength {
            expected: expected_len,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

/// Decodes the address list of a read request, used by the card side of
/// the exchange (and by tests standing in for it).
pub fn read_request_addrs(
    frame: &[u8],
) -> Result<impl Iterator<Item = u32> + '_, FrameError> {
    let (header, payload) = RecordHeader::ref_from_prefix(frame)
        .map_err(|_| FrameError::Truncated(frame.len()))?;
    if header.magic != MAGIC {
        return Err(FrameError::BadMagic(u16::from_be_bytes(header.magic)));
    }
    let expected = usize::from(header.rcount) * 4;
    if payload.len() != expected {
        return Err(FrameError::WrongLength {
            expected,
            actual: payload.len(),
        });
    }
    Ok(payload
        .chunks_exact(4)
        .map(|w| u32::from_be_bytes(w.try_into().unwrap())))
}
