// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checked big-endian cursors over packet regions.
//!
//! Every multi-byte scalar on the wire is big-endian and every region is a
//! whole number of DWORDs. Each module serializer gets a cursor over exactly
//! its own window of the packet; the cursor refuses to run past the window,
//! and [`WriteCursor::finish`]/[`ReadCursor::finish`] turn a window that was
//! not consumed to the byte into [`Error::PacketSize`], which the board
//! treats as a programming error and uses to halt the cycle.

use byteorder::{BigEndian, ByteOrder};

use crate::Error;

/// Rounds `n` up to a multiple of four bytes.
pub const fn align_dword(n: usize) -> usize {
    (n + 3) & !3
}

/// Bytes occupied by a packed bit row of `bits` single-bit channels,
/// padded up to a DWORD.
pub const fn bit_row_len(bits: usize) -> usize {
    align_dword(bits.div_ceil(8))
}

pub struct WriteCursor<'a> {
    region: &'static str,
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> WriteCursor<'a> {
    pub fn new(region: &'static str, buf: &'a mut [u8]) -> Self {
        Self { region, buf, pos: 0 }
    }

    fn grab(&mut self, len: usize) -> Result<&mut [u8], Error> {
        if self.pos + len > self.buf.len() {
            return Err(Error::PacketSize {
                region: self.region,
                expected: self.buf.len(),
                actual: self.pos + len,
            });
        }
        let chunk = &mut self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(chunk)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), Error> {
        BigEndian::write_u32(self.grab(4)?, v);
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), Error> {
        BigEndian::write_u64(self.grab(8)?, v);
        Ok(())
    }

    pub fn finish(self) -> Result<(), Error> {
        if self.pos != self.buf.len() {
            return Err(Error::PacketSize {
                region: self.region,
                expected: self.buf.len(),
                actual: self.pos,
            });
        }
        Ok(())
    }
}

pub struct ReadCursor<'a> {
    region: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    pub fn new(region: &'static str, buf: &'a [u8]) -> Self {
        Self { region, buf, pos: 0 }
    }

    fn grab(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.pos + len > self.buf.len() {
            return Err(Error::PacketSize {
                region: self.region,
                expected: self.buf.len(),
                actual: self.pos + len,
            });
        }
        let chunk = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(chunk)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.grab(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(BigEndian::read_u32(self.grab(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(BigEndian::read_u64(self.grab(8)?))
    }

    /// Remaining bytes in the window, without consuming them.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes `len` raw bytes, used by the direction-bitmap walks.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        self.grab(len)
    }

    pub fn finish(self) -> Result<(), Error> {
        if self.pos != self.buf.len() {
            return Err(Error::PacketSize {
                region: self.region,
                expected: self.buf.len(),
                actual: self.pos,
            });
        }
        Ok(())
    }
}
