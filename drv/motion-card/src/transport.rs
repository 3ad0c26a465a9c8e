// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The byte-level seam between the driver and a card.
//!
//! Concrete transports (etherbone over UDP, SPI character devices, the test
//! simulator) implement [`Transport`]. The driver only ever asks for four
//! things: addressed reads and writes during bring-up, and the two cyclic
//! packet exchanges. The cyclic buffers are allocated by the board with
//! [`Transport::header_len`] bytes of slack in front of the payload so a
//! framing transport can build its wire frame in place instead of copying.

use crate::cursor::align_dword;

/// Failure of a single transport operation. Converted into
/// [`crate::Error::Transport`] at the driver layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("send failed")]
    Send,

    #[error("receive failed")]
    Recv,

    #[error("timed out waiting for the card")]
    Timeout,

    #[error("packet of {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("malformed frame from the card")]
    BadFrame,

    #[error("transport has been terminated")]
    Terminated,
}

/// Resolved base addresses and payload sizes of the card's register bank,
/// handed to the transport once at bring-up so it can pre-build the request
/// frames it will repeat every cycle.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RegionMap {
    pub init: u32,
    pub reset: u32,
    pub config: u32,
    pub write: u32,
    pub read: u32,
    /// Payload bytes of the cyclic write packet (no transport prefix).
    pub write_len: usize,
    /// Payload bytes of the cyclic read packet (no transport prefix).
    pub read_len: usize,
}

impl RegionMap {
    /// Lays the regions out in their fixed order: header at zero, reset
    /// directly after the module descriptors, then config, write, and read
    /// back to back.
    pub fn resolve(
        module_desc_size: usize,
        config_len: usize,
        write_len: usize,
        read_len: usize,
    ) -> Self {
        debug_assert_eq!(write_len, align_dword(write_len));
        debug_assert_eq!(read_len, align_dword(read_len));
        let reset = (crate::header::INIT_LEN + module_desc_size) as u32;
        let config = reset + 4;
        let write = config + config_len as u32;
        let read = write + write_len as u32;
        Self {
            init: 0,
            reset,
            config,
            write,
            read,
            write_len,
            read_len,
        }
    }
}

pub trait Transport {
    /// Bytes of framing the transport needs in front of each cyclic packet
    /// payload: zero for SPI-style transports, sixteen for the etherbone
    /// record framing.
    fn header_len(&self) -> usize {
        0
    }

    /// Called once at bring-up with the resolved layout. A transport that
    /// pre-builds its cyclic request frames does so here.
    fn prepare(&mut self, regions: &RegionMap) -> Result<(), TransportError> {
        let _ = regions;
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `addr`.
    fn read_bytes(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), TransportError>;

    /// Writes `buf` starting at `addr`.
    fn write_bytes(
        &mut self,
        addr: u32,
        buf: &[u8],
    ) -> Result<(), TransportError>;

    /// Fetches the read region into `buf[header_len()..]`. The prefix is
    /// scratch space for the transport's own framing.
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Ships `buf[header_len()..]` to the write region. The prefix is
    /// scratch space for the transport's own framing.
    fn write_packet(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Tears the connection down; every later call must fail fast.
    fn terminate(&mut self) {}
}
