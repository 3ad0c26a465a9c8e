// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side driver for FPGA-based motion-control cards.
//!
//! The card exposes a memory-mapped register bank: a 32-byte identification
//! header, a module descriptor region, a reset register, a configuration
//! region, and a write and a read data region. At registration the driver
//! reads the header and the descriptors, instantiates one [`modules`] entry
//! per descriptor, resolves the base address of every region, and resets the
//! card. From then on the real-time thread calls [`Board::read`] and
//! [`Board::write`] once per control cycle; each call exchanges one packet
//! with the card and walks it through the modules' serializers.
//!
//! Two seams keep the environment out of this crate: [`Transport`] carries
//! addressed bytes to the card (Ethernet, SPI, or an in-memory simulation),
//! and [`hal::HalRegistry`] allocates the named shared pins through which
//! the motion controller observes and commands the modules.

#![forbid(unsafe_code)]

pub mod board;
pub mod config;
pub mod cursor;
pub mod hal;
pub mod header;
pub mod modules;
pub mod transport;

pub use board::Board;
pub use config::BoardConfig;
pub use modules::ModuleId;
pub use transport::{RegionMap, Transport, TransportError};

/// Driver protocol version. `major`/`minor` must match the firmware; a
/// `patch` difference is reported but harmless.
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_PATCH: u8 = 0;

/// Attempts per phase of the reset handshake before giving up.
pub const MAX_RESET_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("bad magic word {0:#010x}; is this a motion card?")]
    Magic(u32),

    #[error(
        "firmware {major}.{minor}.x is incompatible with driver \
         {VERSION_MAJOR}.{VERSION_MINOR}.x"
    )]
    Version { major: u8, minor: u8 },

    #[error("board name is not a printable NUL-terminated string")]
    Name,

    #[error("firmware reports unknown module id {0}")]
    UnknownModule(ModuleId),

    #[error("bad configuration: {0}")]
    Config(&'static str),

    #[error("reset handshake did not converge in {MAX_RESET_RETRIES} tries")]
    Reset,

    #[error(
        "{region} cursor stopped at byte {actual} of {expected}; \
         module serializers out of sync with their sizes"
    )]
    PacketSize {
        region: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("parameter `{0}` cannot change after the card is configured")]
    ParamImmutable(&'static str),

    #[error("hal: {0}")]
    Hal(#[from] hal::HalError),
}
