// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-module plumbing: one [`ModuleInstance`] per function block on
//! the card, each implementing [`Module`].
//!
//! The watchdog and the wallclock exist on every card and are instantiated
//! unconditionally, first in packet order. Everything else is discovered
//! from the descriptor region: a 4-byte module ID followed by whatever
//! configuration bytes that module's factory consumes. [`lookup`] maps the
//! ID to the factory; an ID we do not recognize aborts bring-up, since the
//! packet layout past that point would be undecodable.

use std::fmt;

use crate::config::BoardConfig;
use crate::cursor::{ReadCursor, WriteCursor};
use crate::hal::HalRegistry;
use crate::Error;

pub mod gpio;
pub mod pwm;
pub mod stepgen;
pub mod wallclock;
pub mod watchdog;

pub use gpio::Gpio;
pub use pwm::Pwm;
pub use stepgen::Stepgen;
pub use wallclock::Wallclock;
pub use watchdog::Watchdog;

/// Four ASCII-ish bytes identifying a module type in the descriptor
/// region.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ModuleId(pub [u8; 4]);

pub const GPIO: ModuleId = ModuleId(*b"gpio");
pub const PWM: ModuleId = ModuleId(*b"pwm_");
pub const STEPGEN: ModuleId = ModuleId(*b"step");

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            for b in self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", u32::from_be_bytes(self.0))
        }
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({self})")
    }
}

/// Board-level state every module can see during a cycle.
#[derive(Debug)]
pub struct CycleState {
    pub clock_frequency: u32,
    pub clock_frequency_recip: f64,
    /// Nominal period of the calling real-time thread, as passed to the
    /// current `read`/`write` invocation.
    pub period_ns: i64,
    /// Card time at the last packet, published by the wallclock module
    /// early in every read pass.
    pub wallclock_ticks: u64,
}

/// One function block's serializers and sizes.
///
/// The size methods are fixed after construction; the board uses them once
/// to slice the packet regions into per-module windows, and each serializer
/// must then fill (or drain) its window exactly.
pub trait Module {
    fn config_len(&self) -> usize {
        0
    }

    fn write_len(&self) -> usize {
        0
    }

    fn read_len(&self) -> usize {
        0
    }

    /// Emits the one-time configuration payload. Runs during the first
    /// `write`, when the cycle period is first known.
    fn configure(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        let _ = (w, cycle);
        Ok(())
    }

    /// Appends this module's slice of the cyclic command packet.
    fn prepare_write(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        let _ = (w, cycle);
        Ok(())
    }

    /// Consumes this module's slice of the cyclic status packet.
    fn process_read(
        &mut self,
        r: &mut ReadCursor<'_>,
        cycle: &mut CycleState,
    ) -> Result<(), Error> {
        let _ = (r, cycle);
        Ok(())
    }
}

/// Sum over the module kinds this driver knows. The board owns one of
/// these per function block and dispatches through [`Module`].
#[derive(Debug)]
pub enum ModuleInstance {
    Watchdog(Watchdog),
    Wallclock(Wallclock),
    Gpio(Gpio),
    Pwm(Pwm),
    Stepgen(Stepgen),
}

impl ModuleInstance {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Watchdog(_) => "watchdog",
            Self::Wallclock(_) => "wallclock",
            Self::Gpio(_) => "gpio",
            Self::Pwm(_) => "pwm",
            Self::Stepgen(_) => "stepgen",
        }
    }

    fn as_module(&self) -> &dyn Module {
        match self {
            Self::Watchdog(m) => m,
            Self::Wallclock(m) => m,
            Self::Gpio(m) => m,
            Self::Pwm(m) => m,
            Self::Stepgen(m) => m,
        }
    }

    fn as_module_mut(&mut self) -> &mut dyn Module {
        match self {
            Self::Watchdog(m) => m,
            Self::Wallclock(m) => m,
            Self::Gpio(m) => m,
            Self::Pwm(m) => m,
            Self::Stepgen(m) => m,
        }
    }
}

impl Module for ModuleInstance {
    fn config_len(&self) -> usize {
        self.as_module().config_len()
    }

    fn write_len(&self) -> usize {
        self.as_module().write_len()
    }

    fn read_len(&self) -> usize {
        self.as_module().read_len()
    }

    fn configure(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        self.as_module_mut().configure(w, cycle)
    }

    fn prepare_write(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        self.as_module_mut().prepare_write(w, cycle)
    }

    fn process_read(
        &mut self,
        r: &mut ReadCursor<'_>,
        cycle: &mut CycleState,
    ) -> Result<(), Error> {
        self.as_module_mut().process_read(r, cycle)
    }
}

/// Everything a module factory may need while the board is coming up.
pub struct BringUp<'a> {
    pub board: &'a str,
    pub clock_frequency: u32,
    pub config: &'a BoardConfig,
    pub hal: &'a mut dyn HalRegistry,
}

/// Parses one module's configuration bytes out of the descriptor region
/// and produces the instance, pins allocated and defaults applied.
pub type Factory =
    fn(&mut BringUp<'_>, &mut ReadCursor<'_>) -> Result<ModuleInstance, Error>;

/// The build-time module registry. Order here is irrelevant; emission
/// order within a packet is the card's descriptor order.
static REGISTRY: &[(ModuleId, Factory)] = &[
    (GPIO, gpio::from_descriptor),
    (PWM, pwm::from_descriptor),
    (STEPGEN, stepgen::from_descriptor),
];

pub fn lookup(id: ModuleId) -> Option<Factory> {
    REGISTRY.iter().find(|(mid, _)| *mid == id).map(|&(_, f)| f)
}

/// `<board>.<module>.<name-or-index>` base for a channel's pins.
pub(crate) fn channel_base(
    board: &str,
    module: &str,
    index: usize,
    name: Option<&str>,
) -> String {
    match name {
        Some(name) => format!("{board}.{module}.{name}"),
        None => format!("{board}.{module}.{index:02}"),
    }
}
