// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The card's free-running 64-bit tick counter.
//!
//! Read-only: eight bytes at the front of every status packet (right after
//! the watchdog flag). The composite value is published into
//! [`CycleState::wallclock_ticks`] for the stepgen scheduler; the two
//! halves are also exposed as u32 pins for the operator.

use crate::cursor::ReadCursor;
use crate::hal::{HalRegistry, Pin, PinDir};
use crate::modules::{CycleState, Module, ModuleInstance};
use crate::Error;

pub const READ_LEN: usize = 8;

#[derive(Debug)]
pub struct Wallclock {
    board: String,
    ticks_msb: Pin<u32>,
    ticks_lsb: Pin<u32>,
    last: u64,
    regression_logged: bool,
}

impl Wallclock {
    pub fn new(
        board: &str,
        hal: &mut dyn HalRegistry,
    ) -> Result<ModuleInstance, Error> {
        Ok(ModuleInstance::Wallclock(Self {
            board: board.to_string(),
            ticks_msb: hal
                .pin_u32(&format!("{board}.wallclock.ticks_msb"), PinDir::Out)?,
            ticks_lsb: hal
                .pin_u32(&format!("{board}.wallclock.ticks_lsb"), PinDir::Out)?,
            last: 0,
            regression_logged: false,
        }))
    }
}

impl Module for Wallclock {
    fn read_len(&self) -> usize {
        READ_LEN
    }

    fn process_read(
        &mut self,
        r: &mut ReadCursor<'_>,
        cycle: &mut CycleState,
    ) -> Result<(), Error> {
        let ticks = r.read_u64()?;

        // The counter only ever counts up; going backwards means the
        // transport handed us a stale or reordered packet.
        if ticks < self.last {
            if !self.regression_logged {
                log::error!(
                    "{}: wallclock went backwards ({} after {}); \
                     transport is reordering or duplicating packets",
                    self.board,
                    ticks,
                    self.last,
                );
                self.regression_logged = true;
            }
        } else {
            self.regression_logged = false;
        }
        self.last = ticks;

        cycle.wallclock_ticks = ticks;
        self.ticks_msb.set((ticks >> 32) as u32);
        self.ticks_lsb.set(ticks as u32);
        Ok(())
    }
}
