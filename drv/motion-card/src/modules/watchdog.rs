// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The card-side watchdog.
//!
//! Every command packet restarts a countdown on the card; if the host
//! stalls long enough for it to reach zero, the card drops its outputs and
//! latches the bite flag. The serialized word is the timeout in card clock
//! cycles with the top bit set (the card's enable flag), so merely keeping
//! the cyclic writes flowing is what pets the dog.
//!
//! `timeout_ns` is operator-visible and writable. It is a float parameter
//! rather than a u32 because lawful timeouts (tens of seconds on a slow
//! card) overflow 32 bits of nanoseconds; integral nanosecond values of
//! that size are exact in an f64.

use crate::cursor::{ReadCursor, WriteCursor};
use crate::hal::{HalRegistry, ParamDir, Pin, PinDir};
use crate::modules::{CycleState, Module, ModuleInstance};
use crate::Error;

pub const WRITE_LEN: usize = 4;
pub const READ_LEN: usize = 4;

/// Largest cycle count the card's countdown register accepts; the top bit
/// is the enable flag.
const MAX_TIMEOUT_CYCLES: u32 = 0x7fff_ffff;

#[derive(Debug)]
pub struct Watchdog {
    board: String,
    timeout_ns: Pin<f64>,
    timeout_cycles: Pin<u32>,
    has_bitten: Pin<bool>,
    memo_timeout_ns: f64,
    advisory_logged: bool,
    wire_bite: bool,
}

impl Watchdog {
    pub fn new(
        board: &str,
        default_timeout_ns: u64,
        hal: &mut dyn HalRegistry,
    ) -> Result<ModuleInstance, Error> {
        let timeout_ns = hal
            .param_float(&format!("{board}.watchdog.timeout_ns"), ParamDir::Rw)?;
        let timeout_cycles = hal.param_u32(
            &format!("{board}.watchdog.timeout_cycles"),
            ParamDir::Ro,
        )?;
        let has_bitten =
            hal.pin_bit(&format!("{board}.watchdog.has_bitten"), PinDir::Io)?;
        timeout_ns.set(default_timeout_ns as f64);
        Ok(ModuleInstance::Watchdog(Self {
            board: board.to_string(),
            timeout_ns,
            timeout_cycles,
            has_bitten,
            memo_timeout_ns: -1.0,
            advisory_logged: false,
            wire_bite: false,
        }))
    }

    /// ns -> cycles, clipped into the register's range. On clip the
    /// effective timeout is written back so the operator sees what the
    /// card will actually enforce.
    fn refresh_timeout(&mut self, clock_frequency: u32, period_ns: i64) {
        let requested_ns = self.timeout_ns.get();
        if requested_ns == self.memo_timeout_ns {
            return;
        }
        self.memo_timeout_ns = requested_ns;

        if requested_ns < 1.5 * period_ns as f64 {
            if !self.advisory_logged {
                log::warn!(
                    "{}: watchdog timeout ({} ns) is dangerously short \
                     next to the {} ns write period",
                    self.board,
                    requested_ns,
                    period_ns,
                );
                self.advisory_logged = true;
            }
        } else {
            self.advisory_logged = false;
        }

        // Multiply before dividing: ns * f_clk is exact in an f64 for any
        // lawful timeout, where ns * (f_clk / 1e9) picks up the rounding
        // of 1e-9 and drifts the count.
        let clock = f64::from(clock_frequency);
        let cycles = requested_ns * clock / 1e9 - 1.0;
        if cycles > MAX_TIMEOUT_CYCLES as f64 {
            let effective_ns =
                (MAX_TIMEOUT_CYCLES as f64 + 1.0) * 1e9 / clock;
            self.timeout_cycles.set(MAX_TIMEOUT_CYCLES);
            self.timeout_ns.set(effective_ns);
            self.memo_timeout_ns = effective_ns;
            log::error!(
                "{}: requested watchdog timeout is out of range, \
                 clipping to the maximum of {} ns",
                self.board,
                effective_ns,
            );
        } else {
            self.timeout_cycles.set(cycles.max(0.0) as u32);
        }
    }
}

impl Module for Watchdog {
    fn write_len(&self) -> usize {
        WRITE_LEN
    }

    fn read_len(&self) -> usize {
        READ_LEN
    }

    fn prepare_write(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        self.refresh_timeout(cycle.clock_frequency, cycle.period_ns);
        w.write_u32(self.timeout_cycles.get() | 0x8000_0000)
    }

    fn process_read(
        &mut self,
        r: &mut ReadCursor<'_>,
        _cycle: &mut CycleState,
    ) -> Result<(), Error> {
        let flag = r.read_u32()?;
        let bitten = flag & 1 != 0;
        if bitten && !self.wire_bite {
            log::error!(
                "{}: watchdog has bitten; outputs are down until reset",
                self.board,
            );
            // Sticky: stays set until the operator clears it.
            self.has_bitten.set(true);
        }
        self.wire_bite = bitten;
        Ok(())
    }
}
