// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PWM/PDM generators.
//!
//! Write-only module: a packed enable bitmap (same row scheme as the GPIO
//! outputs) followed by a `(period, width)` pair of clock-cycle counts per
//! channel. A zero `pwm_freq` selects pulse-density mode, where the period
//! is zero and the width carries the duty cycle as a 16-bit fraction of
//! 0xFFFF.
//!
//! Duty is `value / scale + offset`, clipped into `[min_dc, max_dc]` after
//! that pair is itself clipped into `[0, 1]` with `min <= max`. The
//! rounded, actually-emitted settings are published back through the
//! `curr_*` pins.

use crate::cursor::{bit_row_len, ReadCursor, WriteCursor};
use crate::hal::{Pin, PinDir};
use crate::modules::{
    channel_base, BringUp, CycleState, Module, ModuleInstance,
};
use crate::Error;

/// Wire bytes per channel: period and width.
pub const CHANNEL_WRITE_LEN: usize = 8;

/// Guard against a divide-by-zero scale, as for the stepgen scale.
const MIN_SCALE: f64 = 1e-20;

#[derive(Debug)]
struct PwmChannel {
    base: String,
    enable: Pin<bool>,
    value: Pin<f64>,
    scale: Pin<f64>,
    offset: Pin<f64>,
    dither_pwm: Pin<bool>,
    pwm_freq: Pin<f64>,
    min_dc: Pin<f64>,
    max_dc: Pin<f64>,
    curr_dc: Pin<f64>,
    curr_pwm_freq: Pin<f64>,
    curr_period: Pin<u32>,
    curr_width: Pin<u32>,

    memo_scale: f64,
    scale_recip: f64,
    memo_pwm_freq: f64,
    period_recip: f64,
    dither_err: f64,
}

#[derive(Debug)]
pub struct Pwm {
    channels: Vec<PwmChannel>,
}

pub fn from_descriptor(
    bring: &mut BringUp<'_>,
    desc: &mut ReadCursor<'_>,
) -> Result<ModuleInstance, Error> {
    let count = desc
        .read_u32()
        .map_err(|_| Error::Config("pwm: truncated module descriptor"))?
        as usize;
    if !bring.config.pwm.is_empty() && bring.config.pwm.len() != count {
        return Err(Error::Config(
            "pwm entries do not match the card's channel count",
        ));
    }

    let mut channels = Vec::with_capacity(count);
    for index in 0..count {
        let name = bring.config.pwm.get(index);
        let base = channel_base(
            bring.board,
            "pwm",
            index,
            name.and_then(|c| c.name.as_deref()),
        );
        let pin_f = |hal: &mut dyn crate::hal::HalRegistry,
                     pin: &str,
                     dir: PinDir| {
            hal.pin_float(&format!("{base}.{pin}"), dir)
        };
        let channel = PwmChannel {
            enable: bring
                .hal
                .pin_bit(&format!("{base}.enable"), PinDir::In)?,
            value: pin_f(bring.hal, "value", PinDir::In)?,
            scale: pin_f(bring.hal, "scale", PinDir::In)?,
            offset: pin_f(bring.hal, "offset", PinDir::In)?,
            dither_pwm: bring
                .hal
                .pin_bit(&format!("{base}.dither_pwm"), PinDir::In)?,
            pwm_freq: pin_f(bring.hal, "pwm_freq", PinDir::In)?,
            min_dc: pin_f(bring.hal, "min_dc", PinDir::In)?,
            max_dc: pin_f(bring.hal, "max_dc", PinDir::In)?,
            curr_dc: pin_f(bring.hal, "curr_dc", PinDir::Out)?,
            curr_pwm_freq: pin_f(bring.hal, "curr_pwm_freq", PinDir::Out)?,
            curr_period: bring
                .hal
                .pin_u32(&format!("{base}.curr_period"), PinDir::Out)?,
            curr_width: bring
                .hal
                .pin_u32(&format!("{base}.curr_width"), PinDir::Out)?,
            base,
            memo_scale: 0.0,
            scale_recip: 1.0,
            memo_pwm_freq: -1.0,
            period_recip: 0.0,
            dither_err: 0.0,
        };

        // Generators come up disabled with a unity scale and the full duty
        // range: nothing moves until the controller says so.
        channel.scale.set(1.0);
        channel.pwm_freq.set(100_000.0);
        channel.min_dc.set(0.0);
        channel.max_dc.set(1.0);
        channels.push(channel);
    }

    Ok(ModuleInstance::Pwm(Pwm { channels }))
}

impl PwmChannel {
    /// Duty limits are operator pins, so they are re-validated (and
    /// written back) every cycle.
    fn clipped_duty_limits(&self) -> (f64, f64) {
        let max = self.max_dc.get().clamp(0.0, 1.0);
        let mut min = self.min_dc.get().clamp(0.0, 1.0);
        if min > max {
            min = max;
        }
        self.max_dc.set(max);
        self.min_dc.set(min);
        (min, max)
    }

    fn duty(&mut self) -> f64 {
        if self.scale.get() != self.memo_scale {
            if self.scale.get().abs() < MIN_SCALE {
                log::warn!(
                    "{}: scale of {} is too close to zero, using 1.0",
                    self.base,
                    self.scale.get(),
                );
                self.scale.set(1.0);
            }
            self.memo_scale = self.scale.get();
            self.scale_recip = 1.0 / self.memo_scale;
        }

        let (min_dc, max_dc) = self.clipped_duty_limits();
        let duty = self.value.get() * self.scale_recip + self.offset.get();
        duty.max(0.0).clamp(min_dc, max_dc)
    }

    /// Computes the `(period, width)` pair for the wire and refreshes the
    /// `curr_*` pins.
    fn period_and_width(&mut self, clock_frequency: u32) -> (u32, u32) {
        let duty = self.duty();

        if self.pwm_freq.get() != 0.0 {
            if self.pwm_freq.get() < 1.0 {
                self.pwm_freq.set(1.0);
            }
            if self.pwm_freq.get() != self.memo_pwm_freq {
                self.memo_pwm_freq = self.pwm_freq.get();
                let period = (clock_frequency as f64
                    / self.memo_pwm_freq)
                    .round() as u32;
                self.curr_period.set(period);
                self.period_recip = 1.0 / period as f64;
            }
            let period = self.curr_period.get();
            let exact = period as f64 * duty;
            let width = if self.dither_pwm.get() {
                // Error-diffusion rounding: the fraction lost this cycle
                // is carried into the next, so the long-run average duty
                // hits the command even between representable widths.
                let target = exact + self.dither_err;
                let width = target.floor();
                self.dither_err = target - width;
                width as u32
            } else {
                self.dither_err = 0.0;
                exact.round() as u32
            };
            self.curr_width.set(width);
            self.curr_dc.set(width as f64 * self.period_recip);
            self.curr_pwm_freq
                .set(clock_frequency as f64 / period as f64);
            (period, width)
        } else {
            // PDM: the width is the duty as a fraction of full scale.
            let width = (f64::from(u16::MAX) * duty).round() as u32;
            self.memo_pwm_freq = 0.0;
            self.curr_period.set(0);
            self.curr_width.set(width);
            self.curr_dc.set(duty);
            self.curr_pwm_freq.set(0.0);
            (0, width)
        }
    }
}

impl Module for Pwm {
    fn write_len(&self) -> usize {
        bit_row_len(self.channels.len())
            + CHANNEL_WRITE_LEN * self.channels.len()
    }

    fn prepare_write(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        for row in self.channels.chunks(32) {
            let mut word = 0u32;
            for (bit, channel) in row.iter().enumerate() {
                if channel.enable.get() {
                    word |= 1 << (31 - bit);
                }
            }
            w.write_u32(word)?;
        }

        for channel in &mut self.channels {
            let (period, width) =
                channel.period_and_width(cycle.clock_frequency);
            w.write_u32(period)?;
            w.write_u32(width)?;
        }
        Ok(())
    }
}
