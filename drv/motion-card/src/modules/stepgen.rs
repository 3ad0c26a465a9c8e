// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Step generators: a predictive velocity/acceleration scheduler.
//!
//! The card executes `(target velocity, acceleration)` pairs, all of them
//! taking effect at a single future instant of its own clock, the apply
//! time, which prefixes the per-channel write data. The driver's job each
//! cycle is to pick the next apply time (one period out, self-healing
//! against latency excursions), predict where every axis will be at that
//! instant, and compute the command that brings it from there toward the
//! controller's commanded position or velocity.
//!
//! Positions on the wire are 64-bit fixed-point with a 32-bit fractional
//! "pick-off"; velocity and acceleration carry additional fractional bits
//! chosen at configure time so the velocity register resolves below the
//! card's maximum step frequency. Velocities ride the wire biased by
//! `+0x8000_0000` so negative values map into an unsigned register.

use crate::cursor::{ReadCursor, WriteCursor};
use crate::hal::{ParamDir, Pin, PinDir};
use crate::modules::{
    channel_base, BringUp, CycleState, Module, ModuleInstance,
};
use crate::Error;

/// Apply time, shipped once ahead of the per-channel blocks.
pub const GENERAL_WRITE_LEN: usize = 8;

/// Per channel on the write side: biased velocity target, acceleration.
pub const CHANNEL_WRITE_LEN: usize = 8;

/// Per channel on the read side: 64-bit position, biased 32-bit velocity.
pub const CHANNEL_READ_LEN: usize = 12;

/// The packed timings word.
pub const CONFIG_LEN: usize = 4;

/// The step drivers the card targets stop being happy above this pulse
/// rate; the velocity pick-off is chosen against it.
const MAX_DRIVER_FREQ: f64 = 400e3;

/// Slots in the loop-period moving average.
const PERIOD_RING: usize = 10;

const VELOCITY_BIAS: i64 = 0x8000_0000;

/// Sub-field limits of the packed timings word,
/// `(steplen << 22) | (dir_hold << 12) | dir_setup`.
const MAX_STEPLEN_CYCLES: u32 = (1 << 10) - 1;
const MAX_DIR_HOLD_CYCLES: u32 = (1 << 10) - 1;
const MAX_DIR_SETUP_CYCLES: u32 = (1 << 13) - 1;

#[derive(Debug)]
struct ChannelPins {
    enable: Pin<bool>,
    velocity_mode: Pin<bool>,
    position_cmd: Pin<f64>,
    velocity_cmd: Pin<f64>,
    acceleration_cmd: Pin<f64>,
    counts: Pin<u32>,
    position_fb: Pin<f64>,
    position_prediction: Pin<f64>,
    speed_fb: Pin<f64>,
    speed_prediction: Pin<f64>,
}

#[derive(Debug)]
struct ChannelParams {
    frequency: Pin<f64>,
    max_acceleration: Pin<f64>,
    max_velocity: Pin<f64>,
    position_scale: Pin<f64>,
    steplen: Pin<u32>,
    stepspace: Pin<u32>,
    dir_hold_time: Pin<u32>,
    dir_setup_time: Pin<u32>,
}

/// Conversion factors between user units and the card's fixed-point
/// registers; recomputed only when `position_scale` changes.
#[derive(Debug)]
struct Scales {
    memo_position_scale: f64,
    scale_recip: f64,
    fpga_pos_scale_inv: f64,
    fpga_speed_scale: f64,
    fpga_speed_scale_inv: f64,
    fpga_acc_scale: f64,
}

impl Default for Scales {
    fn default() -> Self {
        Self {
            // NaN compares unequal to every scale, forcing the first
            // refresh to run even for a configured scale of zero.
            memo_position_scale: f64::NAN,
            scale_recip: 1.0,
            fpga_pos_scale_inv: 0.0,
            fpga_speed_scale: 0.0,
            fpga_speed_scale_inv: 0.0,
            fpga_acc_scale: 0.0,
        }
    }
}

#[derive(Debug)]
struct StepChannel {
    base: String,
    pins: ChannelPins,
    params: ChannelParams,
    scales: Scales,

    // Timings as configured, in nanoseconds and in cycles. Parameter
    // changes after configure are rolled back against the memo.
    memo_steplen: u32,
    memo_stepspace: u32,
    memo_dir_hold: u32,
    memo_dir_setup: u32,
    steplen_cycles: u32,
    stepspace_cycles: u32,

    memo_position_cmd: f64,
    memo_acceleration: f64,
    acceleration_recip: f64,
    max_velocity_warned: bool,

    // The command most recently shipped, which the prediction integrates
    // until its apply time has fully played out.
    flt_speed: f64,
    flt_time: f64,
    fpga_time: u64,
}

#[derive(Debug)]
pub struct Stepgen {
    board: String,
    channels: Vec<StepChannel>,
    period_s: Pin<f64>,
    period_s_recip: Pin<f64>,

    // Shared apply-time schedule, in card clock ticks.
    apply_time: u64,
    prev_wallclock: u64,
    cycles_per_period: f64,
    ring: [f64; PERIOD_RING],
    ring_sum: f64,
    ring_pos: usize,
    window_warned: bool,

    pick_off_pos: u32,
    pick_off_vel: u32,
    pick_off_acc: u32,
    max_frequency: f64,
}

pub fn from_descriptor(
    bring: &mut BringUp<'_>,
    desc: &mut ReadCursor<'_>,
) -> Result<ModuleInstance, Error> {
    let count = desc
        .read_u32()
        .map_err(|_| Error::Config("stepgen: truncated module descriptor"))?
        as usize;
    if bring.config.stepgen.len() != count {
        return Err(Error::Config(
            "stepgen entries do not match the card's channel count",
        ));
    }

    let mut channels = Vec::with_capacity(count);
    for (index, channel_config) in bring.config.stepgen.iter().enumerate() {
        let base = channel_base(
            bring.board,
            "stepgen",
            index,
            channel_config.name.as_deref(),
        );

        let pins = ChannelPins {
            enable: bring.hal.pin_bit(&format!("{base}.enable"), PinDir::In)?,
            velocity_mode: bring
                .hal
                .pin_bit(&format!("{base}.velocity-mode"), PinDir::In)?,
            position_cmd: bring
                .hal
                .pin_float(&format!("{base}.position-cmd"), PinDir::In)?,
            velocity_cmd: bring
                .hal
                .pin_float(&format!("{base}.velocity-cmd"), PinDir::In)?,
            acceleration_cmd: bring
                .hal
                .pin_float(&format!("{base}.acceleration-cmd"), PinDir::In)?,
            counts: bring
                .hal
                .pin_u32(&format!("{base}.counts"), PinDir::Out)?,
            position_fb: bring
                .hal
                .pin_float(&format!("{base}.position-feedback"), PinDir::Out)?,
            position_prediction: bring.hal.pin_float(
                &format!("{base}.position-prediction"),
                PinDir::Out,
            )?,
            speed_fb: bring
                .hal
                .pin_float(&format!("{base}.velocity-feedback"), PinDir::Out)?,
            speed_prediction: bring.hal.pin_float(
                &format!("{base}.velocity-prediction"),
                PinDir::Out,
            )?,
        };
        let params = ChannelParams {
            frequency: bring
                .hal
                .param_float(&format!("{base}.frequency"), ParamDir::Ro)?,
            max_acceleration: bring.hal.param_float(
                &format!("{base}.max-acceleration"),
                ParamDir::Rw,
            )?,
            max_velocity: bring
                .hal
                .param_float(&format!("{base}.max-velocity"), ParamDir::Rw)?,
            position_scale: bring
                .hal
                .param_float(&format!("{base}.position-scale"), ParamDir::Rw)?,
            steplen: bring
                .hal
                .param_u32(&format!("{base}.steplen"), ParamDir::Rw)?,
            stepspace: bring
                .hal
                .param_u32(&format!("{base}.stepspace"), ParamDir::Rw)?,
            dir_hold_time: bring
                .hal
                .param_u32(&format!("{base}.dir-hold-time"), ParamDir::Rw)?,
            dir_setup_time: bring
                .hal
                .param_u32(&format!("{base}.dir-setup-time"), ParamDir::Rw)?,
        };
        params.position_scale.set(channel_config.position_scale);
        params.max_velocity.set(channel_config.max_velocity);
        params.max_acceleration.set(channel_config.max_acceleration);
        params.steplen.set(channel_config.steplen);
        params.stepspace.set(channel_config.stepspace);
        params.dir_hold_time.set(channel_config.dir_hold_time);
        params.dir_setup_time.set(channel_config.dir_setup_time);

        channels.push(StepChannel {
            base,
            pins,
            params,
            scales: Scales::default(),
            memo_steplen: channel_config.steplen,
            memo_stepspace: channel_config.stepspace,
            memo_dir_hold: channel_config.dir_hold_time,
            memo_dir_setup: channel_config.dir_setup_time,
            steplen_cycles: 0,
            stepspace_cycles: 0,
            memo_position_cmd: 0.0,
            memo_acceleration: 0.0,
            acceleration_recip: 0.0,
            max_velocity_warned: false,
            flt_speed: 0.0,
            flt_time: 0.0,
            fpga_time: 0,
        });
    }

    Ok(ModuleInstance::Stepgen(Stepgen {
        board: bring.board.to_string(),
        channels,
        period_s: bring
            .hal
            .pin_float(&format!("{}.stepgen.period-s", bring.board), PinDir::Out)?,
        period_s_recip: bring.hal.pin_float(
            &format!("{}.stepgen.period-s-recip", bring.board),
            PinDir::Out,
        )?,
        apply_time: 0,
        prev_wallclock: 0,
        cycles_per_period: 0.0,
        ring: [0.0; PERIOD_RING],
        ring_sum: 0.0,
        ring_pos: 0,
        window_warned: false,
        pick_off_pos: 32,
        pick_off_vel: 32,
        pick_off_acc: 40,
        max_frequency: 0.0,
    }))
}

impl StepChannel {
    /// Re-derives the fixed-point conversion factors when the scale
    /// parameter moved. A scale too close to zero would blow up the
    /// reciprocal, so it is coerced to unity first.
    fn refresh_scales(
        &mut self,
        clock_recip: f64,
        pick_off_pos: u32,
        pick_off_vel: u32,
        pick_off_acc: u32,
    ) {
        let mut scale = self.params.position_scale.get();
        if scale == self.scales.memo_position_scale {
            return;
        }
        if scale.abs() < 1e-20 {
            log::warn!(
                "{}: position-scale of {} is unusable, using 1.0",
                self.base,
                scale,
            );
            scale = 1.0;
            self.params.position_scale.set(scale);
        }
        let s = &mut self.scales;
        s.memo_position_scale = scale;
        s.scale_recip = 1.0 / scale;
        s.fpga_pos_scale_inv = s.scale_recip / (1u64 << pick_off_pos) as f64;
        s.fpga_speed_scale =
            scale * clock_recip * (1u64 << pick_off_vel) as f64;
        s.fpga_speed_scale_inv = 1.0 / s.fpga_speed_scale;
        s.fpga_acc_scale = scale * clock_recip * clock_recip
            * (1u64 << pick_off_acc) as f64;
    }

    /// Rolls back any post-configure edit of the step timings. The card's
    /// timing word is written exactly once; a changed parameter would
    /// silently stop describing the hardware.
    fn reject_timing_changes(&mut self) -> Result<(), Error> {
        let fields = [
            (&self.params.steplen, self.memo_steplen, "steplen"),
            (&self.params.stepspace, self.memo_stepspace, "stepspace"),
            (
                &self.params.dir_hold_time,
                self.memo_dir_hold,
                "dir-hold-time",
            ),
            (
                &self.params.dir_setup_time,
                self.memo_dir_setup,
                "dir-setup-time",
            ),
        ];
        let mut rejected = None;
        for (pin, memo, name) in fields {
            if pin.get() != memo {
                pin.set(memo);
                rejected = Some(name);
            }
        }
        match rejected {
            Some(name) => Err(Error::ParamImmutable(name)),
            None => Ok(()),
        }
    }

    /// The position-mode planner: projects the mover forward from the
    /// predicted state at the next apply time and picks the velocity that
    /// converges on the commanded position without exceeding the
    /// acceleration bound.
    fn plan_position(&mut self, period_s: f64, period_s_recip: f64) -> f64 {
        let position_cmd = self.pins.position_cmd.get();
        let speed_prediction = self.pins.speed_prediction.get();
        let max_acceleration = self.params.max_acceleration.get();

        let mut vel_cmd =
            (position_cmd - self.memo_position_cmd) * period_s_recip;
        self.memo_position_cmd = position_cmd;

        // How long matching the naive velocity would take, and where the
        // mover and the command each end up at that point.
        let match_time =
            ((vel_cmd - speed_prediction) / max_acceleration).abs();
        let avg_v = 0.5 * (vel_cmd + speed_prediction);
        let est_out =
            self.pins.position_prediction.get() + avg_v * match_time;
        let est_cmd =
            position_cmd + vel_cmd * (match_time - 1.5 * period_s);
        let est_err = est_out - est_cmd;

        if match_time < period_s {
            if est_err.abs() > 1e-6 {
                vel_cmd -= 0.5 * est_err * period_s_recip;
            }
        } else {
            // Flat out: pick the ramp direction that shrinks the error.
            let mut sign =
                if vel_cmd > speed_prediction { 1.0 } else { -1.0 };
            let dv = -2.0 * sign * max_acceleration * period_s;
            let dp = dv * match_time;
            if (est_err + 2.0 * dp).abs() < est_err.abs() {
                sign = -sign;
            }
            vel_cmd = speed_prediction + sign * max_acceleration * period_s;
        }
        vel_cmd
    }
}

impl Stepgen {
    fn refresh_all_scales(&mut self, cycle: &CycleState) {
        for channel in &mut self.channels {
            channel.refresh_scales(
                cycle.clock_frequency_recip,
                self.pick_off_pos,
                self.pick_off_vel,
                self.pick_off_acc,
            );
        }
    }

    /// Picks the apply time the *next* write will ship: nominally one
    /// period after the previous one, nudged by how long the last loop
    /// actually took, and clipped into the 81%..99% window ahead of the
    /// card's clock.
    fn schedule(&mut self, now: u64, clock: f64, clock_recip: f64) -> u64 {
        let cpp = self.cycles_per_period;

        if self.apply_time == 0 {
            // First packet: seed the schedule a tenth of a period in the
            // past so the first command window is already open.
            self.prev_wallclock =
                (now as f64 - cpp).max(0.0) as u64;
            self.apply_time =
                (self.prev_wallclock as f64 + 0.9 * cpp) as u64;
        }

        // Half a tick keeps truncation from drifting the schedule.
        let mut next_apply =
            self.apply_time as f64 + self.period_s.get() * clock + 0.5;
        let mut loop_cycles =
            now.saturating_sub(self.prev_wallclock) as f64;

        // A single excursion shifts the schedule rather than the period
        // estimate: clamp the observation to ±10% and fold the excess
        // into the apply time.
        if loop_cycles < 0.9 * cpp {
            next_apply += loop_cycles - 0.9 * cpp;
            loop_cycles = 0.9 * cpp;
        } else if loop_cycles > 1.1 * cpp {
            next_apply += loop_cycles - 1.1 * cpp;
            loop_cycles = 1.1 * cpp;
        }

        let low = now as f64 + 0.81 * cpp;
        let high = now as f64 + 0.99 * cpp;
        if next_apply < low {
            // Running late: the scheduled point is about to be overtaken
            // by the card's clock, so push it out to 95% of a period.
            next_apply = now as f64 + 0.95 * cpp;
            self.warn_window(now, next_apply);
        } else if next_apply > high {
            // Running early: pull the point in to 85% to keep command
            // latency bounded.
            next_apply = now as f64 + 0.85 * cpp;
            self.warn_window(now, next_apply);
        } else {
            self.window_warned = false;
        }

        // Feed the observed loop into the period average the planner and
        // the next schedule step both use.
        let observed = loop_cycles * clock_recip;
        self.ring_sum += observed - self.ring[self.ring_pos];
        self.ring[self.ring_pos] = observed;
        self.ring_pos = (self.ring_pos + 1) % PERIOD_RING;
        let averaged = self.ring_sum / PERIOD_RING as f64;
        self.period_s.set(averaged);
        self.period_s_recip.set(1.0 / averaged);

        self.prev_wallclock = now;
        next_apply as u64
    }

    fn warn_window(&mut self, now: u64, next_apply: f64) {
        log::debug!(
            "{}: apply time rescheduled: wallclock {}, apply {}, next {}",
            self.board,
            now,
            self.apply_time,
            next_apply,
        );
        if !self.window_warned {
            log::warn!(
                "{}: apply time left its window; the control loop is \
                 jittering more than the card can absorb",
                self.board,
            );
            self.window_warned = true;
        }
    }
}

impl Module for Stepgen {
    fn config_len(&self) -> usize {
        if self.channels.is_empty() {
            0
        } else {
            CONFIG_LEN
        }
    }

    fn write_len(&self) -> usize {
        if self.channels.is_empty() {
            0
        } else {
            GENERAL_WRITE_LEN + CHANNEL_WRITE_LEN * self.channels.len()
        }
    }

    fn read_len(&self) -> usize {
        CHANNEL_READ_LEN * self.channels.len()
    }

    fn configure(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        if self.channels.is_empty() {
            return Ok(());
        }
        let clock = f64::from(cycle.clock_frequency);
        let period_s = 1e-9 * cycle.period_ns as f64;
        self.period_s.set(period_s);
        self.period_s_recip.set(1.0 / period_s);
        self.cycles_per_period = period_s * clock;
        self.ring = [period_s; PERIOD_RING];
        self.ring_sum = period_s * PERIOD_RING as f64;
        self.ring_pos = 0;

        // Velocity pick-off: enough fractional bits that the top of the
        // velocity register sits at or below the driver's rated pulse
        // frequency.
        let mut shift = 0u32;
        while clock / (1u64 << (shift + 1)) as f64 > MAX_DRIVER_FREQ {
            shift += 1;
        }
        self.pick_off_pos = 32;
        self.pick_off_vel = 32 + shift;
        self.pick_off_acc = self.pick_off_vel + 8;
        self.max_frequency = clock / (1u64 << (shift + 1)) as f64;

        // The timing word is board-wide; the slowest channel governs.
        // Integer math: ceil(ns * f_clk / 1e9) computed in floats lands a
        // hair above whole cycle counts and rounds a cycle long.
        let to_cycles = |ns: u32| {
            (u64::from(ns) * u64::from(cycle.clock_frequency))
                .div_ceil(1_000_000_000)
                .min(u64::from(u32::MAX)) as u32
        };
        let mut steplen = 0u32;
        let mut stepspace = 0u32;
        let mut dir_hold = 0u32;
        let mut dir_setup = 0u32;
        for channel in &mut self.channels {
            channel.memo_steplen = channel.params.steplen.get();
            channel.memo_stepspace = channel.params.stepspace.get();
            channel.memo_dir_hold = channel.params.dir_hold_time.get();
            channel.memo_dir_setup = channel.params.dir_setup_time.get();
            channel.steplen_cycles = to_cycles(channel.memo_steplen);
            channel.stepspace_cycles = to_cycles(channel.memo_stepspace);
            steplen = steplen.max(channel.steplen_cycles);
            stepspace = stepspace.max(channel.stepspace_cycles);
            dir_hold = dir_hold.max(to_cycles(channel.memo_dir_hold));
            dir_setup = dir_setup.max(to_cycles(channel.memo_dir_setup));
        }
        if steplen + stepspace > 0 {
            self.max_frequency = self
                .max_frequency
                .min(clock / f64::from(steplen + stepspace));
        }
        for channel in &self.channels {
            channel.params.frequency.set(self.max_frequency);
        }

        let clip = |value: &mut u32, max: u32, name: &str| {
            if *value > max {
                log::error!(
                    "{}: stepgen `{}` of {} cycles does not fit its \
                     timing field and is clipped to {}; consider a lower \
                     clock frequency",
                    self.board,
                    name,
                    *value,
                    max,
                );
                *value = max;
            }
        };
        clip(&mut steplen, MAX_STEPLEN_CYCLES, "steplen");
        clip(&mut dir_hold, MAX_DIR_HOLD_CYCLES, "dir-hold-time");
        clip(&mut dir_setup, MAX_DIR_SETUP_CYCLES, "dir-setup-time");

        w.write_u32((steplen << 22) | (dir_hold << 12) | dir_setup)
    }

    fn prepare_write(
        &mut self,
        w: &mut WriteCursor<'_>,
        cycle: &CycleState,
    ) -> Result<(), Error> {
        if self.channels.is_empty() {
            return Ok(());
        }
        self.refresh_all_scales(cycle);
        w.write_u64(self.apply_time)?;

        let period_s = self.period_s.get();
        let period_s_recip = self.period_s_recip.get();
        let clock = f64::from(cycle.clock_frequency);
        let max_frequency = self.max_frequency;

        for channel in &mut self.channels {
            channel.reject_timing_changes()?;

            // The velocity limit cannot outrun the step generator.
            let mut max_velocity = channel.params.max_velocity.get();
            let reachable = max_frequency
                * channel.scales.memo_position_scale.abs();
            if max_velocity <= 0.0 {
                max_velocity = 0.0;
                channel.params.max_velocity.set(0.0);
            } else if max_velocity > reachable {
                if !channel.max_velocity_warned {
                    log::error!(
                        "{}: requested max-velocity of {:.2} units/s is \
                         beyond the {:.2} units/s the step generator can \
                         produce; clipping",
                        channel.base,
                        max_velocity,
                        reachable,
                    );
                    channel.max_velocity_warned = true;
                }
                max_velocity = reachable;
                channel.params.max_velocity.set(max_velocity);
            }

            let mut vel_cmd = if channel.pins.velocity_mode.get() {
                channel.pins.velocity_cmd.get()
            } else {
                channel.plan_position(period_s, period_s_recip)
            };
            if !channel.pins.enable.get() {
                // A disabled channel ramps to a stop instead of coasting.
                vel_cmd = 0.0;
            }
            vel_cmd = vel_cmd.clamp(-max_velocity, max_velocity);

            let mut acceleration = channel.pins.acceleration_cmd.get();
            if acceleration < 0.0 {
                acceleration = -acceleration;
            }
            let max_acceleration = channel.params.max_acceleration.get();
            if acceleration > max_acceleration {
                acceleration = max_acceleration;
            }
            channel.pins.acceleration_cmd.set(acceleration);
            if acceleration != channel.memo_acceleration {
                channel.memo_acceleration = acceleration;
                channel.acceleration_recip = if acceleration > 0.0 {
                    1.0 / acceleration
                } else {
                    0.0
                };
            }

            channel.flt_speed = vel_cmd;
            channel.flt_time = if acceleration > 0.0 {
                ((vel_cmd - channel.pins.speed_prediction.get())
                    * channel.acceleration_recip)
                    .abs()
            } else {
                0.0
            };
            channel.fpga_time = (channel.flt_time * clock) as u64;

            let fpga_speed = (vel_cmd * channel.scales.fpga_speed_scale)
                as i64
                + VELOCITY_BIAS;
            let fpga_acc =
                (acceleration * channel.scales.fpga_acc_scale) as u32;
            w.write_u32(fpga_speed as u32)?;
            w.write_u32(fpga_acc)?;
        }
        Ok(())
    }

    fn process_read(
        &mut self,
        r: &mut ReadCursor<'_>,
        cycle: &mut CycleState,
    ) -> Result<(), Error> {
        if self.channels.is_empty() {
            return Ok(());
        }
        self.refresh_all_scales(cycle);
        let now = cycle.wallclock_ticks;
        let clock = f64::from(cycle.clock_frequency);
        let clock_recip = cycle.clock_frequency_recip;
        let next_apply = self.schedule(now, clock, clock_recip);
        // `schedule` seeds the in-flight apply time on the first packet.
        let apply_time = self.apply_time;

        for channel in &mut self.channels {
            let position = r.read_u64()? as i64;
            let speed = i64::from(r.read_u32()?) - VELOCITY_BIAS;

            channel
                .pins
                .counts
                .set((position >> self.pick_off_pos) as u32);
            let position_fb =
                position as f64 * channel.scales.fpga_pos_scale_inv;
            let speed_fb =
                speed as f64 * channel.scales.fpga_speed_scale_inv;
            channel.pins.position_fb.set(position_fb);
            channel.pins.speed_fb.set(speed_fb);

            // Predict the state at the next apply time: whatever is left
            // of the acceleration phase of the in-flight command, then
            // constant velocity. Positions integrate trapezoidally.
            let mut speed_pred = speed_fb;
            let mut position_pred = position_fb;
            let accel_end = apply_time.saturating_add(channel.fpga_time);
            if now <= accel_end {
                let from = now.max(apply_time);
                let until = next_apply.min(accel_end);
                let span = until.saturating_sub(from);
                let left = accel_end - from;
                let fraction = if left == 0 {
                    1.0
                } else {
                    span as f64 / left as f64
                };
                let speed_end = (1.0 - fraction) * speed_pred
                    + fraction * channel.flt_speed;
                position_pred += 0.5
                    * (speed_pred + speed_end)
                    * span as f64
                    * clock_recip;
                speed_pred = speed_end;
            }
            if next_apply > accel_end {
                position_pred += channel.flt_speed
                    * (next_apply - accel_end) as f64
                    * clock_recip;
                speed_pred = channel.flt_speed;
            }
            channel.pins.speed_prediction.set(speed_pred);
            channel.pins.position_prediction.set(position_pred);
        }

        self.apply_time = next_apply;
        Ok(())
    }
}
