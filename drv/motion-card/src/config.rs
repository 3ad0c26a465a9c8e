// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configure-time options.
//!
//! These structs mirror the configuration source the embedding loads (a
//! JSON document in practice; any serde format works). The card itself is
//! authoritative for which modules exist and how many channels they have;
//! the configuration supplies names, scales, and limits, and must agree
//! with the card on identity: `board_name` and `clock_frequency` are
//! checked against the header at bring-up.

use serde::Deserialize;

use crate::header::NAME_LEN;
use crate::Error;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BoardConfig {
    pub board_name: String,
    pub clock_frequency: u32,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub gpio_in: Vec<GpioPinConfig>,
    #[serde(default)]
    pub gpio_out: Vec<GpioPinConfig>,
    #[serde(default)]
    pub pwm: Vec<PwmChannelConfig>,
    #[serde(default)]
    pub stepgen: Vec<StepgenChannelConfig>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct WatchdogConfig {
    /// Timeout loaded into the watchdog at startup, overridable at runtime
    /// through the `timeout_ns` parameter.
    pub default_timeout_ns: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { default_timeout_ns: 5_000_000 }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GpioPinConfig {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PwmChannelConfig {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StepgenChannelConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Steps per user unit. Magnitudes below 1e-20 are coerced to 1.0 at
    /// runtime with a log message.
    pub position_scale: f64,
    /// Velocity limit in user units per second.
    pub max_velocity: f64,
    /// Acceleration limit in user units per second squared. Must be
    /// positive: the position-mode planner divides by it.
    pub max_acceleration: f64,
    /// Step pulse timings, all in nanoseconds. Frozen once the card is
    /// configured.
    pub steplen: u32,
    pub stepspace: u32,
    pub dir_hold_time: u32,
    pub dir_setup_time: u32,
}

impl BoardConfig {
    /// Checks the constraints that do not need the card: name shape,
    /// positive clock, stepgen limits.
    pub fn validate(&self) -> Result<(), Error> {
        if self.board_name.is_empty()
            || self.board_name.len() >= NAME_LEN
            || !self
                .board_name
                .bytes()
                .all(|b| b.is_ascii_graphic() || b == b' ')
        {
            return Err(Error::Config(
                "board_name must be 1..16 printable bytes",
            ));
        }
        if self.clock_frequency == 0 {
            return Err(Error::Config("clock_frequency must be positive"));
        }
        if self.watchdog.default_timeout_ns == 0 {
            return Err(Error::Config(
                "watchdog.default_timeout_ns must be positive",
            ));
        }
        for sg in &self.stepgen {
            if sg.max_velocity < 0.0 {
                return Err(Error::Config("max_velocity must be >= 0"));
            }
            if !(sg.max_acceleration > 0.0) {
                return Err(Error::Config("max_acceleration must be > 0"));
            }
        }
        Ok(())
    }
}
