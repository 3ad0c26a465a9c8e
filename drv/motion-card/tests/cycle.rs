// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Full read/configure/write cycles against the simulated card.

mod common;

use common::{SimCard, SimModule};
use motion_card::config::{
    BoardConfig, GpioPinConfig, PwmChannelConfig, StepgenChannelConfig,
};
use motion_card::hal::MemRegistry;
use motion_card::Board;

const CLOCK: u32 = 100_000_000;
const PERIOD_NS: i64 = 1_000_000;
/// One period in card clock ticks.
const CPP: u64 = 100_000;

/// Offset of the first non-default module's data in the status packet:
/// watchdog flag then wallclock.
const STATUS_MODULES_AT: usize = 12;

fn base_config() -> BoardConfig {
    BoardConfig {
        board_name: "test_card".into(),
        clock_frequency: CLOCK,
        ..Default::default()
    }
}

/// Registers the board and runs the first read (loop marker) and first
/// write (configuration pass).
fn boot(
    card: &SimCard,
    config: &BoardConfig,
    hal: &mut MemRegistry,
) -> Board<SimCard> {
    let mut board = Board::register(card.clone(), config, hal).unwrap();
    board.read(PERIOD_NS);
    board.write(PERIOD_NS);
    board
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(bytes[at..at + 8].try_into().unwrap())
}

#[test]
fn stepgen_zero_command_emits_a_null_velocity_frame() {
    let card =
        SimCard::new("test_card", CLOCK, &[SimModule::Stepgen {
            channels: 1,
        }]);
    let mut config = base_config();
    config.stepgen.push(StepgenChannelConfig {
        name: Some("x".into()),
        position_scale: 200.0,
        max_velocity: 1000.0,
        max_acceleration: 100.0,
        steplen: 5_000,
        stepspace: 5_000,
        dir_hold_time: 10_000,
        dir_setup_time: 10_000,
    });
    let mut hal = MemRegistry::new();
    let mut board = boot(&card, &config, &mut hal);

    // The configuration pass shipped the packed timing word: 500 cycles
    // of steplen, 1000 of dir-hold, 1000 of dir-setup.
    assert_eq!(
        card.config_region(),
        ((500u32 << 22) | (1000 << 12) | 1000).to_be_bytes()
    );

    hal.bit("test_card.stepgen.x.enable").set(true);
    let now = 100 * CPP;
    card.set_wallclock(now);
    let mut status = Vec::new();
    status.extend_from_slice(&0u64.to_be_bytes()); // position
    status.extend_from_slice(&0x8000_0000u32.to_be_bytes()); // velocity
    card.poke_status(STATUS_MODULES_AT, &status);

    board.read(PERIOD_NS);
    board.write(PERIOD_NS);

    let command = card.command_region();
    assert_eq!(command.len(), 4 + 8 + 8);
    // Watchdog word: enable bit plus the 5 ms default timeout.
    assert_eq!(u32_at(&command, 0), 0x8000_0000 | 499_999);
    // Apply time: scheduled inside the 81%..99% window.
    let apply = u64_at(&command, 4);
    assert!(apply >= now + 81 * CPP / 100, "apply {apply}");
    assert!(apply <= now + 99 * CPP / 100, "apply {apply}");
    // Null command: biased zero velocity, zero acceleration.
    assert_eq!(u32_at(&command, 12), 0x8000_0000);
    assert_eq!(u32_at(&command, 16), 0);
}

#[test]
fn pwm_mode_emits_the_rounded_period_and_width() {
    let card = SimCard::new("test_card", CLOCK, &[SimModule::Pwm {
        channels: 1,
    }]);
    let mut config = base_config();
    config.pwm.push(PwmChannelConfig { name: Some("laser".into()) });
    let mut hal = MemRegistry::new();
    let mut board = boot(&card, &config, &mut hal);

    hal.bit("test_card.pwm.laser.enable").set(true);
    hal.float("test_card.pwm.laser.value").set(0.25);
    hal.float("test_card.pwm.laser.pwm_freq").set(10_000.0);

    board.read(PERIOD_NS);
    board.write(PERIOD_NS);

    let command = card.command_region();
    assert_eq!(command.len(), 4 + 4 + 8);
    assert_eq!(u32_at(&command, 4), 0x8000_0000); // enable bitmap
    assert_eq!(u32_at(&command, 8), 10_000); // period
    assert_eq!(u32_at(&command, 12), 2_500); // width
    let curr_dc = hal.float("test_card.pwm.laser.curr_dc").get();
    assert!((curr_dc - 0.25).abs() < 1e-12, "{curr_dc}");
}

#[test]
fn watchdog_timeout_clips_and_reports_the_effective_value() {
    let card = SimCard::new("test_card", CLOCK, &[]);
    let mut hal = MemRegistry::new();
    let mut board = boot(&card, &base_config(), &mut hal);

    hal.float("test_card.watchdog.timeout_ns").set(30_000_000_000.0);
    board.read(PERIOD_NS);
    board.write(PERIOD_NS);

    let command = card.command_region();
    assert_eq!(u32_at(&command, 0), 0xffff_ffff);
    assert_eq!(
        hal.u32("test_card.watchdog.timeout_cycles").get(),
        0x7fff_ffff
    );
    assert_eq!(
        hal.float("test_card.watchdog.timeout_ns").get(),
        21_474_836_480.0
    );
}

#[test]
fn watchdog_bite_is_latched_from_the_status_packet() {
    let card = SimCard::new("test_card", CLOCK, &[]);
    let mut hal = MemRegistry::new();
    let mut board = boot(&card, &base_config(), &mut hal);

    card.set_watchdog_flag(1);
    board.read(PERIOD_NS);
    assert!(hal.bit("test_card.watchdog.has_bitten").get());

    card.set_watchdog_flag(0);
    board.read(PERIOD_NS);
    assert!(hal.bit("test_card.watchdog.has_bitten").get(), "sticky");
}

#[test]
fn gpio_inputs_decode_msb_first() {
    let card = SimCard::new("test_card", CLOCK, &[SimModule::Gpio {
        out: 0,
        inputs: 5,
    }]);
    let mut config = base_config();
    config.gpio_in = vec![GpioPinConfig::default(); 5];
    let mut hal = MemRegistry::new();
    let mut board = boot(&card, &config, &mut hal);

    card.poke_status(STATUS_MODULES_AT, &[0b1011_0000, 0, 0, 0]);
    board.read(PERIOD_NS);

    for (pin, expected) in
        [true, false, true, true, false].into_iter().enumerate()
    {
        assert_eq!(
            hal.bit(&format!("test_card.gpio.{pin:02}.in")).get(),
            expected,
            "pin {pin}"
        );
        assert_eq!(
            hal.bit(&format!("test_card.gpio.{pin:02}.in-not")).get(),
            !expected,
            "pin {pin}"
        );
    }
}

#[test]
fn latency_excursion_clamps_the_apply_time() {
    let card =
        SimCard::new("test_card", CLOCK, &[SimModule::Stepgen {
            channels: 1,
        }]);
    let mut config = base_config();
    config.stepgen.push(StepgenChannelConfig {
        name: None,
        position_scale: 200.0,
        max_velocity: 1000.0,
        max_acceleration: 100.0,
        steplen: 5_000,
        stepspace: 5_000,
        dir_hold_time: 10_000,
        dir_setup_time: 10_000,
    });
    let mut hal = MemRegistry::new();
    let mut board = boot(&card, &config, &mut hal);

    let mut status = Vec::new();
    status.extend_from_slice(&0u64.to_be_bytes());
    status.extend_from_slice(&0x8000_0000u32.to_be_bytes());
    card.poke_status(STATUS_MODULES_AT, &status);

    // A few steady cycles, then the wallclock jumps two periods.
    let mut now = 500 * CPP;
    for _ in 0..4 {
        card.set_wallclock(now);
        board.read(PERIOD_NS);
        board.write(PERIOD_NS);
        now += CPP;
    }
    now += CPP; // the extra period: this loop took 2x nominal
    card.set_wallclock(now);
    board.read(PERIOD_NS);
    board.write(PERIOD_NS);

    let apply = u64_at(&card.command_region(), 4);
    assert_eq!(apply, now + 95 * CPP / 100);
}

#[test]
fn transport_failure_sets_io_error_and_recovery_resumes() {
    let card = SimCard::new("test_card", CLOCK, &[]);
    let mut hal = MemRegistry::new();
    let mut board = boot(&card, &base_config(), &mut hal);
    let io_error = hal.bit("test_card.io_error");

    board.read(PERIOD_NS);
    board.write(PERIOD_NS);
    assert!(!io_error.get());
    let (reads_before, writes_before) = card.packet_counts();

    card.set_fail_io(true);
    board.read(PERIOD_NS);
    board.write(PERIOD_NS);
    assert!(io_error.get());
    assert_eq!(card.packet_counts(), (reads_before, writes_before));

    // Recovery: traffic resumes; the pin stays latched for the operator.
    card.set_fail_io(false);
    board.read(PERIOD_NS);
    board.write(PERIOD_NS);
    assert_eq!(
        card.packet_counts(),
        (reads_before + 1, writes_before + 1)
    );
    assert!(io_error.get(), "latched until the operator clears it");
}

#[test]
fn write_before_read_still_configures() {
    let card = SimCard::new("test_card", CLOCK, &[]);
    let mut hal = MemRegistry::new();
    let mut board =
        Board::register(card.clone(), &base_config(), &mut hal).unwrap();

    // Wrong order: write first. The driver warns but proceeds, so the
    // second write ships a real packet.
    board.write(PERIOD_NS);
    board.read(PERIOD_NS);
    board.read(PERIOD_NS);
    board.write(PERIOD_NS);
    assert_eq!(card.packet_counts().1, 1);
}
