// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The board: bring-up, the cyclic pipeline, and the reset handshake.
//!
//! [`Board::register`] performs the whole bring-up sequence against the
//! transport: read and validate the identification header, walk the module
//! descriptors through the factory registry, lay the register regions out
//! back to back, size the packet buffers, and reset the card. Afterwards
//! the real-time thread drives [`Board::read`] and [`Board::write`] once
//! per cycle, in that order.
//!
//! The first `read` only marks that the loop is running; the first `write`
//! sends the configuration region instead of a command packet, because the
//! configure payloads need the cycle period, which is only trustworthy
//! once the loop has turned over. Every cycle after that is steady state.

use std::thread;
use std::time::Duration;

use crate::config::BoardConfig;
use crate::cursor::{ReadCursor, WriteCursor};
use crate::hal::{HalRegistry, Pin, PinDir};
use crate::header::{CardHeader, INIT_LEN};
use crate::modules::{
    self, BringUp, CycleState, Module, ModuleId, ModuleInstance, Wallclock,
    Watchdog,
};
use crate::transport::{RegionMap, Transport, TransportError};
use crate::{Error, MAX_RESET_RETRIES};

/// A module plus its packet windows, sized once at bring-up.
#[derive(Debug)]
struct ModuleEntry {
    instance: ModuleInstance,
    config_len: usize,
    write_len: usize,
    read_len: usize,
}

impl ModuleEntry {
    fn new(instance: ModuleInstance) -> Self {
        Self {
            config_len: instance.config_len(),
            write_len: instance.write_len(),
            read_len: instance.read_len(),
            instance,
        }
    }
}

#[derive(Debug)]
pub struct Board<T: Transport> {
    transport: T,
    name: String,
    version: (u8, u8, u8),
    regions: RegionMap,
    header_len: usize,
    write_buffer: Vec<u8>,
    read_buffer: Vec<u8>,
    config_buffer: Vec<u8>,
    modules: Vec<ModuleEntry>,
    cycle: CycleState,
    read_has_run: bool,
    configured: bool,
    io_error: Pin<bool>,
    io_error_active: bool,
}

impl<T: Transport> Board<T> {
    /// Brings a card up. On any failure the transport is dropped and every
    /// pin created along the way is released, so the registry is left
    /// exactly as it was found.
    pub fn register(
        transport: T,
        config: &BoardConfig,
        hal: &mut dyn HalRegistry,
    ) -> Result<Self, Error> {
        config.validate()?;
        Self::bring_up(transport, config, &mut *hal).inspect_err(|e| {
            log::error!("{}: bring-up failed: {e}", config.board_name);
            hal.release(&format!("{}.", config.board_name));
        })
    }

    fn bring_up(
        mut transport: T,
        config: &BoardConfig,
        hal: &mut dyn HalRegistry,
    ) -> Result<Self, Error> {
        let mut header_buf = [0u8; INIT_LEN];
        transport.read_bytes(0, &mut header_buf)?;
        let header = CardHeader::parse(&header_buf)?;
        let name = header.board_name()?.to_string();
        if name != config.board_name {
            return Err(Error::Config("board_name does not match the card"));
        }
        let clock_frequency = header.clock_frequency.get();
        if clock_frequency != config.clock_frequency {
            return Err(Error::Config(
                "clock_frequency does not match the card",
            ));
        }
        let version = (
            header.version_major,
            header.version_minor,
            header.version_patch,
        );
        log::info!(
            "{name}: firmware {}.{}.{}, {} Hz clock, {} modules",
            version.0,
            version.1,
            version.2,
            clock_frequency,
            header.module_count,
        );

        let desc_size = usize::from(header.module_data_size.get());
        let mut desc_buf = vec![0u8; desc_size];
        transport.read_bytes(INIT_LEN as u32, &mut desc_buf)?;

        let io_error = hal.pin_bit(&format!("{name}.io_error"), PinDir::Io)?;

        // The watchdog and the wallclock exist on every card and lead the
        // packet layout; the rest comes from the descriptors, in the
        // card's order.
        let mut entries = vec![
            ModuleEntry::new(Watchdog::new(
                &name,
                config.watchdog.default_timeout_ns,
                hal,
            )?),
            ModuleEntry::new(Wallclock::new(&name, hal)?),
        ];
        {
            let mut bring = BringUp {
                board: &name,
                clock_frequency,
                config,
                hal,
            };
            let mut desc = ReadCursor::new("module descriptors", &desc_buf);
            for _ in 0..header.module_count {
                let id = ModuleId(desc.read_u32()?.to_be_bytes());
                let factory = modules::lookup(id)
                    .ok_or(Error::UnknownModule(id))?;
                let instance = factory(&mut bring, &mut desc)?;
                log::info!("{name}: set up {} module", instance.kind());
                entries.push(ModuleEntry::new(instance));
            }
            desc.finish()?;
        }

        let config_len: usize = entries.iter().map(|e| e.config_len).sum();
        let write_len: usize = entries.iter().map(|e| e.write_len).sum();
        let read_len: usize = entries.iter().map(|e| e.read_len).sum();
        let regions =
            RegionMap::resolve(desc_size, config_len, write_len, read_len);
        log::info!(
            "{name}: regions: reset {:#06x}, config {:#06x} ({} B), \
             write {:#06x} ({} B), read {:#06x} ({} B)",
            regions.reset,
            regions.config,
            config_len,
            regions.write,
            write_len,
            regions.read,
            read_len,
        );

        let header_len = transport.header_len();
        transport.prepare(&regions)?;

        let mut board = Self {
            transport,
            name,
            version,
            regions,
            header_len,
            write_buffer: vec![0; header_len + write_len],
            read_buffer: vec![0; header_len + read_len],
            config_buffer: vec![0; config_len],
            modules: entries,
            cycle: CycleState {
                clock_frequency,
                clock_frequency_recip: 1.0 / f64::from(clock_frequency),
                period_ns: 0,
                wallclock_ticks: 0,
            },
            read_has_run: false,
            configured: false,
            io_error,
            io_error_active: false,
        };
        board.reset()?;
        Ok(board)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn firmware_version(&self) -> (u8, u8, u8) {
        self.version
    }

    pub fn clock_frequency(&self) -> u32 {
        self.cycle.clock_frequency
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    /// The cyclic status exchange, exported as `<board>.read`.
    pub fn read(&mut self, period_ns: i64) {
        self.cycle.period_ns = period_ns;

        // The first pass only records that the loop is turning; the first
        // write wants one observed period before it configures the card.
        if !self.read_has_run {
            self.read_has_run = true;
            return;
        }

        let header_len = self.header_len;
        self.read_buffer[header_len..].fill(0);
        if let Err(e) = self.transport.read_packet(&mut self.read_buffer) {
            self.flag_io_error(e);
            return;
        }
        self.io_error_active = false;

        let payload = &self.read_buffer[header_len..];
        let mut offset = 0;
        for entry in &mut self.modules {
            let window = &payload[offset..offset + entry.read_len];
            let mut r = ReadCursor::new("read region", window);
            let result = entry
                .instance
                .process_read(&mut r, &mut self.cycle)
                .and_then(|()| r.finish());
            if let Err(e) = result {
                log::error!(
                    "{}: {} read halted the cycle: {e}",
                    self.name,
                    entry.instance.kind(),
                );
                return;
            }
            offset += entry.read_len;
        }
    }

    /// The cyclic command exchange, exported as `<board>.write`.
    pub fn write(&mut self, period_ns: i64) {
        self.cycle.period_ns = period_ns;

        if !self.configured {
            if !self.read_has_run {
                log::warn!(
                    "{}: write scheduled ahead of read; schedule read \
                     first so configuration sees a real period",
                    self.name,
                );
            }
            match self.send_configuration() {
                Ok(()) => self.configured = true,
                Err(e) => {
                    log::error!(
                        "{}: configuration failed, retrying next cycle: {e}",
                        self.name,
                    );
                    if let Error::Transport(t) = e {
                        self.flag_io_error(t);
                    }
                }
            }
            return;
        }

        let header_len = self.header_len;
        self.write_buffer[header_len..].fill(0);
        let payload = &mut self.write_buffer[header_len..];
        let mut offset = 0;
        for entry in &mut self.modules {
            let window = &mut payload[offset..offset + entry.write_len];
            let mut w = WriteCursor::new("write region", window);
            let result = entry
                .instance
                .prepare_write(&mut w, &self.cycle)
                .and_then(|()| w.finish());
            if let Err(e) = result {
                log::error!(
                    "{}: {} write halted the cycle, packet not sent: {e}",
                    self.name,
                    entry.instance.kind(),
                );
                return;
            }
            offset += entry.write_len;
        }

        if let Err(e) = self.transport.write_packet(&mut self.write_buffer) {
            self.flag_io_error(e);
            return;
        }
        self.io_error_active = false;
    }

    /// Builds and ships the config region. Runs once, during the first
    /// `write`, with the period the scheduler just observed.
    fn send_configuration(&mut self) -> Result<(), Error> {
        if self.config_buffer.is_empty() {
            return Ok(());
        }
        self.config_buffer.fill(0);
        let mut offset = 0;
        for entry in &mut self.modules {
            let window =
                &mut self.config_buffer[offset..offset + entry.config_len];
            let mut w = WriteCursor::new("config region", window);
            entry.instance.configure(&mut w, &self.cycle)?;
            w.finish()?;
            offset += entry.config_len;
        }
        self.transport
            .write_bytes(self.regions.config, &self.config_buffer)?;
        Ok(())
    }

    /// Two-phase reset handshake: raise the flag until the card reads it
    /// back, then lower it the same way. Bounded retries per phase.
    fn reset(&mut self) -> Result<(), Error> {
        for flag in [1u32, 0u32] {
            let wire = flag.to_be_bytes();
            let mut attempts = 0;
            loop {
                self.transport.write_bytes(self.regions.reset, &wire)?;
                thread::sleep(Duration::from_millis(1));
                let mut back = [0u8; 4];
                self.transport
                    .read_bytes(self.regions.reset, &mut back)?;
                if back == wire {
                    break;
                }
                attempts += 1;
                if attempts >= MAX_RESET_RETRIES {
                    return Err(Error::Reset);
                }
            }
        }
        Ok(())
    }

    /// Final reset so the card lands in its safe state, then transport
    /// teardown. Every transport call after this fails fast.
    pub fn shutdown(mut self) {
        if let Err(e) = self.reset() {
            log::error!(
                "{}: reset on shutdown failed; outputs may be live: {e}",
                self.name,
            );
        }
        self.transport.terminate();
    }

    fn flag_io_error(&mut self, e: TransportError) {
        // The pin is sticky until the operator clears it; the log is
        // emitted once per transition into the failed state.
        self.io_error.set(true);
        if !self.io_error_active {
            log::error!("{}: card i/o failed: {e}", self.name);
            self.io_error_active = true;
        }
    }
}
