// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated motion card behind the [`Transport`] trait.
//!
//! The simulator keeps the card's whole register bank as flat memory and
//! frames every cyclic exchange through the real etherbone codec, request
//! and reply both, so the tests cover the wire path a deployed Ethernet
//! transport would use. Tests hold a clone of the (cheaply shareable)
//! transport to poke status bytes and inspect what the driver wrote.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use motion_card::header::{INIT_LEN, MAGIC, NAME_LEN};
use motion_card::modules::{GPIO, PWM, STEPGEN};
use motion_card::{RegionMap, Transport, TransportError};

/// Register bank size: generously past any region the tests lay out.
const MEM_SIZE: usize = 4096;

pub enum SimModule {
    /// `out` outputs on the low physical pins, `inputs` inputs above them.
    Gpio { out: u8, inputs: u8 },
    Pwm { channels: u32 },
    Stepgen { channels: u32 },
}

#[derive(Debug)]
struct SimState {
    mem: Vec<u8>,
    regions: Option<RegionMap>,
    /// When false the reset register reads back zero no matter what was
    /// written, so the raise phase of the handshake never converges.
    ack_reset: bool,
    fail_io: bool,
    terminated: bool,
    packet_reads: usize,
    packet_writes: usize,
}

#[derive(Clone, Debug)]
pub struct SimCard(Rc<RefCell<SimState>>);

impl SimCard {
    pub fn new(name: &str, clock_frequency: u32, modules: &[SimModule]) -> Self {
        Self::with_version(name, clock_frequency, (1, 1, 0), modules)
    }

    pub fn with_version(
        name: &str,
        clock_frequency: u32,
        version: (u8, u8, u8),
        modules: &[SimModule],
    ) -> Self {
        let mut descriptors = Vec::new();
        for module in modules {
            match module {
                SimModule::Gpio { out, inputs } => {
                    descriptors.extend_from_slice(&GPIO.0);
                    let total = usize::from(*out) + usize::from(*inputs);
                    let len = (2 + total.div_ceil(8) + 3) & !3;
                    let mut block = vec![0u8; len];
                    block[0] = *out;
                    block[1] = *inputs;
                    for pin in 0..usize::from(*out) {
                        block[2 + pin / 8] |= 0x80 >> (pin % 8);
                    }
                    descriptors.extend_from_slice(&block);
                }
                SimModule::Pwm { channels } => {
                    descriptors.extend_from_slice(&PWM.0);
                    descriptors.extend_from_slice(&channels.to_be_bytes());
                }
                SimModule::Stepgen { channels } => {
                    descriptors.extend_from_slice(&STEPGEN.0);
                    descriptors.extend_from_slice(&channels.to_be_bytes());
                }
            }
        }

        let mut mem = vec![0u8; MEM_SIZE];
        mem[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        mem[5] = version.0;
        mem[6] = version.1;
        mem[7] = version.2;
        mem[8..12].copy_from_slice(&clock_frequency.to_be_bytes());
        mem[13] = modules.len() as u8;
        mem[14..16]
            .copy_from_slice(&(descriptors.len() as u16).to_be_bytes());
        assert!(name.len() < NAME_LEN);
        mem[16..16 + name.len()].copy_from_slice(name.as_bytes());
        mem[INIT_LEN..INIT_LEN + descriptors.len()]
            .copy_from_slice(&descriptors);

        Self(Rc::new(RefCell::new(SimState {
            mem,
            regions: None,
            ack_reset: true,
            fail_io: false,
            terminated: false,
            packet_reads: 0,
            packet_writes: 0,
        })))
    }

    /// A card whose header is all zeros: not a motion card at all.
    pub fn blank() -> Self {
        Self(Rc::new(RefCell::new(SimState {
            mem: vec![0u8; MEM_SIZE],
            regions: None,
            ack_reset: true,
            fail_io: false,
            terminated: false,
            packet_reads: 0,
            packet_writes: 0,
        })))
    }

    /// Overwrites the module-id bytes of the first descriptor.
    pub fn corrupt_first_module_id(&self, id: [u8; 4]) {
        self.0.borrow_mut().mem[INIT_LEN..INIT_LEN + 4]
            .copy_from_slice(&id);
    }

    pub fn set_ack_reset(&self, ack: bool) {
        self.0.borrow_mut().ack_reset = ack;
    }

    pub fn set_fail_io(&self, fail: bool) {
        self.0.borrow_mut().fail_io = fail;
    }

    pub fn terminated(&self) -> bool {
        self.0.borrow().terminated
    }

    pub fn packet_counts(&self) -> (usize, usize) {
        let s = self.0.borrow();
        (s.packet_reads, s.packet_writes)
    }

    pub fn regions(&self) -> RegionMap {
        self.0.borrow().regions.expect("bring-up has not run")
    }

    /// Writes `bytes` at `offset` into the status (read) region.
    pub fn poke_status(&self, offset: usize, bytes: &[u8]) {
        let base = self.regions().read as usize;
        self.0.borrow_mut().mem[base + offset..base + offset + bytes.len()]
            .copy_from_slice(bytes);
    }

    /// The wallclock field sits after the 4-byte watchdog flag.
    pub fn set_wallclock(&self, ticks: u64) {
        self.poke_status(4, &ticks.to_be_bytes());
    }

    pub fn set_watchdog_flag(&self, flag: u32) {
        self.poke_status(0, &flag.to_be_bytes());
    }

    /// Reads back what the driver last shipped to the command region.
    pub fn command_region(&self) -> Vec<u8> {
        let regions = self.regions();
        let base = regions.write as usize;
        self.0.borrow().mem[base..base + regions.write_len].to_vec()
    }

    pub fn config_region(&self) -> Vec<u8> {
        let regions = self.regions();
        let base = regions.config as usize;
        let len = (regions.write - regions.config) as usize;
        self.0.borrow().mem[base..base + len].to_vec()
    }
}

impl Transport for SimCard {
    fn header_len(&self) -> usize {
        etherbone::HEADER_LEN
    }

    fn prepare(&mut self, regions: &RegionMap) -> Result<(), TransportError> {
        self.0.borrow_mut().regions = Some(*regions);
        Ok(())
    }

    fn read_bytes(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), TransportError> {
        let state = self.0.borrow();
        if state.terminated {
            return Err(TransportError::Terminated);
        }
        if state.fail_io {
            return Err(TransportError::Timeout);
        }
        let addr = addr as usize;
        // A stuck card never acknowledges the raised reset flag.
        if let Some(regions) = &state.regions {
            if addr == regions.reset as usize && !state.ack_reset {
                buf.fill(0);
                return Ok(());
            }
        }
        buf.copy_from_slice(&state.mem[addr..addr + buf.len()]);
        Ok(())
    }

    fn write_bytes(
        &mut self,
        addr: u32,
        buf: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.0.borrow_mut();
        if state.terminated {
            return Err(TransportError::Terminated);
        }
        if state.fail_io {
            return Err(TransportError::Timeout);
        }
        let addr = addr as usize;
        state.mem[addr..addr + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Round-trips a real etherbone read: build the request, let the
    /// "card" walk the address list, parse the reply back into `buf`.
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let (read_addr, read_len) = {
            let state = self.0.borrow();
            if state.terminated {
                return Err(TransportError::Terminated);
            }
            if state.fail_io {
                return Err(TransportError::Timeout);
            }
            let regions =
                state.regions.as_ref().ok_or(TransportError::BadFrame)?;
            (regions.read, regions.read_len)
        };

        let mut request = vec![0u8; etherbone::HEADER_LEN + read_len];
        let n = etherbone::read_request(read_addr, read_len, &mut request)
            .map_err(|_| TransportError::BadFrame)?;

        let mut reply = vec![0u8; etherbone::HEADER_LEN + read_len];
        reply[..etherbone::HEADER_LEN]
            .copy_from_slice(&request[..etherbone::HEADER_LEN]);
        {
            let state = self.0.borrow_mut();
            let addrs = etherbone::read_request_addrs(&request[..n])
                .map_err(|_| TransportError::BadFrame)?;
            for (i, addr) in addrs.enumerate() {
                let at = addr as usize;
                reply[etherbone::HEADER_LEN + 4 * i
                    ..etherbone::HEADER_LEN + 4 * i + 4]
                    .copy_from_slice(&state.mem[at..at + 4]);
            }
        }

        let payload = etherbone::parse_reply(&reply, read_len)
            .map_err(|_| TransportError::BadFrame)?;
        if buf.len() != etherbone::HEADER_LEN + read_len {
            return Err(TransportError::WrongLength {
                expected: etherbone::HEADER_LEN + read_len,
                actual: buf.len(),
            });
        }
        buf[etherbone::HEADER_LEN..].copy_from_slice(payload);
        self.0.borrow_mut().packet_reads += 1;
        Ok(())
    }

    /// Frames the command payload as an etherbone write and applies it to
    /// card memory.
    fn write_packet(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let (write_addr, write_len) = {
            let state = self.0.borrow();
            if state.terminated {
                return Err(TransportError::Terminated);
            }
            if state.fail_io {
                return Err(TransportError::Timeout);
            }
            let regions =
                state.regions.as_ref().ok_or(TransportError::BadFrame)?;
            (regions.write, regions.write_len)
        };
        if buf.len() != etherbone::HEADER_LEN + write_len {
            return Err(TransportError::WrongLength {
                expected: etherbone::HEADER_LEN + write_len,
                actual: buf.len(),
            });
        }

        // Build the frame in place, the way the UDP transport uses the
        // buffer's header slack.
        let payload = buf[etherbone::HEADER_LEN..].to_vec();
        let n = etherbone::write_request(write_addr, &payload, buf)
            .map_err(|_| TransportError::BadFrame)?;

        let applied = etherbone::parse_reply(&buf[..n], write_len)
            .map_err(|_| TransportError::BadFrame)?
            .to_vec();
        let mut state = self.0.borrow_mut();
        let at = write_addr as usize;
        state.mem[at..at + write_len].copy_from_slice(&applied);
        state.packet_writes += 1;
        Ok(())
    }

    fn terminate(&mut self) {
        self.0.borrow_mut().terminated = true;
    }
}
