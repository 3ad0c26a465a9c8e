// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! General-purpose pins, packed over the wire.
//!
//! The descriptor names a pin count per direction and a direction bitmap;
//! the packet side is one bit per pin, rows padded to a DWORD. Row bit `i`
//! counted MSB-first from the row start carries pin `i`, so pin 0 rides
//! the 0x80 bit of the row's first byte. Outputs are XOR-masked with their
//! `invert_output` parameter on the way out; inputs decode into an
//! `in`/`in-not` pair that is complementary by construction.

use crate::cursor::{bit_row_len, ReadCursor, WriteCursor};
use crate::hal::{ParamDir, Pin, PinDir};
use crate::modules::{
    channel_base, BringUp, CycleState, Module, ModuleInstance,
};
use crate::Error;

#[derive(Debug)]
struct OutputPin {
    out: Pin<bool>,
    invert_output: Pin<bool>,
}

#[derive(Debug)]
struct InputPin {
    input: Pin<bool>,
    input_not: Pin<bool>,
}

#[derive(Debug)]
pub struct Gpio {
    outputs: Vec<OutputPin>,
    inputs: Vec<InputPin>,
}

/// Parses the descriptor: output count, input count, then a direction
/// bitmap (bit set = output) over the physical pins, MSB-first, padded so
/// the whole descriptor is DWORD-aligned. Physical pin order gives the
/// default pin names; configured names map onto each direction's pins in
/// ascending physical order.
pub fn from_descriptor(
    bring: &mut BringUp<'_>,
    desc: &mut ReadCursor<'_>,
) -> Result<ModuleInstance, Error> {
    let truncated = |_| Error::Config("gpio: truncated module descriptor");
    let num_out = usize::from(desc.read_u8().map_err(truncated)?);
    let num_in = usize::from(desc.read_u8().map_err(truncated)?);
    let total = num_out + num_in;
    let bitmap_len = crate::cursor::align_dword(2 + total.div_ceil(8)) - 2;
    let bitmap = desc.read_bytes(bitmap_len).map_err(truncated)?;

    if !bring.config.gpio_out.is_empty()
        && bring.config.gpio_out.len() != num_out
    {
        return Err(Error::Config(
            "gpio_out entries do not match the card's output count",
        ));
    }
    if !bring.config.gpio_in.is_empty()
        && bring.config.gpio_in.len() != num_in
    {
        return Err(Error::Config(
            "gpio_in entries do not match the card's input count",
        ));
    }

    let mut outputs = Vec::with_capacity(num_out);
    let mut inputs = Vec::with_capacity(num_in);
    for pin in 0..total {
        let is_output = bitmap[pin / 8] & (0x80 >> (pin % 8)) != 0;
        if is_output {
            if outputs.len() == num_out {
                return Err(Error::Config(
                    "gpio: direction bitmap disagrees with output count",
                ));
            }
            let name = bring.config.gpio_out.get(outputs.len());
            let base = channel_base(
                bring.board,
                "gpio",
                pin,
                name.and_then(|c| c.name.as_deref()),
            );
            outputs.push(OutputPin {
                out: bring.hal.pin_bit(&format!("{base}.out"), PinDir::In)?,
                invert_output: bring
                    .hal
                    .param_bit(&format!("{base}.invert_output"), ParamDir::Rw)?,
            });
        } else {
            if inputs.len() == num_in {
                return Err(Error::Config(
                    "gpio: direction bitmap disagrees with input count",
                ));
            }
            let name = bring.config.gpio_in.get(inputs.len());
            let base = channel_base(
                bring.board,
                "gpio",
                pin,
                name.and_then(|c| c.name.as_deref()),
            );
            inputs.push(InputPin {
                input: bring.hal.pin_bit(&format!("{base}.in"), PinDir::Out)?,
                input_not: bring
                    .hal
                    .pin_bit(&format!("{base}.in-not"), PinDir::Out)?,
            });
        }
    }

    Ok(ModuleInstance::Gpio(Gpio { outputs, inputs }))
}

impl Module for Gpio {
    fn write_len(&self) -> usize {
        bit_row_len(self.outputs.len())
    }

    fn read_len(&self) -> usize {
        bit_row_len(self.inputs.len())
    }

    fn prepare_write(
        &mut self,
        w: &mut WriteCursor<'_>,
        _cycle: &CycleState,
    ) -> Result<(), Error> {
        for row in self.outputs.chunks(32) {
            let mut word = 0u32;
            for (bit, pin) in row.iter().enumerate() {
                if pin.out.get() ^ pin.invert_output.get() {
                    word |= 1 << (31 - bit);
                }
            }
            w.write_u32(word)?;
        }
        Ok(())
    }

    fn process_read(
        &mut self,
        r: &mut ReadCursor<'_>,
        _cycle: &mut CycleState,
    ) -> Result<(), Error> {
        for row in self.inputs.chunks(32) {
            let word = r.read_u32()?;
            for (bit, pin) in row.iter().enumerate() {
                let high = word & 1 << (31 - bit) != 0;
                pin.input.set(high);
                pin.input_not.set(!high);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::hal::MemRegistry;
    use proptest::prelude::*;

    fn cycle() -> CycleState {
        CycleState {
            clock_frequency: 100_000_000,
            clock_frequency_recip: 1e-8,
            period_ns: 1_000_000,
            wallclock_ticks: 0,
        }
    }

    /// Builds a module with `num_out` outputs on the low physical pins and
    /// `num_in` inputs above them.
    fn make(
        num_out: usize,
        num_in: usize,
        hal: &mut MemRegistry,
    ) -> ModuleInstance {
        let total = num_out + num_in;
        let mut desc =
            vec![0u8; crate::cursor::align_dword(2 + total.div_ceil(8))];
        desc[0] = num_out as u8;
        desc[1] = num_in as u8;
        for pin in 0..num_out {
            desc[2 + pin / 8] |= 0x80 >> (pin % 8);
        }
        let config = BoardConfig::default();
        let mut bring = BringUp {
            board: "card",
            clock_frequency: 100_000_000,
            config: &config,
            hal,
        };
        let mut cursor = ReadCursor::new("descriptor", &desc);
        let gpio = from_descriptor(&mut bring, &mut cursor).unwrap();
        cursor.finish().unwrap();
        gpio
    }

    #[test]
    fn input_decode_is_msb_first() {
        let mut hal = MemRegistry::new();
        let mut gpio = make(0, 5, &mut hal);
        let mut cycle = cycle();

        let buf = [0b1011_0000u8, 0, 0, 0];
        let mut r = ReadCursor::new("read:gpio", &buf);
        gpio.process_read(&mut r, &mut cycle).unwrap();
        r.finish().unwrap();

        for (pin, expected) in
            [true, false, true, true, false].into_iter().enumerate()
        {
            assert_eq!(hal.bit(&format!("card.gpio.{pin:02}.in")).get(),
                expected, "pin {pin}");
            assert_eq!(
                hal.bit(&format!("card.gpio.{pin:02}.in-not")).get(),
                !expected,
                "pin {pin}"
            );
        }
    }

    #[test]
    fn rows_pad_to_dwords() {
        let mut hal = MemRegistry::new();
        let gpio = make(33, 1, &mut hal);
        assert_eq!(gpio.write_len(), 8);
        assert_eq!(gpio.read_len(), 4);

        let mut hal = MemRegistry::new();
        let empty = make(0, 0, &mut hal);
        assert_eq!(empty.write_len(), 0);
        assert_eq!(empty.read_len(), 0);
    }

    #[test]
    fn invert_output_flips_the_wire_bit() {
        let mut hal = MemRegistry::new();
        let mut gpio = make(2, 0, &mut hal);
        hal.bit("card.gpio.00.out").set(true);
        hal.bit("card.gpio.01.invert_output").set(true);

        let mut buf = [0u8; 4];
        let mut w = WriteCursor::new("write:gpio", &mut buf);
        gpio.prepare_write(&mut w, &cycle()).unwrap();
        w.finish().unwrap();
        assert_eq!(buf, [0b1100_0000, 0, 0, 0]);
    }

    proptest! {
        /// Any output pattern round-trips through serialize-then-decode,
        /// modulo the invert masks.
        #[test]
        fn output_round_trip(
            states in proptest::collection::vec(any::<(bool, bool)>(), 1..70)
        ) {
            let mut out_hal = MemRegistry::new();
            let mut gpio = make(states.len(), 0, &mut out_hal);
            let mut in_hal = MemRegistry::new();
            let mut mirror = make(0, states.len(), &mut in_hal);

            let mut physical = Vec::new();
            for (pin, (level, invert)) in states.iter().enumerate() {
                out_hal.bit(&format!("card.gpio.{pin:02}.out")).set(*level);
                out_hal
                    .bit(&format!("card.gpio.{pin:02}.invert_output"))
                    .set(*invert);
                physical.push(level ^ invert);
            }

            let mut buf = vec![0u8; gpio.write_len()];
            let mut w = WriteCursor::new("write:gpio", &mut buf);
            gpio.prepare_write(&mut w, &cycle()).unwrap();
            w.finish().unwrap();
            prop_assert_eq!(buf.len(), 4 * states.len().div_ceil(32));

            let mut cycle = cycle();
            let mut r = ReadCursor::new("read:gpio", &buf);
            mirror.process_read(&mut r, &mut cycle).unwrap();
            r.finish().unwrap();

            for (pin, expected) in physical.into_iter().enumerate() {
                prop_assert_eq!(
                    in_hal.bit(&format!("card.gpio.{pin:02}.in")).get(),
                    expected
                );
            }
        }
    }
}
