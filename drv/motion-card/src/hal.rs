// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared pins and the registry that allocates them.
//!
//! The real-time framework owns the pin namespace; this crate only asks it
//! for named bit/u32/float cells. A [`Pin`] is a cheap cloneable handle to
//! one such cell. Pins are deliberately not `Send`: the concurrency model
//! is a single real-time thread, and exactly one module touches any given
//! pin, so there is nothing to lock.
//!
//! [`MemRegistry`] is a self-contained in-memory implementation used by the
//! test suite and by simulations that run the driver without a real-time
//! framework underneath.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Direction of a pin from the driver's point of view: `In` is commanded by
/// the controller, `Out` is driven by this driver, `Io` is both.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PinDir {
    In,
    Out,
    Io,
}

/// Parameters are set by the operator (`Rw`) or published by the driver
/// (`Ro`); either way they change rarely compared to pins.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamDir {
    Ro,
    Rw,
}

/// Handle to a named shared cell.
#[derive(Debug, Default)]
pub struct Pin<T: Copy>(Rc<Cell<T>>);

impl<T: Copy> Pin<T> {
    pub fn get(&self) -> T {
        self.0.get()
    }

    pub fn set(&self, v: T) {
        self.0.set(v);
    }
}

impl<T: Copy> Clone for Pin<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("out of shared pin memory")]
    OutOfMemory,

    #[error("duplicate pin name `{0}`")]
    DuplicateName(String),

    #[error("`{0}` is not a valid pin name")]
    BadName(String),
}

/// Allocation interface offered by the real-time framework.
///
/// Bring-up is transactional from the registry's point of view: when board
/// registration fails partway, the driver calls [`HalRegistry::release`]
/// with the board's name prefix so the namespace ends up exactly as it was.
pub trait HalRegistry {
    fn pin_bit(&mut self, name: &str, dir: PinDir)
        -> Result<Pin<bool>, HalError>;
    fn pin_u32(&mut self, name: &str, dir: PinDir)
        -> Result<Pin<u32>, HalError>;
    fn pin_float(&mut self, name: &str, dir: PinDir)
        -> Result<Pin<f64>, HalError>;

    fn param_bit(&mut self, name: &str, dir: ParamDir)
        -> Result<Pin<bool>, HalError>;
    fn param_u32(&mut self, name: &str, dir: ParamDir)
        -> Result<Pin<u32>, HalError>;
    fn param_float(&mut self, name: &str, dir: ParamDir)
        -> Result<Pin<f64>, HalError>;

    /// Removes every pin and param whose name starts with `prefix`.
    fn release(&mut self, prefix: &str);
}

/// One allocated cell in a [`MemRegistry`].
#[derive(Clone, Debug)]
pub enum MemPin {
    Bit(Pin<bool>),
    U32(Pin<u32>),
    Float(Pin<f64>),
}

/// In-memory pin registry for tests and simulation.
#[derive(Default)]
pub struct MemRegistry {
    cells: BTreeMap<String, MemPin>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: &str, cell: MemPin) -> Result<(), HalError> {
        if name.is_empty() {
            return Err(HalError::BadName(name.into()));
        }
        if self.cells.contains_key(name) {
            return Err(HalError::DuplicateName(name.into()));
        }
        self.cells.insert(name.into(), cell);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Looks up a bit cell by name; panics on a missing name or a type
    /// mismatch, which in a test is exactly what we want.
    pub fn bit(&self, name: &str) -> Pin<bool> {
        match &self.cells[name] {
            MemPin::Bit(p) => p.clone(),
            other => panic!("pin {name} is {other:?}, wanted bit"),
        }
    }

    pub fn u32(&self, name: &str) -> Pin<u32> {
        match &self.cells[name] {
            MemPin::U32(p) => p.clone(),
            other => panic!("pin {name} is {other:?}, wanted u32"),
        }
    }

    pub fn float(&self, name: &str) -> Pin<f64> {
        match &self.cells[name] {
            MemPin::Float(p) => p.clone(),
            other => panic!("pin {name} is {other:?}, wanted float"),
        }
    }
}

impl HalRegistry for MemRegistry {
    fn pin_bit(
        &mut self,
        name: &str,
        _dir: PinDir,
    ) -> Result<Pin<bool>, HalError> {
        let pin = Pin::default();
        self.insert(name, MemPin::Bit(pin.clone()))?;
        Ok(pin)
    }

    fn pin_u32(
        &mut self,
        name: &str,
        _dir: PinDir,
    ) -> Result<Pin<u32>, HalError> {
        let pin = Pin::default();
        self.insert(name, MemPin::U32(pin.clone()))?;
        Ok(pin)
    }

    fn pin_float(
        &mut self,
        name: &str,
        _dir: PinDir,
    ) -> Result<Pin<f64>, HalError> {
        let pin = Pin::default();
        self.insert(name, MemPin::Float(pin.clone()))?;
        Ok(pin)
    }

    fn param_bit(
        &mut self,
        name: &str,
        _dir: ParamDir,
    ) -> Result<Pin<bool>, HalError> {
        let pin = Pin::default();
        self.insert(name, MemPin::Bit(pin.clone()))?;
        Ok(pin)
    }

    fn param_u32(
        &mut self,
        name: &str,
        _dir: ParamDir,
    ) -> Result<Pin<u32>, HalError> {
        let pin = Pin::default();
        self.insert(name, MemPin::U32(pin.clone()))?;
        Ok(pin)
    }

    fn param_float(
        &mut self,
        name: &str,
        _dir: ParamDir,
    ) -> Result<Pin<f64>, HalError> {
        let pin = Pin::default();
        self.insert(name, MemPin::Float(pin.clone()))?;
        Ok(pin)
    }

    fn release(&mut self, prefix: &str) {
        self.cells.retain(|name, _| !name.starts_with(prefix));
    }
}
