// This file is part of gpadcd, the Basin Cove GPADC sampler daemon
// Copyright (C) 2024 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Access to the PMIC the GPADC lives in.
//!
//! The GPADC is only reachable via byte wide register accesses that are
//! tunneled through the SCU IPC and a single interrupt line that signals
//! finished conversions. Both are hidden behind the traits below so that the
//! sampling logic does not care whether it talks to real hardware or to the
//! simulated PMIC used in demo mode and in the tests.

use std::io;

use anyhow::Result;
use async_std::sync::Arc;

use crate::gpadc::IrqAction;

#[cfg(any(test, feature = "demo_mode"))]
mod backend {
    mod demo_mode;
    pub use demo_mode::*;
}

#[cfg(not(any(test, feature = "demo_mode")))]
mod backend {
    mod hardware;
    pub use hardware::*;
}

pub use backend::{connect, scu_available};

#[cfg(test)]
pub use backend::{set_scu_available, RegisterOp, SimPmic};

/// Byte wide access to the PMIC register file.
pub trait RegisterChannel: Send + Sync {
    fn read_byte(&self, reg: u8) -> io::Result<u8>;

    fn write_byte(&self, reg: u8, value: u8) -> io::Result<()>;

    /// Clear the bits in `clear` and then set the bits in `set`.
    ///
    /// The read-modify-write cycle must be atomic with respect to other
    /// users of the same channel.
    fn update_bits(&self, reg: u8, clear: u8, set: u8) -> io::Result<()>;
}

/// The interrupt line signalling completed conversions.
pub trait InterruptLine: Send + Sync {
    /// Start delivering interrupts to `action` until `free()` is called.
    fn request(&self, action: IrqAction) -> Result<()>;

    /// Stop delivering interrupts and drop the action.
    fn free(&self);
}

/// Everything the GPADC needs from the platform to attach.
pub struct Resources {
    pub regs: Arc<dyn RegisterChannel>,
    pub irq_line: Box<dyn InterruptLine>,
    pub irq: u32,
}
