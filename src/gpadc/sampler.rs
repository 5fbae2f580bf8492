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

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::sleep;
use std::time::Duration;

use async_std::sync::Arc;
use log::debug;
use thiserror::Error;

use super::irq::Completion;
use super::regmap::{regs, ChannelDesc, CHANNELS};
use crate::pmic::RegisterChannel;

// Polling GPADCREQ 500 times with ~2ms in between gives the hardware about
// one second to become idle.
const BUSY_POLL_BUDGET: u32 = 500;
const BUSY_POLL_INTERVAL: Duration = Duration::from_micros(1800);
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("GPADC did not become idle, no conversion was started")]
    BusyTimeout,
    #[error("GPADC conversion did not complete in time")]
    CompletionTimeout,
    #[error("Failed to access PMIC register 0x{reg:02x}: {source}")]
    ChannelIo {
        reg: u8,
        #[source]
        source: io::Error,
    },
    #[error("No GPADC channel with index {0}")]
    NoSuchChannel(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub busy_poll_interval: Duration,
    pub busy_poll_budget: u32,
    pub completion_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            busy_poll_interval: BUSY_POLL_INTERVAL,
            busy_poll_budget: BUSY_POLL_BUDGET,
            completion_timeout: COMPLETION_TIMEOUT,
        }
    }
}

/// Serializes all conversions through the single GPADC conversion engine.
pub struct Sampler {
    regs: Arc<dyn RegisterChannel>,
    // Held for the whole duration of a conversion, from unmasking the
    // interrupts to masking them again. Holding it also means the GPADC
    // is active, which is why suspend takes it as well.
    lock: Mutex<()>,
    completion: Arc<Completion>,
    timing: Timing,
    realbits: u8,
}

impl Sampler {
    pub(super) fn new(regs: Arc<dyn RegisterChannel>, timing: Timing, realbits: u8) -> Self {
        Self {
            regs,
            lock: Mutex::new(()),
            completion: Arc::new(Completion::new()),
            timing,
            realbits,
        }
    }

    pub(super) fn completion(&self) -> Arc<Completion> {
        self.completion.clone()
    }

    pub fn realbits(&self) -> u8 {
        self.realbits
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, ()> {
        // The mutex guards hardware access, not data. A reader that panicked
        // has left nothing behind that would need fixing up.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self, reg: u8) -> Result<u8, SampleError> {
        self.regs
            .read_byte(reg)
            .map_err(|source| SampleError::ChannelIo { reg, source })
    }

    fn write(&self, reg: u8, value: u8) -> Result<(), SampleError> {
        self.regs
            .write_byte(reg, value)
            .map_err(|source| SampleError::ChannelIo { reg, source })
    }

    fn update(&self, reg: u8, clear: u8, set: u8) -> Result<(), SampleError> {
        self.regs
            .update_bits(reg, clear, set)
            .map_err(|source| SampleError::ChannelIo { reg, source })
    }

    fn unmask_irqs(&self) -> Result<(), SampleError> {
        self.update(regs::MADCIRQ, regs::ADCIRQ_ALL, 0)?;
        self.update(regs::MIRQLVL1, regs::MIRQLVL1_ADC, 0)
    }

    /// Disable all ADC interrupts at both levels.
    ///
    /// Both registers are always written, even if the first write fails.
    pub(super) fn mask_irqs(&self) -> Result<(), SampleError> {
        let lvl1 = self.update(regs::MIRQLVL1, 0, regs::MIRQLVL1_ADC);
        let adc = self.update(regs::MADCIRQ, 0, regs::ADCIRQ_ALL);

        lvl1.and(adc)
    }

    fn wait_idle(&self) -> Result<(), SampleError> {
        let mut remaining = self.timing.busy_poll_budget;

        loop {
            if self.read(regs::GPADCREQ)? & regs::GPADCREQ_BUSY == 0 {
                return Ok(());
            }

            remaining = remaining.saturating_sub(1);

            if remaining == 0 {
                return Err(SampleError::BusyTimeout);
            }

            sleep(self.timing.busy_poll_interval);
        }
    }

    fn convert(&self, channel: &ChannelDesc) -> Result<u16, SampleError> {
        // Unmask first, a fast conversion could otherwise complete before
        // anyone listens for it.
        self.unmask_irqs()?;
        self.completion.clear();

        self.wait_idle()?;
        self.write(regs::GPADCREQ, channel.request())?;

        if !self.completion.wait(self.timing.completion_timeout) {
            return Err(SampleError::CompletionTimeout);
        }

        let hi = self.read(channel.addr_hi)?;
        let lo = self.read(channel.addr_lo)?;

        Ok(self.limit(channel, u16::from_be_bytes([hi, lo])))
    }

    fn limit(&self, channel: &ChannelDesc, raw: u16) -> u16 {
        let max = u16::MAX >> (16 - u32::from(self.realbits.clamp(1, 16)));

        if raw > max {
            debug!(
                "GPADC channel {} returned 0x{:04x}, more than {} bits",
                channel.name, raw, self.realbits
            );
        }

        raw & max
    }

    /// Perform a single conversion on the channel with index `channel`
    /// and return the raw result.
    ///
    /// Blocks while another conversion is in progress or the device is
    /// suspended.
    pub fn read_channel(&self, channel: usize) -> Result<u16, SampleError> {
        let desc = CHANNELS
            .get(channel)
            .ok_or(SampleError::NoSuchChannel(channel))?;

        let _guard = self.lock();

        // A late acknowledgement of the previous interrupt would mask the
        // interrupt of this request right after it was unmasked.
        if !self.completion.wait_acked(self.timing.completion_timeout) {
            debug!("Starting GPADC conversion with an interrupt acknowledgement pending");
        }

        let res = self.convert(desc);

        // Leave the interrupts disabled no matter how the conversion went
        let masked = self.mask_irqs();

        let raw = res?;
        masked?;

        Ok(raw)
    }

    /// The deferred part of the interrupt handler.
    ///
    /// Runs while the interrupted request is still reading its result, so it
    /// must not take the sampler lock. `update_bits` is atomic on its own.
    pub(super) fn acknowledge_irq(&self) -> Result<(), SampleError> {
        self.update(regs::MIRQLVL1, 0, regs::MIRQLVL1_ADC)
    }
}
