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

//! A simulated Basin Cove PMIC
//!
//! Used in demo mode instead of the real hardware and by the tests to
//! observe (and sabotage) what the sampler does to the registers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::{bail, Result};
use async_std::sync::Arc;
use log::debug;

use crate::config::Config;
use crate::gpadc::regmap::{regs, CHANNELS};
use crate::gpadc::IrqAction;
use crate::pmic::{InterruptLine, RegisterChannel, Resources};

// Realistic looking values for the demo mode, in channel order
const DEMO_RESULTS: [u16; 9] = [
    0x021A, 0x0180, 0x0042, 0x01E0, 0x0200, 0x0204, 0x01C0, 0x01C8, 0x01D0,
];

const DEMO_CONVERSION_TIME: Duration = Duration::from_millis(5);

static DEMO_SCU_UP: AtomicBool = AtomicBool::new(true);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { reg: u8, value: u8 },
    Write { reg: u8, value: u8 },
    Update { reg: u8, clear: u8, set: u8 },
}

/// A single access to the register channel and the thread that did it
#[derive(Debug, Clone)]
pub struct RegisterOp {
    pub thread: ThreadId,
    pub thread_name: Option<String>,
    pub access: Access,
}

#[allow(dead_code)]
impl RegisterOp {
    pub fn is_read(&self, reg: u8) -> bool {
        matches!(self.access, Access::Read { reg: r, .. } if r == reg)
    }

    pub fn is_write(&self, reg: u8, value: u8) -> bool {
        self.access == Access::Write { reg, value }
    }

    pub fn is_update(&self, reg: u8, clear: u8, set: u8) -> bool {
        self.access == Access::Update { reg, clear, set }
    }

    /// Any kind of modification of `reg`
    pub fn writes(&self, reg: u8) -> bool {
        match self.access {
            Access::Write { reg: r, .. } | Access::Update { reg: r, .. } => r == reg,
            Access::Read { .. } => false,
        }
    }
}

type Handler = Arc<dyn Fn() + Send + Sync>;

struct State {
    regs: [u8; 256],
    results: [u16; 9],
    conversion_time: Duration,
    fail_reg: Option<u8>,
    trace: Vec<RegisterOp>,
}

struct Inner {
    state: Mutex<State>,
    handler: Mutex<Option<Handler>>,
    freed_by: Mutex<Option<ThreadId>>,
    stuck_busy: AtomicBool,
    drop_interrupts: AtomicBool,
    refuse_irq: AtomicBool,
    wobble: bool,
    conversions: AtomicU32,
}

#[derive(Clone)]
pub struct SimPmic {
    inner: Arc<Inner>,
}

struct SimIrqLine {
    pmic: SimPmic,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[allow(dead_code)]
impl SimPmic {
    fn with_results(results: [u16; 9], conversion_time: Duration, wobble: bool) -> Self {
        let state = State {
            regs: [0; 256],
            results,
            conversion_time,
            fail_reg: None,
            trace: Vec::new(),
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                handler: Mutex::new(None),
                freed_by: Mutex::new(None),
                stuck_busy: AtomicBool::new(false),
                drop_interrupts: AtomicBool::new(false),
                refuse_irq: AtomicBool::new(false),
                wobble,
                conversions: AtomicU32::new(0),
            }),
        }
    }

    /// A PMIC that converts instantly and returns zero for every channel
    pub fn new() -> Self {
        Self::with_results([0; 9], Duration::ZERO, false)
    }

    pub fn demo() -> Self {
        Self::with_results(DEMO_RESULTS, DEMO_CONVERSION_TIME, true)
    }

    pub fn registers(&self) -> Arc<dyn RegisterChannel> {
        Arc::new(self.clone())
    }

    pub fn resources(&self, irq: u32) -> Resources {
        Resources {
            regs: self.registers(),
            irq_line: Box::new(SimIrqLine { pmic: self.clone() }),
            irq,
        }
    }

    /// Call `handler` whenever the PMIC raises the ADC interrupt
    pub fn on_interrupt<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.inner.handler) = Some(Arc::new(handler));
    }

    /// The thread that last freed the interrupt line
    pub fn irq_freed_by(&self) -> Option<ThreadId> {
        *lock(&self.inner.freed_by)
    }

    pub fn irq_requested(&self) -> bool {
        lock(&self.inner.handler).is_some()
    }

    pub fn set_result(&self, channel: usize, raw: u16) {
        lock(&self.inner.state).results[channel] = raw;
    }

    pub fn set_conversion_time(&self, conversion_time: Duration) {
        lock(&self.inner.state).conversion_time = conversion_time;
    }

    /// Make GPADCREQ report a busy conversion engine forever
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.inner.stuck_busy.store(stuck, Ordering::Relaxed);
    }

    /// Convert as usual but never raise the interrupt
    pub fn set_drop_interrupts(&self, drop: bool) {
        self.inner.drop_interrupts.store(drop, Ordering::Relaxed);
    }

    /// Make every access to `reg` fail with an I/O error
    pub fn fail_register(&self, reg: Option<u8>) {
        lock(&self.inner.state).fail_reg = reg;
    }

    /// Make requesting the interrupt line fail
    pub fn refuse_irq(&self, refuse: bool) {
        self.inner.refuse_irq.store(refuse, Ordering::Relaxed);
    }

    /// Peek at a register without going through (and showing up in the
    /// trace of) the register channel
    pub fn register(&self, reg: u8) -> u8 {
        lock(&self.inner.state).regs[usize::from(reg)]
    }

    pub fn set_register(&self, reg: u8, value: u8) {
        lock(&self.inner.state).regs[usize::from(reg)] = value;
    }

    pub fn trace(&self) -> Vec<RegisterOp> {
        lock(&self.inner.state).trace.clone()
    }

    pub fn clear_trace(&self) {
        lock(&self.inner.state).trace.clear();
    }

    /// Lock the state, record the access and check for injected faults
    fn access(&self, access: Access) -> io::Result<MutexGuard<'_, State>> {
        let mut state = lock(&self.inner.state);
        let current = thread::current();

        state.trace.push(RegisterOp {
            thread: current.id(),
            thread_name: current.name().map(str::to_owned),
            access,
        });

        let reg = match access {
            Access::Read { reg, .. } | Access::Write { reg, .. } | Access::Update { reg, .. } => {
                reg
            }
        };

        if state.fail_reg == Some(reg) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated IPC failure on register 0x{reg:02x}"),
            ));
        }

        Ok(state)
    }

    fn start_conversion(&self, request: u8, conversion_time: Duration) {
        let pmic = self.clone();

        thread::spawn(move || {
            thread::sleep(conversion_time);
            pmic.finish_conversion(request);
        });
    }

    fn finish_conversion(&self, request: u8) {
        let wobble = match self.inner.wobble {
            true => (self.inner.conversions.fetch_add(1, Ordering::Relaxed) % 4) as u16,
            false => 0,
        };

        let raise = {
            let mut state = lock(&self.inner.state);

            for (idx, ch) in CHANNELS.iter().enumerate() {
                if request & (1 << ch.control) != 0 {
                    let [hi, lo] = state.results[idx].wrapping_add(wobble).to_be_bytes();
                    state.regs[usize::from(ch.addr_hi)] = hi;
                    state.regs[usize::from(ch.addr_lo)] = lo;
                }
            }

            state.regs[usize::from(regs::GPADCREQ)] = 0;

            // The interrupt source bits share their position with the
            // conversion control bits.
            let sources = request & regs::ADCIRQ_ALL;
            state.regs[usize::from(regs::ADCIRQ)] |= sources;

            let lvl1_masked =
                state.regs[usize::from(regs::MIRQLVL1)] & regs::MIRQLVL1_ADC != 0;
            let unmasked_sources = sources & !state.regs[usize::from(regs::MADCIRQ)];

            request & regs::GPADCREQ_IRQEN != 0 && !lvl1_masked && unmasked_sources != 0
        };

        if !raise || self.inner.drop_interrupts.load(Ordering::Relaxed) {
            debug!("Simulated GPADC conversion 0x{request:02x} done without interrupt");
            return;
        }

        let handler = lock(&self.inner.handler).clone();

        if let Some(handler) = handler {
            handler();
        }
    }
}

impl RegisterChannel for SimPmic {
    fn read_byte(&self, reg: u8) -> io::Result<u8> {
        let state = self.access(Access::Read { reg, value: 0 })?;
        let mut value = state.regs[usize::from(reg)];

        if reg == regs::GPADCREQ && self.inner.stuck_busy.load(Ordering::Relaxed) {
            value |= regs::GPADCREQ_BUSY;
        }

        Ok(value)
    }

    fn write_byte(&self, reg: u8, value: u8) -> io::Result<()> {
        let mut state = self.access(Access::Write { reg, value })?;

        if reg == regs::GPADCREQ {
            state.regs[usize::from(reg)] = value | regs::GPADCREQ_BUSY;
            let conversion_time = state.conversion_time;
            drop(state);

            self.start_conversion(value, conversion_time);
        } else {
            state.regs[usize::from(reg)] = value;
        }

        Ok(())
    }

    fn update_bits(&self, reg: u8, clear: u8, set: u8) -> io::Result<()> {
        let mut state = self.access(Access::Update { reg, clear, set })?;
        let val = &mut state.regs[usize::from(reg)];

        *val = (*val & !clear) | set;

        Ok(())
    }
}

impl InterruptLine for SimIrqLine {
    fn request(&self, action: IrqAction) -> Result<()> {
        if self.pmic.inner.refuse_irq.load(Ordering::Relaxed) {
            bail!("Simulated interrupt line refuses requests");
        }

        let mut handler = lock(&self.pmic.inner.handler);

        if handler.is_some() {
            bail!("Simulated interrupt line is already in use");
        }

        *handler = Some(Arc::new(move || {
            action.fire();
        }));

        Ok(())
    }

    fn free(&self) {
        lock(&self.pmic.inner.handler).take();
        *lock(&self.pmic.inner.freed_by) = Some(thread::current().id());
    }
}

pub fn connect(config: &Config) -> Result<Resources> {
    Ok(SimPmic::demo().resources(config.irq))
}

pub fn scu_available(_config: &Config) -> bool {
    DEMO_SCU_UP.load(Ordering::Relaxed)
}

/// Pretend the SCU went up or down
#[allow(dead_code)]
pub fn set_scu_available(up: bool) {
    DEMO_SCU_UP.store(up, Ordering::Relaxed);
}
