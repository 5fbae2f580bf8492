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

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use anyhow::{bail, Context, Result};
use async_std::sync::Arc;
use gpio_cdev::{chips, EventRequestFlags, Line, LineRequestFlags};
use log::{error, info};
use nix::errno::Errno;
use nix::libc::off_t;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::uio::{pread, pwrite};

use crate::config::Config;
use crate::gpadc::IrqAction;
use crate::pmic::{InterruptLine, RegisterChannel, Resources};

// Wake up regularly to check if the line was freed in the meantime
const LINE_POLL_TIMEOUT_MS: i32 = 100;

/// The PMIC register file as exposed by the SCU IPC character device.
/// The file offset selects the register.
struct IpcRegisters {
    file: File,
    rmw: Mutex<()>,
}

impl IpcRegisters {
    fn open(config: &Config) -> Result<Self> {
        let path = &config.register_device;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open PMIC registers at {}", path.display()))?;

        Ok(Self {
            file,
            rmw: Mutex::new(()),
        })
    }

    fn read_unlocked(&self, reg: u8) -> io::Result<u8> {
        let mut buf = [0u8; 1];

        match pread(self.file.as_raw_fd(), &mut buf, off_t::from(reg))? {
            1 => Ok(buf[0]),
            _ => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }

    fn write_unlocked(&self, reg: u8, value: u8) -> io::Result<()> {
        match pwrite(self.file.as_raw_fd(), &[value], off_t::from(reg))? {
            1 => Ok(()),
            _ => Err(io::ErrorKind::WriteZero.into()),
        }
    }
}

impl RegisterChannel for IpcRegisters {
    fn read_byte(&self, reg: u8) -> io::Result<u8> {
        self.read_unlocked(reg)
    }

    fn write_byte(&self, reg: u8, value: u8) -> io::Result<()> {
        self.write_unlocked(reg, value)
    }

    fn update_bits(&self, reg: u8, clear: u8, set: u8) -> io::Result<()> {
        let _rmw = self.rmw.lock().unwrap_or_else(PoisonError::into_inner);

        let val = self.read_unlocked(reg)?;
        self.write_unlocked(reg, (val & !clear) | set)
    }
}

fn find_line(name: &str) -> Result<Line> {
    for chip in chips()? {
        for line in chip?.lines() {
            if line.info()?.name() == Some(name) {
                return Ok(line);
            }
        }
    }

    bail!("Could not find GPIO line {}", name)
}

struct Watcher {
    run: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// The PMIC interrupt output, routed to a GPIO of the SoC.
struct GpioIrqLine {
    line_name: String,
    watcher: Mutex<Option<Watcher>>,
}

impl GpioIrqLine {
    fn new(line_name: &str) -> Self {
        Self {
            line_name: line_name.to_owned(),
            watcher: Mutex::new(None),
        }
    }
}

impl InterruptLine for GpioIrqLine {
    fn request(&self, action: IrqAction) -> Result<()> {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);

        if watcher.is_some() {
            bail!("Interrupt line {} is already requested", self.line_name);
        }

        // The PMIC interrupt output is active low
        let mut events = find_line(&self.line_name)?
            .events(
                LineRequestFlags::INPUT,
                EventRequestFlags::FALLING_EDGE,
                "gpadcd",
            )
            .with_context(|| format!("Failed to request interrupt line {}", self.line_name))?;

        let run = Arc::new(AtomicBool::new(true));
        let run_thread = run.clone();
        let line_name = self.line_name.clone();

        let handle = thread::Builder::new()
            .name("gpadc-irq-line".into())
            .spawn(move || {
                while run_thread.load(Ordering::Relaxed) {
                    let mut fds = [PollFd::new(events.as_raw_fd(), PollFlags::POLLIN)];

                    match poll(&mut fds, LINE_POLL_TIMEOUT_MS) {
                        Ok(0) | Err(Errno::EINTR) => continue,
                        Ok(_) => {}
                        Err(e) => {
                            error!("Failed to wait for interrupt line {}: {}", line_name, e);
                            break;
                        }
                    }

                    if let Err(e) = events.get_event() {
                        error!("Failed to read event from {}: {}", line_name, e);
                        break;
                    }

                    action.fire();
                }
            })?;

        *watcher = Some(Watcher { run, handle });

        info!("Requested interrupt line {}", self.line_name);

        Ok(())
    }

    fn free(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Watcher { run, handle }) = watcher {
            run.store(false, Ordering::Relaxed);

            if handle.join().is_err() {
                error!("Interrupt line watcher for {} panicked", self.line_name);
            }
        }
    }
}

pub fn connect(config: &Config) -> Result<Resources> {
    Ok(Resources {
        regs: Arc::new(IpcRegisters::open(config)?),
        irq_line: Box::new(GpioIrqLine::new(&config.irq_line)),
        irq: config.irq,
    })
}

/// The register device only exists while the SCU IPC is up
pub fn scu_available(config: &Config) -> bool {
    config.register_device.exists()
}
