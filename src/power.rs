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

use std::thread;

use anyhow::Result;
use async_std::channel::{bounded, Sender};
use async_std::sync::{Arc, Mutex};
use async_std::task::spawn_blocking;
use futures_lite::future::block_on;
use log::{info, warn};

use crate::gpadc::Gpadc;

struct Suspension {
    gpadc: Arc<Gpadc>,
    resume: Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl Suspension {
    async fn release(self) {
        let Self {
            gpadc,
            resume,
            thread,
        } = self;

        // Closing the channel wakes the thread holding the guard
        resume.close();

        // The thread may hold the last reference to a detached GPADC, which
        // makes dropping it a blocking teardown.
        spawn_blocking(move || {
            if thread.join().is_err() {
                warn!("GPADC suspend thread panicked");
            }

            drop(gpadc);
        })
        .await;
    }
}

/// Keeps the GPADC suspended on behalf of the host until it is resumed.
///
/// The suspend guard borrows the device, so it is held by a dedicated
/// thread that parks until the gate is opened again.
pub struct PowerGate {
    current: Mutex<Option<Suspension>>,
}

impl PowerGate {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Is `gpadc` the device currently held suspended?
    pub async fn suspends(&self, gpadc: &Arc<Gpadc>) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map_or(false, |s| Arc::ptr_eq(&s.gpadc, gpadc))
    }

    /// Suspend `gpadc`. Returns once a running conversion has finished and
    /// no new one can start.
    ///
    /// A different device that is still held suspended is resumed first.
    pub async fn suspend(&self, gpadc: Arc<Gpadc>) -> Result<()> {
        let mut current = self.current.lock().await;

        if let Some(suspension) = current.take() {
            if Arc::ptr_eq(&suspension.gpadc, &gpadc) {
                *current = Some(suspension);
                return Ok(());
            }

            info!("Moving GPADC suspension to a newly attached device");
            suspension.release().await;
        }

        let (resume, resume_rx) = bounded::<()>(1);
        let (ack_tx, ack_rx) = bounded::<()>(1);

        let held = gpadc.clone();
        let thread = thread::Builder::new()
            .name("gpadc-suspend".into())
            .spawn(move || {
                let _guard = held.suspend();
                let _ = ack_tx.try_send(());

                // Only fails once the channel is closed, which is the
                // signal to resume.
                let _ = block_on(resume_rx.recv());
            })?;

        ack_rx.recv().await?;

        *current = Some(Suspension {
            gpadc,
            resume,
            thread,
        });

        info!("GPADC suspended");

        Ok(())
    }

    pub async fn resume(&self) {
        let suspension = self.current.lock().await.take();

        if let Some(suspension) = suspension {
            suspension.release().await;
            info!("GPADC resumed");
        }
    }

    /// Resume `gpadc` if it is the device held suspended
    pub async fn release(&self, gpadc: &Arc<Gpadc>) {
        let mut current = self.current.lock().await;

        let matches = current
            .as_ref()
            .map_or(false, |s| Arc::ptr_eq(&s.gpadc, gpadc));

        if !matches {
            return;
        }

        if let Some(suspension) = current.take() {
            suspension.release().await;
            info!("Released suspension of detached GPADC");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use async_std::sync::Arc;
    use async_std::task::block_on;

    use super::PowerGate;
    use crate::gpadc::{Gpadc, Params, Timing};
    use crate::pmic::SimPmic;

    fn attach(pmic: &SimPmic) -> Arc<Gpadc> {
        let params = Params {
            realbits: 11,
            consumer_map: true,
            timing: Timing::default(),
        };

        Arc::new(Gpadc::attach(pmic.resources(3), &params).unwrap())
    }

    fn timed_read(gpadc: &Arc<Gpadc>, channel: usize) -> thread::JoinHandle<(u16, Duration)> {
        let gpadc = gpadc.clone();

        thread::spawn(move || {
            let start = Instant::now();
            (gpadc.read_raw(channel).unwrap(), start.elapsed())
        })
    }

    #[test]
    fn suspend_and_resume() {
        let pmic = SimPmic::new();
        pmic.set_result(1, 0x0180);

        let gpadc = attach(&pmic);
        let gate = PowerGate::new();

        block_on(gate.suspend(gpadc.clone())).unwrap();
        assert!(block_on(gate.suspends(&gpadc)));

        // Suspending twice is fine
        block_on(gate.suspend(gpadc.clone())).unwrap();

        let reader = timed_read(&gpadc, 1);

        thread::sleep(Duration::from_millis(100));
        block_on(gate.resume());
        assert!(!block_on(gate.suspends(&gpadc)));

        let (raw, elapsed) = reader.join().unwrap();
        assert_eq!(raw, 0x0180);
        assert!(elapsed >= Duration::from_millis(80));
    }

    #[test]
    fn suspension_follows_new_device() {
        let pmic_a = SimPmic::new();
        let pmic_b = SimPmic::new();
        pmic_b.set_result(0, 0x021A);

        let gpadc_a = attach(&pmic_a);
        let gpadc_b = attach(&pmic_b);
        let gate = PowerGate::new();

        block_on(gate.suspend(gpadc_a.clone())).unwrap();
        block_on(gate.suspend(gpadc_b.clone())).unwrap();

        assert!(!block_on(gate.suspends(&gpadc_a)));
        assert!(block_on(gate.suspends(&gpadc_b)));

        // The old device is free again, the new one is held
        assert_eq!(gpadc_a.read_raw(0).unwrap(), 0);

        let reader = timed_read(&gpadc_b, 0);
        thread::sleep(Duration::from_millis(100));
        block_on(gate.resume());

        let (raw, elapsed) = reader.join().unwrap();
        assert_eq!(raw, 0x021A);
        assert!(elapsed >= Duration::from_millis(80));
    }

    #[test]
    fn release_only_matching_device() {
        let pmic_a = SimPmic::new();
        let pmic_b = SimPmic::new();

        let gpadc_a = attach(&pmic_a);
        let gpadc_b = attach(&pmic_b);
        let gate = PowerGate::new();

        block_on(gate.suspend(gpadc_a.clone())).unwrap();

        block_on(gate.release(&gpadc_b));
        assert!(block_on(gate.suspends(&gpadc_a)));

        block_on(gate.release(&gpadc_a));
        assert!(!block_on(gate.suspends(&gpadc_a)));

        // No reference stays behind in the gate
        assert_eq!(Arc::strong_count(&gpadc_a), 1);
    }
}
