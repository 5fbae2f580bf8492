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

use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_std::sync::Arc;
use async_std::task::{sleep, spawn_blocking};
use log::{info, warn};

use crate::config::Config;
use crate::gpadc::Gpadc;
use crate::pmic::{connect, scu_available};
use crate::power::PowerGate;
use crate::watched_tasks::WatchedTasksBuilder;

/// The currently attached GPADC, if any
pub struct GpadcSlot {
    gpadc: Mutex<Option<Arc<Gpadc>>>,
}

impl GpadcSlot {
    pub fn new() -> Self {
        Self {
            gpadc: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<Gpadc>> {
        self.gpadc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, gpadc: Option<Arc<Gpadc>>) -> Option<Arc<Gpadc>> {
        let mut slot = self.gpadc.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, gpadc)
    }
}

/// Attaches the GPADC while the SCU IPC is up and detaches it once it
/// goes away.
pub struct ScuWatcher {
    config: Config,
    slot: Arc<GpadcSlot>,
    gate: Arc<PowerGate>,
}

impl ScuWatcher {
    pub fn new(config: Config, slot: Arc<GpadcSlot>, gate: Arc<PowerGate>) -> Self {
        Self { config, slot, gate }
    }

    async fn attach(&self) {
        let config = self.config.clone();

        let res = spawn_blocking(move || {
            let resources = connect(&config)?;
            Gpadc::attach(resources, &config.gpadc_params())
        })
        .await;

        match res {
            Ok(gpadc) => {
                self.slot.replace(Some(Arc::new(gpadc)));
            }
            Err(e) => warn!("Failed to attach GPADC, will retry: {e:#}"),
        }
    }

    async fn detach(&self) {
        if let Some(gpadc) = self.slot.replace(None) {
            // A suspension of the old device must not outlive it
            self.gate.release(&gpadc).await;

            // Detaching joins the interrupt worker, which may have to wait
            // for a running conversion. While requests are still in flight
            // the last one of them to finish tears the device down instead.
            match Arc::try_unwrap(gpadc) {
                Ok(gpadc) => spawn_blocking(move || gpadc.detach()).await,
                Err(_) => info!("GPADC still in use, detaching once released"),
            }
        }
    }

    /// Bring the attachment state in line with the SCU state
    pub async fn update(&self) {
        let available = scu_available(&self.config);
        let attached = self.slot.get().is_some();

        match (available, attached) {
            (true, false) => {
                info!("SCU IPC is up, attaching GPADC");
                self.attach().await;
            }
            (false, true) => {
                info!("SCU IPC went down, detaching GPADC");
                self.detach().await;
            }
            _ => {}
        }
    }

    pub fn spawn(self, wtb: &mut WatchedTasksBuilder) -> Result<()> {
        let interval = self.config.scu_poll_interval();

        wtb.spawn_task("scu-watcher", async move {
            loop {
                self.update().await;
                sleep(interval).await;
            }
        })
    }
}
