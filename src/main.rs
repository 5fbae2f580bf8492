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

use anyhow::Result;
use async_std::sync::Arc;
use log::{error, info};

mod config;
mod gpadc;
mod measurement;
mod pmic;
mod power;
mod scu;
mod watched_tasks;
mod web;

use config::Config;
use power::PowerGate;
use scu::{GpadcSlot, ScuWatcher};
use watched_tasks::WatchedTasksBuilder;

async fn init(config: Config) -> Result<WatchedTasksBuilder> {
    let mut wtb = WatchedTasksBuilder::new();

    let slot = Arc::new(GpadcSlot::new());
    let gate = Arc::new(PowerGate::new());

    let mut server = tide::new();
    web::register(
        &mut server,
        web::Api::new(slot.clone(), gate.clone(), &config.gpadc_params()),
    );
    web::serve(&mut wtb, server, &config.listen)?;

    // Attach right away instead of waiting for the first poll interval
    let watcher = ScuWatcher::new(config, slot, gate);
    watcher.update().await;
    watcher.spawn(&mut wtb)?;

    Ok(wtb)
}

#[async_std::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    info!("gpadcd {} starting", env!("VERSION_STRING"));

    let config = Config::load()?;

    // Show a nicer error message if something went wrong during the
    // initialization.
    let wtb = init(config).await.map_err(|e| {
        error!("Failed to initialize gpadcd: {e:#}");
        e
    })?;

    // Wait until any of the tasks exits (which should never happen)
    wtb.watch().await
}
