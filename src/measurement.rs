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

use std::time::{Instant, SystemTime};

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy)]
pub struct Timestamp(Instant);

/// A raw GPADC conversion result and when it was taken
#[derive(Serialize, Debug, Clone, Copy)]
pub struct Sample {
    pub ts: Timestamp,
    pub channel: &'static str,
    pub raw: u16,
}

impl Sample {
    pub fn now(channel: &'static str, raw: u16) -> Self {
        Self {
            ts: Timestamp::now(),
            channel,
            raw,
        }
    }
}

impl Timestamp {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Represent a Timestamp in system time
    /// Since Instants use a monotonic clock that is not actually related to the
    /// system clock this is a somewhat handwavey process.
    ///
    /// The idea is to take the current Instant (monotonic time) and System Time
    /// (calendar time) and calculate: now_system - (now_instant - ts_instant).
    pub fn in_system_time(&self) -> SystemTime {
        let now = SystemTime::now();
        now.checked_sub(self.0.elapsed()).unwrap_or(now)
    }
}

impl Serialize for Timestamp {
    /// Serialize an Instant as a javascript timestamp (f64 containing the number
    /// of milliseconds since Unix Epoch 0).
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let timestamp = self
            .in_system_time()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();

        let js_timestamp = 1000.0 * timestamp.as_secs_f64();
        js_timestamp.serialize(serializer)
    }
}
