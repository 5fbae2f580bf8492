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

use std::env::var_os;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::gpadc::{Params, Timing};

#[cfg(feature = "demo_mode")]
const CONFIG_PATH: &str = "demo_files/etc/gpadcd/config.json";

#[cfg(not(feature = "demo_mode"))]
const CONFIG_PATH: &str = "/etc/gpadcd/config.json";

const CONFIG_PATH_ENV: &str = "GPADCD_CONFIG";

/// The GPADC exists in two variants. The first one delivers 10 bit samples
/// and does not route its channels to other drivers, the second one has an
/// additional bit of resolution and feeds the battery and thermal drivers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HardwareGeneration {
    Gen1,
    Gen2,
}

impl HardwareGeneration {
    fn realbits(&self) -> u8 {
        match self {
            Self::Gen1 => 10,
            Self::Gen2 => 11,
        }
    }

    fn consumer_map(&self) -> bool {
        match self {
            Self::Gen1 => false,
            Self::Gen2 => true,
        }
    }

    // Both generations share the polling and timeout constants, the config
    // file can override them per board.
    fn timing(&self) -> Timing {
        match self {
            Self::Gen1 | Self::Gen2 => Timing::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub format_version: u64,
    pub hardware_generation: HardwareGeneration,
    /// Overrides the sample width implied by the hardware generation
    pub realbits: Option<u8>,
    /// Overrides whether channels are routed to consumer drivers
    pub consumer_map: Option<bool>,
    /// Override the time between two polls of the busy flag
    pub busy_poll_interval_us: Option<u64>,
    /// Override how often the busy flag is polled before giving up
    pub busy_poll_budget: Option<u32>,
    /// Override how long to wait for the conversion complete interrupt
    pub completion_timeout_ms: Option<u64>,
    pub register_device: PathBuf,
    /// Name of the GPIO line the PMIC interrupt is connected to
    pub irq_line: String,
    pub irq: u32,
    pub listen: Vec<String>,
    pub scu_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format_version: 1,
            hardware_generation: HardwareGeneration::Gen2,
            realbits: None,
            consumer_map: None,
            busy_poll_interval_us: None,
            busy_poll_budget: None,
            completion_timeout_ms: None,
            register_device: PathBuf::from("/dev/bcove_pmic"),
            irq_line: "PMIC_IRQ".to_string(),
            irq: 0,
            listen: vec!["[::]:8080".to_string()],
            scu_poll_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load the config from the path in `$GPADCD_CONFIG` or the default
    /// location.
    pub fn load() -> Result<Self> {
        let path = var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));

        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            info!(
                "Config file at \"{}\" does not exist. Using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let mut content = String::new();

        File::open(path)
            .and_then(|mut fd| fd.read_to_string(&mut content))
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;

        if config.format_version != 1 {
            bail!("Unknown config file version: {}", config.format_version);
        }

        let realbits = config.realbits();
        if !(1..=16).contains(&realbits) {
            bail!("Samples can not be {} bits wide", realbits);
        }

        if config.busy_poll_budget == Some(0) {
            bail!("The busy poll budget must not be zero");
        }

        if config.completion_timeout_ms == Some(0) {
            bail!("The completion timeout must not be zero");
        }

        if config.scu_poll_interval_ms == 0 {
            bail!("The SCU poll interval must not be zero");
        }

        Ok(config)
    }

    pub fn realbits(&self) -> u8 {
        self.realbits
            .unwrap_or_else(|| self.hardware_generation.realbits())
    }

    pub fn timing(&self) -> Timing {
        let defaults = self.hardware_generation.timing();

        Timing {
            busy_poll_interval: self
                .busy_poll_interval_us
                .map_or(defaults.busy_poll_interval, Duration::from_micros),
            busy_poll_budget: self
                .busy_poll_budget
                .unwrap_or(defaults.busy_poll_budget),
            completion_timeout: self
                .completion_timeout_ms
                .map_or(defaults.completion_timeout, Duration::from_millis),
        }
    }

    pub fn gpadc_params(&self) -> Params {
        Params {
            realbits: self.realbits(),
            consumer_map: self
                .consumer_map
                .unwrap_or_else(|| self.hardware_generation.consumer_map()),
            timing: self.timing(),
        }
    }

    pub fn scu_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scu_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::{Config, HardwareGeneration};

    #[test]
    fn defaults() {
        let config = Config::from_json("{}").unwrap();
        let params = config.gpadc_params();

        assert_eq!(config.hardware_generation, HardwareGeneration::Gen2);
        assert_eq!(params.realbits, 11);
        assert!(params.consumer_map);
        assert_eq!(params.timing.busy_poll_budget, 500);
    }

    #[test]
    fn generation_and_overrides() {
        let config = Config::from_json(r#"{ "hardware_generation": "gen1" }"#).unwrap();
        let params = config.gpadc_params();
        assert_eq!(params.realbits, 10);
        assert!(!params.consumer_map);

        let config = Config::from_json(
            r#"{
                "hardware_generation": "gen1",
                "realbits": 11,
                "consumer_map": true,
                "irq": 23,
                "listen": ["127.0.0.1:9000"]
            }"#,
        )
        .unwrap();

        let params = config.gpadc_params();
        assert_eq!(params.realbits, 11);
        assert!(params.consumer_map);
        assert_eq!(config.irq, 23);
        assert_eq!(config.listen, ["127.0.0.1:9000"]);
    }

    #[test]
    fn timing_overrides() {
        let params = Config::from_json(r#"{ "hardware_generation": "gen1" }"#)
            .unwrap()
            .gpadc_params();

        assert_eq!(params.timing.busy_poll_interval, Duration::from_micros(1800));
        assert_eq!(params.timing.busy_poll_budget, 500);
        assert_eq!(params.timing.completion_timeout, Duration::from_secs(1));

        let params = Config::from_json(
            r#"{
                "busy_poll_interval_us": 2000,
                "busy_poll_budget": 250,
                "completion_timeout_ms": 2500
            }"#,
        )
        .unwrap()
        .gpadc_params();

        assert_eq!(params.timing.busy_poll_interval, Duration::from_micros(2000));
        assert_eq!(params.timing.busy_poll_budget, 250);
        assert_eq!(params.timing.completion_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(Config::from_json(r#"{ "format_version": 2 }"#).is_err());
        assert!(Config::from_json(r#"{ "realbits": 17 }"#).is_err());
        assert!(Config::from_json(r#"{ "realbits": 0 }"#).is_err());
        assert!(Config::from_json(r#"{ "scu_poll_interval_ms": 0 }"#).is_err());
        assert!(Config::from_json(r#"{ "busy_poll_budget": 0 }"#).is_err());
        assert!(Config::from_json(r#"{ "completion_timeout_ms": 0 }"#).is_err());
        assert!(Config::from_json(r#"{ "hardware_generation": "gen3" }"#).is_err());
        assert!(Config::from_json(r#"{ "no_such_key": true }"#).is_err());
        assert!(Config::from_json("[]").is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = Config::from_file(Path::new("/nonexistent/gpadcd/config.json")).unwrap();
        assert_eq!(config.realbits(), 11);
        assert_eq!(config.scu_poll_interval().as_millis(), 1000);
    }
}
