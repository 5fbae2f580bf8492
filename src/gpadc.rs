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

use std::sync::MutexGuard;

use anyhow::{Context, Result};
use async_std::sync::Arc;
use log::info;
use serde::Serialize;

use crate::measurement::Sample;
use crate::pmic::{InterruptLine, Resources};

mod irq;
pub mod regmap;
mod sampler;

pub use irq::IrqAction;
pub use regmap::{find_channel, ChannelKind};
pub use sampler::{SampleError, Timing};

use irq::DeferredWorker;
use regmap::{CHANNELS, CONSUMERS};
use sampler::Sampler;

/// Per hardware variant parameters of the GPADC
#[derive(Debug, Clone, Copy)]
pub struct Params {
    pub realbits: u8,
    pub consumer_map: bool,
    pub timing: Timing,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    pub device: &'static str,
    pub channel: &'static str,
}

#[derive(Serialize, Debug, Clone)]
pub struct CatalogEntry {
    pub index: usize,
    pub name: &'static str,
    pub datasheet_name: &'static str,
    pub kind: ChannelKind,
    pub realbits: u8,
    pub consumers: Vec<Consumer>,
}

/// The channels this GPADC provides and who consumes them
#[derive(Serialize, Debug, Clone)]
#[serde(transparent)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(params: &Params) -> Self {
        let entries = CHANNELS
            .iter()
            .enumerate()
            .map(|(index, ch)| {
                let consumers = CONSUMERS
                    .iter()
                    .filter(|_| params.consumer_map)
                    .filter(|m| m.adc_channel_label == ch.datasheet_name)
                    .map(|m| Consumer {
                        device: m.consumer_dev_name,
                        channel: m.consumer_channel,
                    })
                    .collect();

                CatalogEntry {
                    index,
                    name: ch.name,
                    datasheet_name: ch.datasheet_name,
                    kind: ch.kind,
                    realbits: params.realbits,
                    consumers,
                }
            })
            .collect();

        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Resolve a channel by name or datasheet label
    pub fn channel(&self, name: &str) -> Option<&CatalogEntry> {
        find_channel(name).and_then(|idx| self.entries.get(idx))
    }

    /// Resolve the channel a consumer device knows under `channel`
    pub fn consumer(&self, device: &str, channel: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| {
            entry
                .consumers
                .iter()
                .any(|c| c.device == device && c.channel == channel)
        })
    }
}

/// Holding this keeps the GPADC suspended. No conversion can start until
/// it is dropped.
pub struct SuspendGuard<'a> {
    _lock: MutexGuard<'a, ()>,
}

/// An attached Basin Cove GPADC
pub struct Gpadc {
    sampler: Arc<Sampler>,
    irq_line: Box<dyn InterruptLine>,
    irq: u32,
    worker: Option<DeferredWorker>,
    catalog: Catalog,
}

impl Gpadc {
    pub fn attach(resources: Resources, params: &Params) -> Result<Self> {
        let Resources {
            regs,
            irq_line,
            irq,
        } = resources;

        let sampler = Arc::new(Sampler::new(regs, params.timing, params.realbits));

        // Start out with all ADC interrupts disabled, requests only enable
        // them while they wait for a conversion.
        sampler
            .mask_irqs()
            .context("Failed to mask GPADC interrupts")?;

        let mut worker = DeferredWorker::spawn(sampler.clone())?;
        let action = IrqAction::new(sampler.completion(), worker.queue());

        if let Err(e) = irq_line.request(action) {
            worker.stop();
            return Err(e.context(format!("Unable to register irq {irq}")));
        }

        info!(
            "Basin Cove GPADC attached (irq {}, {} bit samples)",
            irq, params.realbits
        );

        Ok(Self {
            sampler,
            irq_line,
            irq,
            worker: Some(worker),
            catalog: Catalog::new(params),
        })
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn realbits(&self) -> u8 {
        self.sampler.realbits()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Perform a conversion and return the raw value
    pub fn read_raw(&self, channel: usize) -> Result<u16, SampleError> {
        self.sampler.read_channel(channel)
    }

    /// Perform a conversion and return a timestamped sample
    pub fn read(&self, channel: usize) -> Result<Sample, SampleError> {
        let raw = self.read_raw(channel)?;
        let name = CHANNELS[channel].name;

        Ok(Sample::now(name, raw))
    }

    /// Wait for a running conversion to finish and keep the GPADC idle
    /// until the returned guard is dropped.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        SuspendGuard {
            _lock: self.sampler.lock(),
        }
    }

    fn teardown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            self.irq_line.free();
            worker.stop();

            info!("Basin Cove GPADC detached (irq {})", self.irq);
        }
    }

    pub fn detach(mut self) {
        self.teardown()
    }
}

impl Drop for Gpadc {
    fn drop(&mut self) {
        self.teardown()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use async_std::sync::Arc;

    use super::regmap::regs;
    use super::{irq::WORKER_THREAD_NAME, Catalog, Consumer, Gpadc, Params, Timing};
    use crate::pmic::SimPmic;

    fn params(realbits: u8, consumer_map: bool) -> Params {
        Params {
            realbits,
            consumer_map,
            timing: Timing {
                busy_poll_interval: Duration::from_micros(10),
                busy_poll_budget: 500,
                completion_timeout: Duration::from_millis(200),
            },
        }
    }

    #[test]
    fn attach_read_detach() {
        let pmic = SimPmic::new();
        pmic.set_result(0, 0x021A);

        let gpadc = Gpadc::attach(pmic.resources(42), &params(11, true)).unwrap();

        assert!(pmic.irq_requested());
        assert_eq!(gpadc.irq(), 42);
        assert_eq!(pmic.register(regs::MADCIRQ), regs::ADCIRQ_ALL);
        assert_eq!(pmic.register(regs::MIRQLVL1), regs::MIRQLVL1_ADC);

        let sample = gpadc.read(0).unwrap();
        assert_eq!(sample.raw, 0x021A);
        assert_eq!(sample.channel, "VBAT");

        gpadc.detach();

        assert!(!pmic.irq_requested());

        // Once detached all queued acknowledgements have been processed
        let acks = pmic
            .trace()
            .iter()
            .filter(|op| op.thread_name.as_deref() == Some(WORKER_THREAD_NAME))
            .filter(|op| op.is_update(regs::MIRQLVL1, 0, regs::MIRQLVL1_ADC))
            .count();

        assert_eq!(acks, 1);
        assert_eq!(pmic.register(regs::MIRQLVL1), regs::MIRQLVL1_ADC);
    }

    #[test]
    fn attach_fails_without_irq() {
        let pmic = SimPmic::new();
        pmic.refuse_irq(true);

        let err = Gpadc::attach(pmic.resources(7), &params(11, true))
            .err()
            .unwrap();

        assert!(format!("{err:#}").contains("Unable to register irq 7"));
        assert!(!pmic.irq_requested());
    }

    #[test]
    fn attach_fails_without_registers() {
        let pmic = SimPmic::new();
        pmic.fail_register(Some(regs::MIRQLVL1));

        assert!(Gpadc::attach(pmic.resources(7), &params(11, true)).is_err());
        assert!(!pmic.irq_requested());
    }

    #[test]
    fn drop_detaches() {
        let pmic = SimPmic::new();

        {
            let _gpadc = Gpadc::attach(pmic.resources(1), &params(10, false)).unwrap();
            assert!(pmic.irq_requested());
        }

        assert!(!pmic.irq_requested());
    }

    #[test]
    fn suspend_blocks_reads() {
        let pmic = SimPmic::new();
        pmic.set_result(4, 0x0200);

        let gpadc = Arc::new(Gpadc::attach(pmic.resources(1), &params(11, true)).unwrap());

        let reader = {
            let guard = gpadc.suspend();

            let gpadc = gpadc.clone();
            let reader = thread::spawn(move || {
                let start = Instant::now();
                let raw = gpadc.read_raw(4).unwrap();
                (raw, start.elapsed())
            });

            thread::sleep(Duration::from_millis(200));

            // Nothing may have happened while suspended
            assert!(!pmic.trace().iter().any(|op| op.writes(regs::GPADCREQ)));

            drop(guard);
            reader
        };

        let (raw, elapsed) = reader.join().unwrap();

        assert_eq!(raw, 0x0200);
        assert!(elapsed >= Duration::from_millis(150));
    }

    #[test]
    fn catalog_fan_out() {
        let catalog = Catalog::new(&params(11, true));

        assert_eq!(catalog.entries().len(), 9);

        let systemp0 = catalog.channel("CH6").unwrap();
        assert_eq!(systemp0.name, "SYSTEMP0");
        assert_eq!(
            systemp0.consumers,
            [
                Consumer {
                    device: "SYSTEMP",
                    channel: "SYSTEMP0"
                },
                Consumer {
                    device: "bcove_thrm",
                    channel: "SYSTEMP0"
                },
            ]
        );

        // The same hardware channel under both consumer names
        assert_eq!(catalog.consumer("SYSTEMP", "SYSTEMP0").unwrap().index, 6);
        assert_eq!(catalog.consumer("bcove_thrm", "SYSTEMP0").unwrap().index, 6);
        assert_eq!(catalog.consumer("bcove_thrm", "PMICTEMP").unwrap().index, 3);
        assert_eq!(catalog.consumer("VIBAT", "IBAT").unwrap().index, 2);
        assert!(catalog.consumer("bcove_thrm", "VBAT").is_none());
    }

    #[test]
    fn catalog_without_consumer_map() {
        let catalog = Catalog::new(&params(10, false));

        assert!(catalog.entries().iter().all(|e| e.consumers.is_empty()));
        assert!(catalog.entries().iter().all(|e| e.realbits == 10));
        assert!(catalog.consumer("SYSTEMP", "SYSTEMP0").is_none());
        assert_eq!(catalog.channel("vbat").unwrap().index, 0);
    }
}
