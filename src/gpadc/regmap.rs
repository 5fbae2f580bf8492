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

use serde::Serialize;

/// Basin Cove PMIC register addresses and bits used by the GPADC
pub mod regs {
    /// Latched ADC interrupt sources
    pub const ADCIRQ: u8 = 0x06;
    /// Per-source ADC interrupt mask, same bit layout as ADCIRQ
    pub const MADCIRQ: u8 = 0x11;

    pub const ADCIRQ_BATTEMP: u8 = 1 << 2;
    pub const ADCIRQ_SYSTEMP: u8 = 1 << 3;
    pub const ADCIRQ_BATT: u8 = 1 << 4;
    pub const ADCIRQ_VIBATT: u8 = 1 << 5;
    pub const ADCIRQ_CCTICK: u8 = 1 << 7;

    /// Every ADC interrupt class a conversion request may end up signalling
    pub const ADCIRQ_ALL: u8 =
        ADCIRQ_BATTEMP | ADCIRQ_SYSTEMP | ADCIRQ_BATT | ADCIRQ_VIBATT | ADCIRQ_CCTICK;

    /// First level interrupt mask
    pub const MIRQLVL1: u8 = 0x0C;
    pub const MIRQLVL1_ADC: u8 = 1 << 4;

    /// Conversion request and status register
    pub const GPADCREQ: u8 = 0xDC;
    pub const GPADCREQ_BUSY: u8 = 1 << 0;
    pub const GPADCREQ_IRQEN: u8 = 1 << 1;
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Voltage,
    Resistance,
    Current,
    Temperature,
}

pub struct ChannelDesc {
    pub name: &'static str,
    pub datasheet_name: &'static str,
    pub kind: ChannelKind,
    /// Conversion control bit in GPADCREQ. Channels that share a bit are
    /// converted together.
    pub control: u8,
    pub addr_hi: u8,
    pub addr_lo: u8,
}

impl ChannelDesc {
    /// The GPADCREQ value that starts a conversion for this channel and
    /// raises an interrupt once it is done.
    pub fn request(&self) -> u8 {
        regs::GPADCREQ_IRQEN | (1 << self.control)
    }
}

// The order matches the hardware channel numbering, the position in this
// list is the channel index used everywhere else.
pub const CHANNELS: &[ChannelDesc] = &[
    ChannelDesc {
        name: "VBAT",
        datasheet_name: "CH0",
        kind: ChannelKind::Voltage,
        control: 5,
        addr_hi: 0xE9,
        addr_lo: 0xEA,
    },
    ChannelDesc {
        name: "BATID",
        datasheet_name: "CH1",
        kind: ChannelKind::Resistance,
        control: 4,
        addr_hi: 0xEB,
        addr_lo: 0xEC,
    },
    ChannelDesc {
        name: "IBAT",
        datasheet_name: "CH2",
        kind: ChannelKind::Current,
        control: 5,
        addr_hi: 0xED,
        addr_lo: 0xEE,
    },
    ChannelDesc {
        name: "PMICTEMP",
        datasheet_name: "CH3",
        kind: ChannelKind::Temperature,
        control: 3,
        addr_hi: 0xCC,
        addr_lo: 0xCD,
    },
    ChannelDesc {
        name: "BATTEMP0",
        datasheet_name: "CH4",
        kind: ChannelKind::Temperature,
        control: 2,
        addr_hi: 0xC8,
        addr_lo: 0xC9,
    },
    ChannelDesc {
        name: "BATTEMP1",
        datasheet_name: "CH5",
        kind: ChannelKind::Temperature,
        control: 2,
        addr_hi: 0xCA,
        addr_lo: 0xCB,
    },
    ChannelDesc {
        name: "SYSTEMP0",
        datasheet_name: "CH6",
        kind: ChannelKind::Temperature,
        control: 3,
        addr_hi: 0xC2,
        addr_lo: 0xC3,
    },
    ChannelDesc {
        name: "SYSTEMP1",
        datasheet_name: "CH7",
        kind: ChannelKind::Temperature,
        control: 3,
        addr_hi: 0xC4,
        addr_lo: 0xC5,
    },
    ChannelDesc {
        name: "SYSTEMP2",
        datasheet_name: "CH8",
        kind: ChannelKind::Temperature,
        control: 3,
        addr_hi: 0xC6,
        addr_lo: 0xC7,
    },
];

/// Routes an ADC channel (by datasheet label) to a named consumer.
pub struct ConsumerMapping {
    pub adc_channel_label: &'static str,
    pub consumer_dev_name: &'static str,
    pub consumer_channel: &'static str,
}

macro_rules! consumer {
    ($label:expr, $dev:expr, $channel:expr) => {
        ConsumerMapping {
            adc_channel_label: $label,
            consumer_dev_name: $dev,
            consumer_channel: $channel,
        }
    };
}

// The temperature channels are consumed by their direct drivers and by the
// board thermal driver at the same time.
pub const CONSUMERS: &[ConsumerMapping] = &[
    consumer!("CH0", "VIBAT", "VBAT"),
    consumer!("CH1", "BATID", "BATID"),
    consumer!("CH2", "VIBAT", "IBAT"),
    consumer!("CH3", "PMICTEMP", "PMICTEMP"),
    consumer!("CH4", "BATTEMP", "BATTEMP0"),
    consumer!("CH5", "BATTEMP", "BATTEMP1"),
    consumer!("CH6", "SYSTEMP", "SYSTEMP0"),
    consumer!("CH7", "SYSTEMP", "SYSTEMP1"),
    consumer!("CH8", "SYSTEMP", "SYSTEMP2"),
    consumer!("CH6", "bcove_thrm", "SYSTEMP0"),
    consumer!("CH7", "bcove_thrm", "SYSTEMP1"),
    consumer!("CH8", "bcove_thrm", "SYSTEMP2"),
    consumer!("CH3", "bcove_thrm", "PMICTEMP"),
];

/// Find a channel index by its symbolic name ("VBAT") or its datasheet
/// label ("CH0"). Names are matched case-insensitively.
pub fn find_channel(name: &str) -> Option<usize> {
    CHANNELS.iter().position(|ch| {
        ch.name.eq_ignore_ascii_case(name) || ch.datasheet_name.eq_ignore_ascii_case(name)
    })
}
