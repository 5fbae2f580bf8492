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
use std::process::Command;

use chrono::prelude::Utc;

/// Run a command in the crate directory and return its trimmed stdout,
/// or None if it could not be run or did not succeed.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let dir = var_os("CARGO_MANIFEST_DIR")?;

    let output = Command::new(program)
        .args(args)
        .current_dir(&dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Generates a version string
/// `gpadcd 0.1.0 (b9ff258-dirty @ 2024-11-05 14:13:49) with rustc 1.80.0`
///
/// Builds from a tarball have no git metadata, in which case the commit
/// is reported as "unknown".
fn generate_version_string() {
    let git_hash = command_output("git", &["describe", "--always", "--dirty=-dirty"])
        .unwrap_or_else(|| "unknown".to_string());

    let rustc_version =
        command_output("rustc", &["-V"]).unwrap_or_else(|| "unknown rustc".to_string());

    println!(
        "cargo:rustc-env=VERSION_STRING={} {} ({} @ {}) with {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        git_hash,
        Utc::now().format("%Y-%m-%d %T"),
        rustc_version
    )
}

fn main() {
    generate_version_string();
}
