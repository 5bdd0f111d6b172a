// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use igt_metadata::VERSION_PREFIX;

/// Returns the version line printed at the start of a run, e.g.
/// `IGT-Version: 0.1.0 (x86_64) (Linux: 6.8.0 x86_64)`.
pub fn version_line() -> String {
    let arch = std::env::consts::ARCH;
    let version = env!("CARGO_PKG_VERSION");
    match nix::sys::utsname::uname() {
        Ok(uts) => format!(
            "{VERSION_PREFIX}{version} ({arch}) ({}: {} {})",
            uts.sysname().to_string_lossy(),
            uts.release().to_string_lossy(),
            uts.machine().to_string_lossy(),
        ),
        Err(_) => format!("{VERSION_PREFIX}{version} ({arch})"),
    }
}
