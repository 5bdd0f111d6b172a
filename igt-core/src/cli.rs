// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;

/// Options accepted by every test binary.
#[derive(Clone, Debug, Default, Parser)]
#[command(version, about = None, long_about = None)]
pub struct TestArgs {
    /// List the subtests of this binary, one per line, and exit.
    #[arg(long)]
    pub list_subtests: bool,

    /// Print the description of each subtest matching PATTERN (default: all) and exit.
    #[arg(
        long,
        value_name = "PATTERN",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "*"
    )]
    pub describe: Option<String>,

    /// Run only the subtests matching the comma-separated wildcard PATTERN.
    #[arg(long, value_name = "PATTERN")]
    pub run_subtest: Option<String>,

    /// Run only the dynamic subtests matching the comma-separated wildcard PATTERN.
    #[arg(long, value_name = "PATTERN")]
    pub dynamic_subtest: Option<String>,

    /// Print the description of this binary and exit.
    #[arg(long)]
    pub help_description: bool,

    /// Print debug output, for DOMAIN only if given.
    #[arg(
        long,
        value_name = "DOMAIN",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "all"
    )]
    pub debug: Option<String>,

    /// Stop and wait for a key press at debug points, for DOMAIN only if given.
    #[arg(
        long,
        value_name = "DOMAIN",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "all"
    )]
    pub interactive_debug: Option<String>,

    /// Don't compare CRCs; only collect them.
    #[arg(long)]
    pub skip_crc_compare: bool,

    /// Dump a kernel trace when an oops is detected.
    #[arg(long)]
    pub trace_on_oops: bool,

    /// Use the device matching FILTER.
    #[arg(long, value_name = "FILTER")]
    pub device: Option<String>,
}
