// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Scheduling decisions are emitted as `tracing` events under the
//! `dynamo_fair_scheduler` target. Filters come from the `DYN_LOG` environment
//! variable, e.g. `DYN_LOG=dynamo_fair_scheduler=debug` shows per-tick batch
//! composition and evictions.

use std::sync::Once;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "DYN_LOG";

static INIT: Once = Once::new();

/// Initialize the logger. Later calls are no-ops.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    let l = fmt::layer()
        .event_format(fmt::format().compact())
        .with_writer(std::io::stderr)
        .with_filter(filter_layer);

    // A host application may already own the global subscriber.
    let _ = tracing_subscriber::registry().with(l).try_init();
}
