// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide tracing setup.
//!
//! Filters come from the `IDBROKER_LOG` environment variable (same syntax as
//! `RUST_LOG`), defaulting to `info`. Setting `IDBROKER_LOG_JSONL=1` switches
//! the output from human-readable lines to JSONL.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "IDBROKER_LOG";

/// Default log level.
const DEFAULT_FILTER: &str = "info";

/// ENV switching output to JSONL when set to `1`.
const JSONL_ENV: &str = "IDBROKER_LOG_JSONL";

static INIT: Once = Once::new();

/// Install the global tracing subscriber. Later calls, and calls made after
/// the host application installed its own subscriber, are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);
        if jsonl {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init();
        } else {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init();
        }
    });
}
