// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection and timing settings.
//!
//! Settings are loaded from three layers, strongest last: serde defaults, an
//! optional TOML file pointed to by `IDBROKER_CONFIG_PATH`, and `IDBROKER_*`
//! environment variables.

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::{ErrorContext, Result};

/// ENV pointing at an optional TOML settings file.
const CONFIG_PATH_ENV: &str = "IDBROKER_CONFIG_PATH";

/// Prefix of settings environment variables.
const ENV_PREFIX: &str = "IDBROKER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// etcd endpoints the store backend connects to.
    pub endpoints: Vec<String>,

    /// Seconds the session lease survives without renewal. Slave records
    /// bound to the lease disappear when it expires.
    pub lease_ttl_secs: u64,

    /// Seconds between master record re-assertion rounds.
    pub periodic_sync_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            lease_ttl_secs: 900,
            periodic_sync_secs: 300,
        }
    }
}

impl Settings {
    pub fn from_settings() -> Result<Settings> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("unable to load settings")
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn periodic_sync(&self) -> Duration {
        Duration::from_secs(self.periodic_sync_secs)
    }
}
