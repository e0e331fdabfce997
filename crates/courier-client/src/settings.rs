// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! Pipeline configuration loading.
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional configuration file (any format `config` understands, usually
//! TOML), then environment variables prefixed with `COURIER_`. Nested keys use
//! a double underscore:
//!
//! ```bash
//! export COURIER_GATEWAY__MAX_RETRIES=5
//! export COURIER_GATEWAY__TIMEOUT_MS=60000
//! export COURIER_UPLOADS__MAX_CONCURRENT_UPLOADS=4
//! ```

use crate::{Error, retry::RetryPolicy};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Settings for [`RequestGateway`][crate::RequestGateway].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL relative endpoints are resolved against.
    pub base_url: Option<String>,
    /// Deadline for a single exchange.
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay of the exponential backoff.
    pub retry_delay_ms: u64,
    /// Master switch for retries.
    pub retry_on_error: bool,
    /// Header carrying the anti-forgery token.
    pub csrf_header: String,
    pub user_agent: String,
    /// Offline queue capacity; the oldest request is evicted when full.
    /// Unbounded when unset.
    pub max_queue_len: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            base_url: None,
            timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            retry_on_error: true,
            csrf_header: "X-CSRF-Token".to_owned(),
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
            max_queue_len: None,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay())
            .with_retry_on_error(self.retry_on_error)
    }
}

/// Settings for [`UploadCoordinator`][crate::UploadCoordinator].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Upload target, absolute or relative to the gateway base URL.
    pub endpoint: String,
    /// Upper bound on tasks in the `uploading` state.
    pub max_concurrent_uploads: usize,
    /// How long completed tasks stay queryable before they are pruned.
    pub completed_retention_ms: u64,
    /// Multipart field carrying the file.
    pub field_name: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            endpoint: "/api/upload".to_owned(),
            max_concurrent_uploads: 3,
            completed_retention_ms: 5_000,
            field_name: "file".to_owned(),
        }
    }
}

impl UploadConfig {
    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }
}

/// Complete configuration of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gateway: GatewayConfig,
    pub uploads: UploadConfig,
}

impl PipelineConfig {
    /// Loads defaults, then `path` when given, then `COURIER_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        Self::build(path, environment())
    }

    /// Loads defaults overridden by `COURIER_*` variables only.
    pub fn from_env() -> Result<Self, Error> {
        Self::build(None, environment())
    }

    fn build(path: Option<&Path>, env: Environment) -> Result<Self, Error> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: PipelineConfig = builder.add_source(env).build()?.try_deserialize()?;

        if config.uploads.max_concurrent_uploads == 0 {
            return Err(Error::InvalidParameters(
                "uploads.max_concurrent_uploads must be at least 1".to_owned(),
            ));
        }
        Ok(config)
    }
}

fn environment() -> Environment {
    Environment::with_prefix("COURIER")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
