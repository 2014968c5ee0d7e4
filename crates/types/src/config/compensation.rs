// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// # Compensation worker options
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case")]
pub struct CompensationOptions {
    /// # Lock pool
    ///
    /// Name of the pool backing the lease lock.
    pub redis_pool: String,

    /// # Application name
    ///
    /// Workers of the same application compete for the same lease.
    pub app_name: String,

    /// # Lease TTL
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    lease_ttl: humantime::Duration,

    /// # History retention
    ///
    /// Successful rows older than this are purged.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    history_retention: humantime::Duration,

    /// # Quiet period
    ///
    /// Waiting Confirm/Cancel rows untouched for this long are considered stuck.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    quiet_period: humantime::Duration,

    /// # Backoff while leading
    ///
    /// Random pause after a cycle, before the lease is released.
    held_backoff: BackoffRange,

    /// # Backoff between attempts
    ///
    /// Random pause before the next attempt to acquire the lease.
    idle_backoff: BackoffRange,
}

impl CompensationOptions {
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl.into()
    }

    pub fn history_retention(&self) -> Duration {
        self.history_retention.into()
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period.into()
    }

    pub fn held_backoff(&self) -> &BackoffRange {
        &self.held_backoff
    }

    pub fn idle_backoff(&self) -> &BackoffRange {
        &self.idle_backoff
    }
}

impl Default for CompensationOptions {
    fn default() -> Self {
        Self {
            redis_pool: "default".to_owned(),
            app_name: "tcc".to_owned(),
            lease_ttl: Duration::from_secs(60).into(),
            history_retention: Duration::from_secs(4 * 60 * 60).into(),
            quiet_period: Duration::from_secs(60).into(),
            held_backoff: BackoffRange::new(Duration::from_secs(2), Duration::from_secs(5)),
            idle_backoff: BackoffRange::new(Duration::from_secs(1), Duration::from_secs(3)),
        }
    }
}

/// Inclusive range a random pause is drawn from.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackoffRange {
    #[serde_as(as = "serde_with::DisplayFromStr")]
    min: humantime::Duration,
    #[serde_as(as = "serde_with::DisplayFromStr")]
    max: humantime::Duration,
}

impl BackoffRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    pub fn min(&self) -> Duration {
        self.min.into()
    }

    pub fn max(&self) -> Duration {
        self.max.into()
    }
}
