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

/// # Transaction options
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionOptions {
    /// # Invocation log pool
    ///
    /// Connection pool holding the invocation log. It always takes part in the local
    /// transaction of a coordinator.
    pub db_pool: String,

    /// # Max retry
    ///
    /// Number of attempts after which a Confirm/Cancel invocation becomes terminally failed.
    pub max_retry: u32,

    /// # Try timeout
    ///
    /// Age in seconds after which a successful Try without a Confirm or Cancel is cancelled by
    /// the compensation worker.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    try_timeout_cancel: Duration,
}

impl TransactionOptions {
    pub fn try_timeout_cancel(&self) -> Duration {
        self.try_timeout_cancel
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            db_pool: "default".to_owned(),
            max_retry: 5,
            try_timeout_cancel: Duration::from_secs(120),
        }
    }
}
