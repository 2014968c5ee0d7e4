// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod compensation;
mod transaction;

pub use compensation::*;
pub use transaction::*;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfigurationError {
    #[error("max-retry must be at least 1")]
    ZeroMaxRetry,
    #[error("db-pool must not be empty")]
    EmptyDbPool,
    #[error("compensation.lease-ttl must be greater than zero")]
    ZeroLeaseTtl,
    #[error("compensation.{name}: min {min:?} is greater than max {max:?}")]
    InvertedBackoff {
        name: &'static str,
        min: std::time::Duration,
        max: std::time::Duration,
    },
}

/// # TCC configuration
///
/// The transaction options live at the top level, the compensation worker options under
/// `compensation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default)]
#[serde(rename_all = "kebab-case")]
pub struct Configuration {
    #[serde(flatten)]
    pub transaction: TransactionOptions,
    pub compensation: CompensationOptions,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        if self.transaction.max_retry == 0 {
            return Err(InvalidConfigurationError::ZeroMaxRetry);
        }
        if self.transaction.db_pool.is_empty() {
            return Err(InvalidConfigurationError::EmptyDbPool);
        }
        if self.compensation.lease_ttl().is_zero() {
            return Err(InvalidConfigurationError::ZeroLeaseTtl);
        }
        for (name, range) in [
            ("held-backoff", self.compensation.held_backoff()),
            ("idle-backoff", self.compensation.idle_backoff()),
        ] {
            if range.min() > range.max() {
                return Err(InvalidConfigurationError::InvertedBackoff {
                    name,
                    min: range.min(),
                    max: range.max(),
                });
            }
        }
        Ok(())
    }
}
