// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use tcc_types::errors::GenericError;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(GenericError),
}

/// A lease held under a key by whoever presents the matching token.
///
/// Acquiring with the token of the current holder renews the lease. Releasing with a token
/// that does not hold the lease is a no-op and returns `false`.
#[async_trait::async_trait]
pub trait LeaseLock: Send + Sync + 'static {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Process-local [`LeaseLock`] driven by the tokio clock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseLock {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLeaseLock {
    /// The token currently holding `key`, if the lease has not expired.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.leases
            .lock()
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.token.clone())
    }
}

#[async_trait::async_trait]
impl LeaseLock for InMemoryLeaseLock {
    #[instrument(level = "trace", skip(self), err)]
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(key) {
            Some(lease) if lease.expires_at > now && lease.token != token => Ok(false),
            Some(lease) if lease.token == token => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => {
                debug!(key, token, "lease granted");
                leases.insert(
                    key.to_owned(),
                    Lease {
                        token: token.to_owned(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut leases = self.leases.lock();
        match leases.get(key) {
            Some(lease) if lease.token == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;
    use test_log::test;

    const KEY: &str = "TCC:LOCK_RUN:1";

    #[test(tokio::test(start_paused = true))]
    async fn foreign_token_waits_for_expiry() -> anyhow::Result<()> {
        let lock = InMemoryLeaseLock::default();
        assert_that!(lock.acquire(KEY, "a", Duration::from_secs(60)).await?, eq(true));
        assert_that!(lock.acquire(KEY, "b", Duration::from_secs(60)).await?, eq(false));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_that!(lock.acquire(KEY, "b", Duration::from_secs(60)).await?, eq(true));
        assert_eq!(lock.holder(KEY).as_deref(), Some("b"));
        Ok(())
    }

    #[test(tokio::test(start_paused = true))]
    async fn holder_renews_its_lease() -> anyhow::Result<()> {
        let lock = InMemoryLeaseLock::default();
        lock.acquire(KEY, "a", Duration::from_secs(10)).await?;
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_that!(lock.acquire(KEY, "a", Duration::from_secs(10)).await?, eq(true));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_that!(lock.acquire(KEY, "b", Duration::from_secs(10)).await?, eq(false));
        Ok(())
    }

    #[test(tokio::test(start_paused = true))]
    async fn stale_release_is_rejected() -> anyhow::Result<()> {
        let lock = InMemoryLeaseLock::default();
        lock.acquire(KEY, "a", Duration::from_secs(10)).await?;
        tokio::time::advance(Duration::from_secs(11)).await;
        lock.acquire(KEY, "b", Duration::from_secs(10)).await?;

        // "a" lost the lease while it was away
        assert_that!(lock.release(KEY, "a").await?, eq(false));
        assert_eq!(lock.holder(KEY).as_deref(), Some("b"));
        assert_that!(lock.release(KEY, "b").await?, eq(true));
        assert_eq!(lock.holder(KEY), None);
        Ok(())
    }
}
