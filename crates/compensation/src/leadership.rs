// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;
use xxhash_rust::xxh3::xxh3_64;

use tcc_core::LeaseLock;

/// Lock key shared by every worker of `app_name`.
pub fn lock_key(app_name: &str) -> String {
    format!("TCC:LOCK_RUN:{:016x}", xxh3_64(app_name.as_bytes()))
}

/// A token unique to this worker instance: `<hostname>-<pid>-<ulid>`.
pub fn lease_token() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());
    format!("{host}-{}-{}", std::process::id(), Ulid::new())
}

/// The compensation lease as seen by one worker.
///
/// Lock backend errors are logged and treated as not holding the lease.
pub struct Leadership {
    lock: Arc<dyn LeaseLock>,
    key: String,
    token: String,
    ttl: Duration,
    held: bool,
}

impl Leadership {
    pub fn new(lock: Arc<dyn LeaseLock>, app_name: &str, ttl: Duration) -> Self {
        Self::with_token(lock, app_name, lease_token(), ttl)
    }

    pub fn with_token(
        lock: Arc<dyn LeaseLock>,
        app_name: &str,
        token: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            lock,
            key: lock_key(app_name),
            token: token.into(),
            ttl,
            held: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Acquires or renews the lease.
    pub async fn acquire(&mut self) -> bool {
        let acquired = match self.lock.acquire(&self.key, &self.token, self.ttl).await {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(key = %self.key, %err, "Could not reach the compensation lock");
                false
            }
        };
        if acquired && !self.held {
            info!(key = %self.key, token = %self.token, "Acquired the compensation lease");
        } else if !acquired && self.held {
            info!(key = %self.key, "Lost the compensation lease");
        }
        self.held = acquired;
        acquired
    }

    pub async fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match self.lock.release(&self.key, &self.token).await {
            Ok(true) => debug!(key = %self.key, "Released the compensation lease"),
            Ok(false) => debug!(key = %self.key, "Lease had already expired"),
            Err(err) => warn!(key = %self.key, %err, "Could not release the compensation lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;
    use test_log::test;

    use tcc_core::InMemoryLeaseLock;

    #[test]
    fn lock_key_is_stable_per_app() {
        assert_that!(lock_key("orders"), eq(&lock_key("orders")));
        assert_that!(lock_key("orders"), not(eq(&lock_key("billing"))));
        assert_that!(lock_key("orders"), starts_with("TCC:LOCK_RUN:"));
    }

    #[test]
    fn tokens_are_unique() {
        let token = lease_token();
        assert_that!(token, contains_substring(format!("-{}-", std::process::id())));
        assert_that!(token, not(eq(&lease_token())));
    }

    #[test(tokio::test(start_paused = true))]
    async fn only_one_holder_at_a_time() {
        let lock = Arc::new(InMemoryLeaseLock::default());
        let mut first = Leadership::with_token(lock.clone(), "tcc", "a", Duration::from_secs(60));
        let mut second = Leadership::with_token(lock.clone(), "tcc", "b", Duration::from_secs(60));

        assert!(first.acquire().await);
        assert!(!second.acquire().await);

        first.release().await;
        assert!(!first.is_held());
        assert!(second.acquire().await);
        assert_that!(lock.holder(second.key()), some(eq("b")));
    }
}
