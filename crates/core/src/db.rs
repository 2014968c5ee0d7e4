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

use tcc_types::errors::GenericError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PoolOperation {
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("unknown connection pool '{0}'")]
    UnknownPool(String),
    #[error("{operation} on pool '{pool}' failed: {source}")]
    Operation {
        pool: String,
        operation: PoolOperation,
        source: GenericError,
    },
}

impl PoolError {
    pub fn operation(
        pool: impl Into<String>,
        operation: PoolOperation,
        source: impl Into<GenericError>,
    ) -> Self {
        PoolError::Operation {
            pool: pool.into(),
            operation,
            source: source.into(),
        }
    }
}

/// A database connection pool. Each coordinator opens one local transaction per participating
/// pool; pools commit and roll back independently of each other.
#[async_trait::async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn LocalTransaction>, PoolError>;
}

#[async_trait::async_trait]
pub trait LocalTransaction: Send {
    async fn commit(self: Box<Self>) -> Result<(), PoolError>;

    async fn rollback(self: Box<Self>) -> Result<(), PoolError>;
}

/// Connection pools by name.
#[derive(Clone, Default)]
pub struct DbPools {
    pools: HashMap<String, Arc<dyn ConnectionPool>>,
}

impl DbPools {
    pub fn register(&mut self, name: impl Into<String>, pool: impl ConnectionPool) {
        self.pools.insert(name.into(), Arc::new(pool));
    }

    pub fn with_pool(mut self, name: impl Into<String>, pool: impl ConnectionPool) -> Self {
        self.register(name, pool);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPool(name.to_owned()))
    }
}

impl std::fmt::Debug for DbPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.pools.keys()).finish()
    }
}

/// A pool without a database behind it, for services that keep no local state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConnectionPool;

struct NoopTransaction;

#[async_trait::async_trait]
impl ConnectionPool for NoopConnectionPool {
    async fn begin(&self) -> Result<Box<dyn LocalTransaction>, PoolError> {
        Ok(Box::new(NoopTransaction))
    }
}

#[async_trait::async_trait]
impl LocalTransaction for NoopTransaction {
    async fn commit(self: Box<Self>) -> Result<(), PoolError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PoolError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_pool_is_an_error() -> anyhow::Result<()> {
        let pools = DbPools::default().with_pool("default", NoopConnectionPool);
        let tx = pools.get("default")?.begin().await?;
        tx.commit().await?;

        assert!(matches!(
            pools.get("orders"),
            Err(PoolError::UnknownPool(name)) if name == "orders"
        ));
        Ok(())
    }
}
