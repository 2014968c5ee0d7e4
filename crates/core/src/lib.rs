// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Seams between the TCC coordinator and the outside world: the services it drives, the
//! connection pools it opens local transactions on and the lock electing the compensation
//! worker.

pub mod db;
pub mod lock;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use db::{ConnectionPool, DbPools, LocalTransaction, PoolError};
pub use lock::{InMemoryLeaseLock, LeaseLock, LockError};
pub use service::{
    Handler, InvocationError, InvocationOutcome, MethodDispatchError, ServiceClient,
    ServiceDefinition, ServiceRegistry, ServiceResolver,
};
