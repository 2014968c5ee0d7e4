// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The TCC coordinator.
//!
//! A [`TransactionManager`] hands out one [`Coordinator`] per call chain. Try invocations go
//! through [`ServiceProxy`]s and are recorded by the coordinator; commit and rollback persist
//! Confirm/Cancel rows and replay them on a detached task. Every phase operation runs through
//! the [`IdempotentInvoker`], keyed on the invocation log.

mod coordinator;
mod error;
mod invoker;
mod metric_definitions;
mod proxy;
mod replay;
mod resolver;

pub use coordinator::{Coordinator, CoordinatorState, RecordedInvocation, TransactionManager};
pub use error::{TransactionError, TransactionStateError};
pub use invoker::IdempotentInvoker;
pub use proxy::ServiceProxy;
pub use replay::{ReplayHandle, ReplaySummary, Settlement, settle_remote};
pub use resolver::LocalServiceResolver;
