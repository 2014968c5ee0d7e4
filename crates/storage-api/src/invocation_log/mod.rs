// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod memory;

pub use memory::InMemoryInvocationLog;

use std::fmt;
use std::time::Duration;

use tcc_types::time::MillisSinceEpoch;
use tcc_types::{Payload, Phase, RequestId, TransactionContext, TransactionId};

use crate::Result;

/// Idempotency key of an invocation. At most one row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InvocationKey {
    pub transaction_id: TransactionId,
    pub transaction_req: RequestId,
    pub phase: Phase,
    pub service_class: String,
    pub service_func: String,
}

impl InvocationKey {
    pub fn new(
        transaction_id: TransactionId,
        transaction_req: RequestId,
        phase: Phase,
        service_class: impl Into<String>,
        service_func: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id,
            transaction_req,
            phase,
            service_class: service_class.into(),
            service_func: service_func.into(),
        }
    }

    pub fn from_context(
        ctx: &TransactionContext,
        service_class: impl Into<String>,
        service_func: impl Into<String>,
    ) -> Self {
        Self::new(
            ctx.transaction_id.clone(),
            ctx.transaction_req.clone(),
            ctx.phase,
            service_class,
            service_func,
        )
    }

    /// The key of the same request under another phase.
    pub fn with_phase(&self, phase: Phase) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}.{}",
            self.transaction_id,
            self.transaction_req,
            self.phase,
            self.service_class,
            self.service_func
        )
    }
}

/// Row status. Wait moves to either Success or Fail, both are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum_macros::Display,
)]
#[repr(u8)]
pub enum InvocationStatus {
    Wait = 0,
    Fail = 1,
    Success = 2,
}

impl InvocationStatus {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationStatus::Wait)
    }
}

impl TryFrom<u8> for InvocationStatus {
    type Error = crate::StorageError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(InvocationStatus::Wait),
            1 => Ok(InvocationStatus::Fail),
            2 => Ok(InvocationStatus::Success),
            other => Err(crate::StorageError::DataIntegrityError(format!(
                "unknown invocation status code {other}"
            ))),
        }
    }
}

/// A Wait row about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvocation {
    pub key: InvocationKey,
    pub service_params: Payload,
    pub is_local: bool,
    pub max_retry: u32,
}

impl NewInvocation {
    /// Row owned by the participant executing the phase in this process.
    pub fn local(key: InvocationKey, service_params: Payload, max_retry: u32) -> Self {
        Self {
            key,
            service_params,
            is_local: true,
            max_retry,
        }
    }

    /// Row owned by a coordinator driving the participant through a resolver.
    pub fn remote(key: InvocationKey, service_params: Payload, max_retry: u32) -> Self {
        Self {
            key,
            service_params,
            is_local: false,
            max_retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRecord {
    pub id: u64,
    pub key: InvocationKey,
    pub service_params: Payload,
    pub is_local: bool,
    pub status: InvocationStatus,
    pub execute_count: u32,
    pub max_retry: u32,
    pub service_result: Option<Payload>,
    pub created_at: MillisSinceEpoch,
    pub updated_at: MillisSinceEpoch,
}

impl InvocationRecord {
    pub fn retries_left(&self) -> bool {
        self.execute_count < self.max_retry
    }
}

/// Constraint on the retry bookkeeping of a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryWindow {
    #[default]
    Any,
    /// `execute_count < max_retry`
    BelowMaxRetry,
    /// `execute_count > 0`
    Attempted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Selects rows for [`InvocationLog::query`] and [`InvocationLog::purge`]. An empty filter
/// selects every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationFilter {
    status: Option<InvocationStatus>,
    is_local: Option<bool>,
    phases: Option<Vec<Phase>>,
    older_than: Option<Duration>,
    retry_window: RetryWindow,
    order: ScanOrder,
    limit: Option<usize>,
}

impl InvocationFilter {
    pub fn status(mut self, status: InvocationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn local(mut self, is_local: bool) -> Self {
        self.is_local = Some(is_local);
        self
    }

    pub fn phases(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.phases = Some(phases.into_iter().collect());
        self
    }

    /// Only rows last modified at least `age` ago.
    pub fn older_than(mut self, age: Duration) -> Self {
        self.older_than = Some(age);
        self
    }

    pub fn retry_window(mut self, window: RetryWindow) -> Self {
        self.retry_window = window;
        self
    }

    pub fn order(mut self, order: ScanOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn scan_order(&self) -> ScanOrder {
        self.order
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.limit
    }

    /// Whether `record` passes every predicate, ages measured against `now`.
    pub fn matches(&self, record: &InvocationRecord, now: MillisSinceEpoch) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.is_local.is_some_and(|l| l != record.is_local) {
            return false;
        }
        if let Some(phases) = &self.phases {
            if !phases.contains(&record.key.phase) {
                return false;
            }
        }
        if let Some(age) = self.older_than {
            if record.updated_at > now.saturating_sub(age) {
                return false;
            }
        }
        match self.retry_window {
            RetryWindow::Any => true,
            RetryWindow::BelowMaxRetry => record.retries_left(),
            RetryWindow::Attempted => record.execute_count > 0,
        }
    }
}

/// Durable record of every invocation attempt of a saga.
///
/// All mutations are atomic per row. Implementations must never move a row out of a terminal
/// status.
#[async_trait::async_trait]
pub trait InvocationLog: Send + Sync + 'static {
    /// Inserts a Wait row with `execute_count = 0`. Returns `false` and leaves the existing row
    /// untouched if the key is already present.
    async fn upsert_wait(&self, invocation: NewInvocation) -> Result<bool>;

    async fn find(&self, key: &InvocationKey) -> Result<Option<InvocationRecord>>;

    /// Moves a Wait row to Success, storing the result and counting the attempt. Returns
    /// `false` if there is no Wait row for the key.
    async fn mark_success(&self, key: &InvocationKey, result: Payload) -> Result<bool>;

    /// Counts a failed attempt and flips the row to Fail once `execute_count` reaches
    /// `max_retry`. Success rows are left alone. Returns the resulting status, `None` if the
    /// row does not exist.
    async fn mark_retry_or_fail(&self, key: &InvocationKey) -> Result<Option<InvocationStatus>>;

    async fn delete(&self, key: &InvocationKey) -> Result<bool>;

    /// Deletes the row only if it currently has `status`.
    async fn delete_if_status(&self, key: &InvocationKey, status: InvocationStatus)
    -> Result<bool>;

    async fn query(&self, filter: &InvocationFilter) -> Result<Vec<InvocationRecord>>;

    /// Deletes every row selected by `filter` and returns how many were removed.
    async fn purge(&self, filter: &InvocationFilter) -> Result<u64>;
}
