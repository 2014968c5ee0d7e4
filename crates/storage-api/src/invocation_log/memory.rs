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

use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

use tcc_types::Payload;
use tcc_types::time::{Clock, WallClock};

use super::{
    InvocationFilter, InvocationKey, InvocationLog, InvocationRecord, InvocationStatus,
    NewInvocation, ScanOrder,
};
use crate::Result;

/// In-memory [`InvocationLog`] for tests and single-process deployments.
/// Row ids are monotonically increasing.
#[derive(Debug, Clone)]
pub struct InMemoryInvocationLog {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct Inner {
    rows: HashMap<InvocationKey, InvocationRecord>,
    next_id: u64,
}

impl InMemoryInvocationLog {
    pub fn new() -> Self {
        Self::with_clock(WallClock)
    }

    pub fn with_clock(clock: impl Clock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rows: HashMap::new(),
                next_id: 1,
            })),
            clock: Arc::new(clock),
        }
    }

    /// All rows, oldest id first.
    pub fn snapshot(&self) -> Vec<InvocationRecord> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner.rows.values().cloned().collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, inner: &Inner, filter: &InvocationFilter) -> Vec<InvocationRecord> {
        let now = self.clock.now();
        let mut rows: Vec<_> = inner
            .rows
            .values()
            .filter(|r| filter.matches(r, now))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.updated_at, r.id));
        if filter.scan_order() == ScanOrder::NewestFirst {
            rows.reverse();
        }
        if let Some(limit) = filter.max_rows() {
            rows.truncate(limit);
        }
        rows
    }
}

impl Default for InMemoryInvocationLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InvocationLog for InMemoryInvocationLog {
    #[instrument(level = "trace", skip_all, fields(key = %invocation.key), err)]
    async fn upsert_wait(&self, invocation: NewInvocation) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.rows.contains_key(&invocation.key) {
            trace!("row already present");
            return Ok(false);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        debug!(id, is_local = invocation.is_local, "insert wait row");
        inner.rows.insert(
            invocation.key.clone(),
            InvocationRecord {
                id,
                key: invocation.key,
                service_params: invocation.service_params,
                is_local: invocation.is_local,
                status: InvocationStatus::Wait,
                execute_count: 0,
                max_retry: invocation.max_retry,
                service_result: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    #[instrument(level = "trace", skip(self), fields(key = %key), err)]
    async fn find(&self, key: &InvocationKey) -> Result<Option<InvocationRecord>> {
        Ok(self.inner.lock().rows.get(key).cloned())
    }

    #[instrument(level = "trace", skip(self, result), fields(key = %key), err)]
    async fn mark_success(&self, key: &InvocationKey, result: Payload) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.rows.get_mut(key) {
            Some(row) if row.status == InvocationStatus::Wait => {
                row.status = InvocationStatus::Success;
                row.execute_count += 1;
                row.service_result = Some(result);
                row.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(level = "trace", skip(self), fields(key = %key), err)]
    async fn mark_retry_or_fail(&self, key: &InvocationKey) -> Result<Option<InvocationStatus>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let Some(row) = inner.rows.get_mut(key) else {
            return Ok(None);
        };
        if row.status == InvocationStatus::Success {
            return Ok(Some(row.status));
        }
        row.execute_count += 1;
        if row.execute_count >= row.max_retry {
            row.status = InvocationStatus::Fail;
        }
        row.updated_at = now;
        debug!(
            execute_count = row.execute_count,
            status = %row.status,
            "counted failed attempt"
        );
        Ok(Some(row.status))
    }

    #[instrument(level = "trace", skip(self), fields(key = %key), err)]
    async fn delete(&self, key: &InvocationKey) -> Result<bool> {
        Ok(self.inner.lock().rows.remove(key).is_some())
    }

    #[instrument(level = "trace", skip(self), fields(key = %key), err)]
    async fn delete_if_status(
        &self,
        key: &InvocationKey,
        status: InvocationStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.rows.get(key) {
            Some(row) if row.status == status => {
                inner.rows.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn query(&self, filter: &InvocationFilter) -> Result<Vec<InvocationRecord>> {
        let inner = self.inner.lock();
        Ok(self.select(&inner, filter))
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn purge(&self, filter: &InvocationFilter) -> Result<u64> {
        let mut inner = self.inner.lock();
        let victims = self.select(&inner, filter);
        for row in &victims {
            inner.rows.remove(&row.key);
        }
        Ok(victims.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use googletest::prelude::*;
    use test_log::test;

    use tcc_types::time::{ManualClock, MillisSinceEpoch};
    use tcc_types::{Phase, RequestId, TransactionId};

    use crate::invocation_log::RetryWindow;

    fn key(req: &str, phase: Phase) -> InvocationKey {
        InvocationKey::new(
            TransactionId::from("tx-1"),
            RequestId::from(req),
            phase,
            "Inventory",
            "reserve",
        )
    }

    fn wait_row(req: &str, phase: Phase, max_retry: u32) -> NewInvocation {
        NewInvocation::local(key(req, phase), Payload::from("[1]"), max_retry)
    }

    #[test(tokio::test)]
    async fn upsert_keeps_the_first_row() -> anyhow::Result<()> {
        let log = InMemoryInvocationLog::new();
        assert!(log.upsert_wait(wait_row("0", Phase::Try, 3)).await?);

        let mut second = wait_row("0", Phase::Try, 9);
        second.is_local = false;
        assert!(!log.upsert_wait(second).await?);

        let row = log.find(&key("0", Phase::Try)).await?.unwrap();
        assert_that!(row.max_retry, eq(3));
        assert_that!(row.is_local, eq(true));
        assert_that!(row.execute_count, eq(0));
        Ok(())
    }

    #[test(tokio::test)]
    async fn success_is_terminal() -> anyhow::Result<()> {
        let log = InMemoryInvocationLog::new();
        let k = key("0", Phase::Confirm);
        log.upsert_wait(wait_row("0", Phase::Confirm, 3)).await?;

        assert!(log.mark_success(&k, Payload::from("\"ok\"")).await?);
        assert!(!log.mark_success(&k, Payload::from("\"again\"")).await?);
        assert_eq!(
            log.mark_retry_or_fail(&k).await?,
            Some(InvocationStatus::Success)
        );

        let row = log.find(&k).await?.unwrap();
        assert_eq!(row.service_result, Some(Payload::from("\"ok\"")));
        assert_that!(row.execute_count, eq(1));
        Ok(())
    }

    #[test(tokio::test)]
    async fn fails_exactly_at_max_retry() -> anyhow::Result<()> {
        let log = InMemoryInvocationLog::new();
        let k = key("0", Phase::Cancel);
        log.upsert_wait(wait_row("0", Phase::Cancel, 3)).await?;

        assert_eq!(log.mark_retry_or_fail(&k).await?, Some(InvocationStatus::Wait));
        assert_eq!(log.mark_retry_or_fail(&k).await?, Some(InvocationStatus::Wait));
        assert_eq!(log.mark_retry_or_fail(&k).await?, Some(InvocationStatus::Fail));
        // terminal, only the count moves
        assert_eq!(log.mark_retry_or_fail(&k).await?, Some(InvocationStatus::Fail));
        assert!(!log.mark_success(&k, Payload::empty()).await?);

        let row = log.find(&k).await?.unwrap();
        assert_that!(row.execute_count, eq(4));
        assert_eq!(
            log.mark_retry_or_fail(&key("missing", Phase::Cancel)).await?,
            None
        );
        Ok(())
    }

    #[test(tokio::test)]
    async fn delete_if_status_checks_current_status() -> anyhow::Result<()> {
        let log = InMemoryInvocationLog::new();
        let k = key("0", Phase::Try);
        log.upsert_wait(wait_row("0", Phase::Try, 3)).await?;

        assert!(!log.delete_if_status(&k, InvocationStatus::Success).await?);
        log.mark_success(&k, Payload::empty()).await?;
        assert!(log.delete_if_status(&k, InvocationStatus::Success).await?);
        assert!(log.is_empty());
        Ok(())
    }

    #[test(tokio::test)]
    async fn query_orders_by_modification_time() -> anyhow::Result<()> {
        let clock = ManualClock::new(MillisSinceEpoch::new(1_000_000));
        let log = InMemoryInvocationLog::with_clock(clock.clone());

        for req in ["0", "1", "2"] {
            log.upsert_wait(wait_row(req, Phase::Try, 3)).await?;
            log.mark_success(&key(req, Phase::Try), Payload::empty())
                .await?;
            clock.advance(Duration::from_secs(10));
        }
        // waiting rows are not part of the selection
        log.upsert_wait(wait_row("0", Phase::Cancel, 3)).await?;
        clock.advance(Duration::from_secs(100));

        let filter = InvocationFilter::default()
            .status(InvocationStatus::Success)
            .retry_window(RetryWindow::Attempted)
            .older_than(Duration::from_secs(60));

        let oldest_first: Vec<_> = log
            .query(&filter)
            .await?
            .into_iter()
            .map(|r| r.key.transaction_req)
            .collect();
        assert_eq!(
            oldest_first,
            vec![RequestId::from("0"), RequestId::from("1"), RequestId::from("2")]
        );

        let newest = log
            .query(&filter.clone().order(ScanOrder::NewestFirst).limit(1))
            .await?;
        assert_that!(newest.len(), eq(1));
        assert_eq!(newest[0].key.transaction_req, RequestId::from("2"));

        let only_oldest = log
            .query(&filter.older_than(Duration::from_secs(125)))
            .await?;
        assert_that!(only_oldest.len(), eq(1));
        Ok(())
    }

    #[test(tokio::test)]
    async fn purge_removes_selected_rows_only() -> anyhow::Result<()> {
        let clock = ManualClock::new(MillisSinceEpoch::new(0));
        let log = InMemoryInvocationLog::with_clock(clock.clone());

        log.upsert_wait(wait_row("0", Phase::Confirm, 3)).await?;
        log.mark_success(&key("0", Phase::Confirm), Payload::empty())
            .await?;
        log.upsert_wait(wait_row("1", Phase::Confirm, 3)).await?;
        clock.advance(Duration::from_secs(5 * 3600));

        let purged = log
            .purge(
                &InvocationFilter::default()
                    .status(InvocationStatus::Success)
                    .older_than(Duration::from_secs(4 * 3600)),
            )
            .await?;
        assert_that!(purged, eq(1));
        assert_that!(log.len(), eq(1));
        assert_eq!(
            log.snapshot()[0].key.transaction_req,
            RequestId::from("1")
        );
        Ok(())
    }
}
