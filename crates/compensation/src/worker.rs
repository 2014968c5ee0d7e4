// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tcc_coordinator::{IdempotentInvoker, Settlement, settle_remote};
use tcc_core::{
    InvocationError, InvocationOutcome, LeaseLock, ServiceDefinition, ServiceRegistry,
    ServiceResolver,
};
use tcc_storage_api::invocation_log::{
    InvocationFilter, InvocationLog, InvocationRecord, InvocationStatus, RetryWindow, ScanOrder,
};
use tcc_types::config::{BackoffRange, Configuration};
use tcc_types::{Phase, TransactionContext};

use crate::leadership::Leadership;
use crate::metric_definitions::{
    self, CYCLE, CYCLE_DURATION, LEASE_ACQUIRED, PURGED_ROWS, ROW_OUTCOME, TERMINAL_REPORTED,
    TERMINAL_ROWS,
};

/// Rows handled per duty and cycle.
const BATCH_SIZE: usize = 1000;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Duty {
    Purge,
    LocalRepair,
    RemoteRepair,
    OrphanTry,
    TerminalReport,
}

/// What one duty did to one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RowOutcome {
    /// The phase operation succeeded, or the row was removed.
    Resolved,
    /// A participant took over the retries on its own row.
    HandedOff,
    /// The attempt failed and was counted, the row is retried next cycle or is terminal.
    Pending,
    /// The row could not be handled, its bookkeeping may be stale.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DutyReport {
    pub duty: Duty,
    pub resolved: usize,
    pub handed_off: usize,
    pub pending: usize,
    pub errors: usize,
    /// The duty could not read its rows.
    pub query_failed: bool,
}

impl DutyReport {
    fn new(duty: Duty) -> Self {
        Self {
            duty,
            resolved: 0,
            handed_off: 0,
            pending: 0,
            errors: 0,
            query_failed: false,
        }
    }

    fn record(&mut self, outcome: RowOutcome) {
        let label: &'static str = outcome.into();
        let duty: &'static str = self.duty.into();
        counter!(ROW_OUTCOME, "duty" => duty, "outcome" => label).increment(1);
        match outcome {
            RowOutcome::Resolved => self.resolved += 1,
            RowOutcome::HandedOff => self.handed_off += 1,
            RowOutcome::Pending => self.pending += 1,
            RowOutcome::Error => self.errors += 1,
        }
    }

    pub fn rows(&self) -> usize {
        self.resolved + self.handed_off + self.pending + self.errors
    }
}

/// Aggregated outcome of one cycle, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub duties: Vec<DutyReport>,
}

impl CycleReport {
    pub fn duty(&self, duty: Duty) -> Option<&DutyReport> {
        self.duties.iter().find(|d| d.duty == duty)
    }

    pub fn errors(&self) -> usize {
        self.duties
            .iter()
            .map(|d| d.errors + usize::from(d.query_failed))
            .sum()
    }
}

/// Drives pending Confirm/Cancel rows to completion and cancels orphaned Trys.
///
/// Only the holder of the compensation lease runs cycles. Running several workers is safe, the
/// lease only avoids duplicated work.
pub struct CompensationWorker {
    config: Configuration,
    log: Arc<dyn InvocationLog>,
    registry: Arc<ServiceRegistry>,
    invoker: IdempotentInvoker,
    resolver: Arc<dyn ServiceResolver>,
    leadership: Leadership,
    reported_terminal: HashSet<u64>,
}

impl CompensationWorker {
    pub fn new(
        config: Configuration,
        registry: Arc<ServiceRegistry>,
        invoker: IdempotentInvoker,
        resolver: Arc<dyn ServiceResolver>,
        lock: Arc<dyn LeaseLock>,
    ) -> Self {
        let leadership = Leadership::new(
            lock,
            &config.compensation.app_name,
            config.compensation.lease_ttl(),
        );
        Self::with_leadership(config, registry, invoker, resolver, leadership)
    }

    pub fn with_leadership(
        config: Configuration,
        registry: Arc<ServiceRegistry>,
        invoker: IdempotentInvoker,
        resolver: Arc<dyn ServiceResolver>,
        leadership: Leadership,
    ) -> Self {
        metric_definitions::describe_metrics();
        Self {
            log: Arc::clone(invoker.log()),
            config,
            registry,
            invoker,
            resolver,
            leadership,
            reported_terminal: HashSet::new(),
        }
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    /// Runs until `cancel` fires, releasing the lease on the way out.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            key = %self.leadership.key(),
            token = %self.leadership.token(),
            lock_pool = %self.config.compensation.redis_pool,
            "Running compensation worker"
        );

        loop {
            let acquired = tokio::select! {
                acquired = self.leadership.acquire() => acquired,
                _ = cancel.cancelled() => break,
            };

            if acquired {
                counter!(LEASE_ACQUIRED).increment(1);
                let report = tokio::select! {
                    report = self.run_cycle() => report,
                    _ = cancel.cancelled() => break,
                };
                debug!(errors = report.errors(), "Compensation cycle finished");

                let pause = jitter(self.config.compensation.held_backoff());
                if sleep_or_cancelled(pause, &cancel).await {
                    break;
                }
                self.leadership.release().await;
            }

            let pause = jitter(self.config.compensation.idle_backoff());
            if sleep_or_cancelled(pause, &cancel).await {
                break;
            }
        }

        self.leadership.release().await;
        info!("Stopped compensation worker");
    }

    /// Runs every duty once. A failing row or duty never stops the cycle.
    #[instrument(level = "debug", skip_all, fields(tcc.lease.token = %self.leadership.token()))]
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        let duties = vec![
            self.purge().await,
            self.repair_local().await,
            self.repair_remote().await,
            self.cancel_orphaned_tries().await,
            self.report_terminal().await,
        ];
        counter!(CYCLE).increment(1);
        histogram!(CYCLE_DURATION).record(started.elapsed());
        CycleReport { duties }
    }

    async fn purge(&self) -> DutyReport {
        let mut report = DutyReport::new(Duty::Purge);
        let filter = InvocationFilter::default()
            .status(InvocationStatus::Success)
            .older_than(self.config.compensation.history_retention());
        match self.log.purge(&filter).await {
            Ok(purged) => {
                counter!(PURGED_ROWS).increment(purged);
                report.resolved = usize::try_from(purged).unwrap_or(usize::MAX);
                if purged > 0 {
                    debug!(purged, "Purged expired invocation rows");
                }
            }
            Err(err) => {
                warn!(%err, "Could not purge expired invocation rows");
                report.query_failed = true;
            }
        }
        report
    }

    fn pending_compensations(&self, is_local: bool) -> InvocationFilter {
        InvocationFilter::default()
            .status(InvocationStatus::Wait)
            .local(is_local)
            .phases(Phase::COMPENSATING)
            .older_than(self.config.compensation.quiet_period())
            .retry_window(RetryWindow::BelowMaxRetry)
            .limit(BATCH_SIZE)
    }

    async fn rows(&self, duty: Duty, filter: &InvocationFilter) -> Option<Vec<InvocationRecord>> {
        match self.log.query(filter).await {
            Ok(rows) => Some(rows),
            Err(err) => {
                warn!(%duty, %err, "Could not query the invocation log");
                None
            }
        }
    }

    async fn repair_local(&self) -> DutyReport {
        let mut report = DutyReport::new(Duty::LocalRepair);
        let Some(rows) = self.rows(Duty::LocalRepair, &self.pending_compensations(true)).await
        else {
            report.query_failed = true;
            return report;
        };
        for row in rows {
            let phase = row.key.phase;
            report.record(self.invoke_local(&row, phase).await);
        }
        report
    }

    async fn repair_remote(&self) -> DutyReport {
        let mut report = DutyReport::new(Duty::RemoteRepair);
        let Some(rows) = self
            .rows(Duty::RemoteRepair, &self.pending_compensations(false))
            .await
        else {
            report.query_failed = true;
            return report;
        };
        for row in rows {
            report.record(self.invoke_remote(&row).await);
        }
        report
    }

    /// Cancels successful Trys whose coordinator never confirmed nor cancelled them.
    async fn cancel_orphaned_tries(&self) -> DutyReport {
        let mut report = DutyReport::new(Duty::OrphanTry);
        let filter = InvocationFilter::default()
            .status(InvocationStatus::Success)
            .local(true)
            .phases([Phase::Try])
            .retry_window(RetryWindow::Attempted)
            .older_than(self.config.transaction.try_timeout_cancel())
            .order(ScanOrder::NewestFirst)
            .limit(BATCH_SIZE);
        let Some(rows) = self.rows(Duty::OrphanTry, &filter).await else {
            report.query_failed = true;
            return report;
        };
        for row in rows {
            info!(key = %row.key, "Try timed out, cancelling it");
            report.record(self.invoke_local(&row, Phase::Cancel).await);
        }
        report
    }

    async fn report_terminal(&mut self) -> DutyReport {
        let mut report = DutyReport::new(Duty::TerminalReport);
        let filter = InvocationFilter::default().status(InvocationStatus::Fail);
        let Some(rows) = self.rows(Duty::TerminalReport, &filter).await else {
            report.query_failed = true;
            return report;
        };

        gauge!(TERMINAL_ROWS).set(rows.len() as f64);
        let mut still_failed = HashSet::with_capacity(rows.len());
        for row in &rows {
            still_failed.insert(row.id);
            if !self.reported_terminal.contains(&row.id) {
                warn!(
                    key = %row.key,
                    execute_count = row.execute_count,
                    max_retry = row.max_retry,
                    "Invocation exhausted its retries and needs manual intervention"
                );
                counter!(TERMINAL_REPORTED).increment(1);
            }
            report.record(RowOutcome::Pending);
        }
        self.reported_terminal = still_failed;
        report
    }

    /// Runs `phase` of the row's service method in this process.
    async fn invoke_local(&self, row: &InvocationRecord, phase: Phase) -> RowOutcome {
        let definition = match self.registry.get(&row.key.service_class) {
            Ok(definition) => definition,
            Err(err) => {
                warn!(key = %row.key, %err, "Row refers to a service this process does not host");
                return RowOutcome::Error;
            }
        };
        let ctx = TransactionContext::new(
            row.key.transaction_id.clone(),
            phase,
            row.key.transaction_req.clone(),
        )
        .local_request(true);
        let result = self
            .invoker
            .exec_service_method(
                Some(&ctx),
                &definition,
                &row.key.service_func,
                row.service_params.clone(),
            )
            .await;
        local_outcome(&definition, result)
    }

    /// Drives the participant of a coordinator-side row and settles the row.
    async fn invoke_remote(&self, row: &InvocationRecord) -> RowOutcome {
        let ctx = TransactionContext::new(
            row.key.transaction_id.clone(),
            row.key.phase,
            row.key.transaction_req.clone(),
        );
        let result = match self.resolver.resolve(&row.key.service_class) {
            Ok(client) => {
                client
                    .call(ctx, &row.key.service_func, row.service_params.clone())
                    .await
            }
            Err(err) => Err(err),
        };
        match settle_remote(self.log.as_ref(), &row.key, result).await {
            Ok(Settlement::Completed) => RowOutcome::Resolved,
            Ok(Settlement::HandedOff) => RowOutcome::HandedOff,
            Ok(
                Settlement::RecordedByParticipant | Settlement::WillRetry | Settlement::Exhausted,
            ) => RowOutcome::Pending,
            Err(err) => {
                warn!(key = %row.key, %err, "Could not record the repair result");
                RowOutcome::Error
            }
        }
    }
}

fn local_outcome(
    definition: &ServiceDefinition,
    result: Result<InvocationOutcome, InvocationError>,
) -> RowOutcome {
    match result {
        Ok(InvocationOutcome::Completed(_) | InvocationOutcome::Replayed(_)) => {
            RowOutcome::Resolved
        }
        Ok(InvocationOutcome::Deferred) => RowOutcome::Pending,
        Err(err) if err.bookkeeping_recorded() => RowOutcome::Pending,
        Err(InvocationError::RetriesExhausted { .. }) => RowOutcome::Pending,
        Err(err) => {
            warn!(service = definition.name(), %err, "Repair failed");
            RowOutcome::Error
        }
    }
}

fn jitter(range: &BackoffRange) -> Duration {
    if range.min() >= range.max() {
        return range.min();
    }
    rand::rng().random_range(range.min()..=range.max())
}

/// Sleeps for `pause`, returning `true` if cancelled first.
async fn sleep_or_cancelled(pause: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = cancel.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    #[test]
    fn jitter_stays_in_range() {
        let range = BackoffRange::new(Duration::from_secs(2), Duration::from_secs(5));
        for _ in 0..100 {
            let pause = jitter(&range);
            assert_that!(pause, ge(Duration::from_secs(2)));
            assert_that!(pause, le(Duration::from_secs(5)));
        }
        let fixed = BackoffRange::new(Duration::from_secs(1), Duration::from_secs(1));
        assert_that!(jitter(&fixed), eq(Duration::from_secs(1)));
    }

    #[test]
    fn cycle_errors_count_failed_queries() {
        let mut broken = DutyReport::new(Duty::RemoteRepair);
        broken.query_failed = true;
        let mut repaired = DutyReport::new(Duty::LocalRepair);
        repaired.record(RowOutcome::Resolved);
        repaired.record(RowOutcome::Error);

        let report = CycleReport {
            duties: vec![broken, repaired],
        };
        assert_that!(report.errors(), eq(2));
        assert_that!(report.duty(Duty::LocalRepair).map(DutyReport::rows), some(eq(2)));
        assert!(report.duty(Duty::Purge).is_none());
    }
}
