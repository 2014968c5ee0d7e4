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

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use tcc_core::{InvocationError, InvocationOutcome, ServiceResolver};
use tcc_storage_api::StorageError;
use tcc_storage_api::invocation_log::{InvocationKey, InvocationLog, InvocationStatus};
use tcc_types::{Phase, TransactionContext, TransactionId};

use crate::coordinator::RecordedInvocation;
use crate::metric_definitions::REPLAY_SETTLEMENT;

/// What happened to a coordinator-side row after driving its participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Settlement {
    /// The participant executed the phase, the row was removed.
    Completed,
    /// The participant failed but keeps retrying on its own row, the row was removed.
    HandedOff,
    /// The participant counted the failed attempt on this very row.
    RecordedByParticipant,
    /// The failed attempt was counted, the row stays for the compensation worker.
    WillRetry,
    /// The failed attempt exhausted the row's retries.
    Exhausted,
}

/// Records the result of calling a participant on the coordinator-side row `key`.
pub async fn settle_remote(
    log: &dyn InvocationLog,
    key: &InvocationKey,
    result: Result<InvocationOutcome, InvocationError>,
) -> Result<Settlement, StorageError> {
    match result {
        Ok(InvocationOutcome::Completed(_) | InvocationOutcome::Replayed(_)) => {
            log.delete(key).await?;
            Ok(Settlement::Completed)
        }
        Ok(InvocationOutcome::Deferred) => {
            log.delete(key).await?;
            Ok(Settlement::HandedOff)
        }
        Err(err) if err.bookkeeping_recorded() => {
            debug!(%key, error = %err, "Participant recorded the failure");
            Ok(Settlement::RecordedByParticipant)
        }
        Err(err) => {
            warn!(%key, error = %err, "Participant call failed");
            match log.mark_retry_or_fail(key).await? {
                Some(InvocationStatus::Fail) => {
                    error!(%key, "Replay exhausted its retries and needs manual intervention");
                    Ok(Settlement::Exhausted)
                }
                _ => Ok(Settlement::WillRetry),
            }
        }
    }
}

/// Counts per [`Settlement`] of one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub completed: usize,
    pub handed_off: usize,
    pub recorded_by_participant: usize,
    pub will_retry: usize,
    pub exhausted: usize,
    pub storage_errors: usize,
}

impl ReplaySummary {
    fn record(&mut self, settlement: Result<Settlement, StorageError>) {
        match settlement {
            Ok(Settlement::Completed) => self.completed += 1,
            Ok(Settlement::HandedOff) => self.handed_off += 1,
            Ok(Settlement::RecordedByParticipant) => self.recorded_by_participant += 1,
            Ok(Settlement::WillRetry) => self.will_retry += 1,
            Ok(Settlement::Exhausted) => self.exhausted += 1,
            Err(_) => self.storage_errors += 1,
        }
    }

    /// Entries that still need the compensation worker.
    pub fn unsettled(&self) -> usize {
        self.recorded_by_participant + self.will_retry + self.exhausted + self.storage_errors
    }
}

/// Handle to a detached replay. Dropping it leaves the replay running.
#[derive(Debug)]
pub struct ReplayHandle(Option<JoinHandle<ReplaySummary>>);

impl ReplayHandle {
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Waits for the replay. `None` if nothing was replayed or the task did not finish.
    pub async fn join(self) -> Option<ReplaySummary> {
        match self.0?.await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(%err, "Replay task did not complete");
                None
            }
        }
    }
}

/// Drives Confirm or Cancel on every recorded Try of a transaction, in recorded order.
pub(crate) struct Replay {
    pub(crate) transaction_id: TransactionId,
    pub(crate) phase: Phase,
    pub(crate) entries: Vec<RecordedInvocation>,
    pub(crate) resolver: Arc<dyn ServiceResolver>,
    pub(crate) log: Arc<dyn InvocationLog>,
}

impl Replay {
    pub(crate) fn spawn(self) -> ReplayHandle {
        ReplayHandle(Some(tokio::spawn(self.run())))
    }

    #[instrument(
        level = "info",
        skip_all,
        fields(tcc.transaction.id = %self.transaction_id, tcc.phase = %self.phase)
    )]
    async fn run(self) -> ReplaySummary {
        let phase: &'static str = self.phase.into();
        let mut summary = ReplaySummary::default();
        for entry in &self.entries {
            let key = InvocationKey::new(
                self.transaction_id.clone(),
                entry.request_id.clone(),
                self.phase,
                entry.service_class.clone(),
                entry.service_func.clone(),
            );
            let ctx = TransactionContext::new(
                self.transaction_id.clone(),
                self.phase,
                entry.request_id.clone(),
            );
            let result = match self.resolver.resolve(&entry.service_class) {
                Ok(client) => {
                    client
                        .call(ctx, &entry.service_func, entry.args.clone())
                        .await
                }
                Err(err) => Err(err),
            };
            let settlement = settle_remote(self.log.as_ref(), &key, result).await;
            match &settlement {
                Ok(s) => {
                    let s: &'static str = (*s).into();
                    counter!(REPLAY_SETTLEMENT, "phase" => phase, "settlement" => s).increment(1);
                }
                Err(err) => error!(%key, %err, "Could not record the replay result"),
            }
            summary.record(settlement);
        }
        info!(
            completed = summary.completed,
            unsettled = summary.unsettled(),
            "Replay finished"
        );
        summary
    }
}
