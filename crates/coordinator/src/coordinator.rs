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
use std::mem;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, info, warn};

use tcc_core::{
    DbPools, InvocationError, InvocationOutcome, LocalTransaction, PoolError, ServiceClient,
    ServiceDefinition, ServiceResolver,
};
use tcc_storage_api::invocation_log::{InvocationKey, NewInvocation};
use tcc_types::config::TransactionOptions;
use tcc_types::{Payload, Phase, RequestId, RequestIdSequence, TransactionContext, TransactionId};

use crate::error::{TransactionError, TransactionStateError};
use crate::invoker::IdempotentInvoker;
use crate::metric_definitions::{
    self, TRANSACTION_BEGIN, TRANSACTION_COMMIT, TRANSACTION_ROLLBACK,
};
use crate::proxy::ServiceProxy;
use crate::replay::{Replay, ReplayHandle};

const DEFAULT_POOL: &str = "default";

struct Shared {
    invoker: IdempotentInvoker,
    pools: DbPools,
    resolver: Arc<dyn ServiceResolver>,
    options: TransactionOptions,
}

/// Creates the [`Coordinator`] of each call chain.
#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<Shared>,
}

impl TransactionManager {
    pub fn new(
        options: TransactionOptions,
        invoker: IdempotentInvoker,
        pools: DbPools,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Self {
        metric_definitions::describe_metrics();
        Self {
            shared: Arc::new(Shared {
                invoker,
                pools,
                resolver,
                options,
            }),
        }
    }

    pub fn invoker(&self) -> &IdempotentInvoker {
        &self.shared.invoker
    }

    pub fn resolver(&self) -> &Arc<dyn ServiceResolver> {
        &self.shared.resolver
    }

    /// Returns an idle coordinator for the call chain `inbound` belongs to.
    ///
    /// Without an inbound context, or with a Try context of a first node, the coordinator starts
    /// a new transaction. Otherwise it joins the transaction of `inbound` under its phase.
    pub fn get_transaction(
        &self,
        inbound: Option<&TransactionContext>,
        db_pools: &[&str],
    ) -> Coordinator {
        let (phase, is_first_node) = match inbound {
            None => (Phase::Try, true),
            Some(ctx) if ctx.phase == Phase::Try && ctx.is_first_node => (Phase::Try, true),
            Some(ctx) => (ctx.phase, false),
        };
        let mut coordinator = Coordinator::idle(Arc::clone(&self.shared));
        coordinator.phase = phase;
        coordinator.is_first_node = is_first_node;
        coordinator.inbound = inbound.cloned();
        coordinator.requested_pools = db_pools.iter().map(|p| (*p).to_owned()).collect();
        coordinator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CoordinatorState {
    Idle,
    Active,
    Committing,
    RollingBack,
    Done,
}

/// A successful Try, replayed as Confirm or Cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInvocation {
    pub transaction_id: TransactionId,
    pub request_id: RequestId,
    pub service_class: String,
    pub service_func: String,
    pub args: Payload,
}

impl RecordedInvocation {
    pub fn key(&self, phase: Phase) -> InvocationKey {
        InvocationKey::new(
            self.transaction_id.clone(),
            self.request_id.clone(),
            phase,
            self.service_class.clone(),
            self.service_func.clone(),
        )
    }
}

/// TCC state machine of one call chain.
///
/// A coordinator dropped while active rolls back on the current tokio runtime.
pub struct Coordinator {
    shared: Arc<Shared>,
    state: CoordinatorState,
    phase: Phase,
    is_first_node: bool,
    inbound: Option<TransactionContext>,
    requested_pools: Vec<String>,
    transaction_id: Option<TransactionId>,
    parent_req: RequestId,
    request_ids: RequestIdSequence,
    service_list: Vec<RecordedInvocation>,
    local_transactions: LocalTransactions,
}

impl Coordinator {
    fn idle(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            state: CoordinatorState::Idle,
            phase: Phase::Try,
            is_first_node: false,
            inbound: None,
            requested_pools: Vec::new(),
            transaction_id: None,
            parent_req: RequestId::default(),
            request_ids: RequestIdSequence::default(),
            service_list: Vec::new(),
            local_transactions: Vec::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_first_node(&self) -> bool {
        self.is_first_node
    }

    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction_id.as_ref()
    }

    pub fn service_list(&self) -> &[RecordedInvocation] {
        &self.service_list
    }

    /// Whether the coordinator has begun and not yet committed or rolled back.
    pub fn is_transaction(&self) -> bool {
        self.state == CoordinatorState::Active
    }

    /// The pools that take part in the local transaction, in first appearance order.
    pub fn participating_pools(&self) -> Vec<String> {
        let mut pools = if self.requested_pools.is_empty() {
            vec![DEFAULT_POOL.to_owned()]
        } else {
            self.requested_pools.clone()
        };
        pools.push(self.shared.options.db_pool.clone());
        let mut seen = HashSet::new();
        pools.retain(|p| seen.insert(p.clone()));
        pools
    }

    /// Context for the next outgoing call, `None` while not active.
    pub fn context(&self) -> Option<TransactionContext> {
        if !self.is_transaction() {
            return None;
        }
        let transaction_id = self.transaction_id.clone()?;
        Some(
            TransactionContext::new(transaction_id, self.phase, self.request_ids.current())
                .with_parent(self.parent_req.clone())
                .first_node(self.is_first_node),
        )
    }

    pub async fn begin(&mut self) -> Result<(), TransactionError> {
        if self.state != CoordinatorState::Idle {
            return Err(TransactionStateError::AlreadyStarted.into());
        }

        let inherited = self
            .inbound
            .as_ref()
            .map(|ctx| &ctx.transaction_id)
            .filter(|id| !id.as_str().is_empty());
        let transaction_id = match inherited {
            Some(id) if !self.is_first_node => id.clone(),
            _ => TransactionId::generate(),
        };
        let parent_req = self
            .inbound
            .as_ref()
            .map(|ctx| ctx.transaction_req.clone())
            .unwrap_or_default();
        let request_ids = if self.is_first_node {
            RequestIdSequence::first_node(&parent_req)
        } else {
            RequestIdSequence::joined_node(&transaction_id, &parent_req)
        };

        let mut opened = Vec::new();
        for name in self.participating_pools() {
            let begun = match self.shared.pools.get(&name) {
                Ok(pool) => pool.begin().await,
                Err(err) => Err(err),
            };
            match begun {
                Ok(tx) => opened.push((name, tx)),
                Err(err) => {
                    rollback_local(opened).await;
                    return Err(err.into());
                }
            }
        }

        debug!(
            tcc.transaction.id = %transaction_id,
            tcc.request.id = %request_ids.current(),
            tcc.phase = %self.phase,
            tcc.first_node = self.is_first_node,
            "Transaction started"
        );
        counter!(TRANSACTION_BEGIN).increment(1);

        self.transaction_id = Some(transaction_id);
        self.parent_req = parent_req;
        self.request_ids = request_ids;
        self.service_list.clear();
        self.local_transactions = opened;
        self.state = CoordinatorState::Active;
        Ok(())
    }

    /// A proxy to `service`, recording its successful Try calls on this coordinator.
    pub fn service(&mut self, service: &str) -> Result<ServiceProxy<'_>, TransactionError> {
        if !self.is_transaction() {
            return Err(TransactionStateError::NotStarted {
                operation: "get a service",
            }
            .into());
        }
        let client = self.shared.resolver.resolve(service)?;
        Ok(ServiceProxy::new(self, service.to_owned(), client))
    }

    pub(crate) async fn call_through(
        &mut self,
        service: &str,
        client: &dyn ServiceClient,
        method: &str,
        args: Payload,
    ) -> Result<InvocationOutcome, TransactionError> {
        let ctx = self.context().ok_or(TransactionStateError::NotStarted {
            operation: "call a service",
        })?;
        match client.call(ctx.clone(), method, args.clone()).await {
            Ok(outcome) => {
                self.record_call(&ctx, service, method, args);
                Ok(outcome)
            }
            Err(err @ InvocationError::TryPhase { .. }) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(%rollback_err, "Rollback after a failed try did not complete");
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Records a successful call made under `ctx` and moves on to the next request id. Only Try
    /// calls are kept for replay.
    pub fn record_call(
        &mut self,
        ctx: &TransactionContext,
        service: &str,
        method: &str,
        args: Payload,
    ) {
        if self.phase == Phase::Try {
            self.service_list.push(RecordedInvocation {
                transaction_id: ctx.transaction_id.clone(),
                request_id: ctx.transaction_req.clone(),
                service_class: service.to_owned(),
                service_func: method.to_owned(),
                args,
            });
        }
        self.request_ids.advance();
    }

    /// Runs a phase operation of a service hosted by this process. A failure rolls this
    /// coordinator back if it is active.
    pub async fn exec_service_method(
        &mut self,
        ctx: Option<&TransactionContext>,
        service: &ServiceDefinition,
        method: &str,
        args: Payload,
    ) -> Result<InvocationOutcome, TransactionError> {
        let result = self
            .shared
            .invoker
            .exec_service_method(ctx, service, method, args)
            .await;
        let failed = matches!(
            result,
            Ok(InvocationOutcome::Deferred)
                | Err(InvocationError::TryPhase { .. } | InvocationError::Compensation { .. })
        );
        if failed && self.is_transaction() {
            if let Err(err) = self.rollback().await {
                warn!(%err, "Rollback after a failed invocation did not complete");
            }
        }
        Ok(result?)
    }

    /// Commits the local transactions and, on the first node, replays Confirm on every
    /// recorded Try.
    ///
    /// If the Confirm rows cannot be written the coordinator stays active. If a local commit
    /// fails the recorded Trys are cancelled instead and the error is returned.
    pub async fn commit(&mut self) -> Result<ReplayHandle, TransactionError> {
        let transaction_id = self.active_transaction("commit")?;

        if self.is_first_node {
            self.persist_confirm_rows().await?;
        }

        self.state = CoordinatorState::Committing;
        if let Err(err) = commit_local(mem::take(&mut self.local_transactions)).await {
            error!(
                tcc.transaction.id = %transaction_id,
                %err,
                "Local commit failed, cancelling the transaction"
            );
            for entry in &self.service_list {
                if let Err(err) = self
                    .shared
                    .invoker
                    .log()
                    .delete(&entry.key(Phase::Confirm))
                    .await
                {
                    warn!(%err, "Could not remove a confirm row");
                }
            }
            self.replay_cancel(transaction_id).await;
            self.state = CoordinatorState::Done;
            counter!(TRANSACTION_ROLLBACK).increment(1);
            return Err(err.into());
        }

        let handle = if self.is_first_node && !self.service_list.is_empty() {
            self.spawn_replay(transaction_id.clone(), Phase::Confirm)
        } else {
            ReplayHandle::none()
        };
        info!(
            tcc.transaction.id = %transaction_id,
            participants = self.service_list.len(),
            "Transaction committed"
        );
        counter!(TRANSACTION_COMMIT).increment(1);
        self.state = CoordinatorState::Done;
        Ok(handle)
    }

    /// Rolls back the local transactions and, in the Try phase, replays Cancel on every
    /// recorded Try in recorded order.
    pub async fn rollback(&mut self) -> Result<ReplayHandle, TransactionError> {
        let transaction_id = self.active_transaction("rollback")?;
        self.state = CoordinatorState::RollingBack;
        self.finish_rollback(transaction_id).await
    }

    /// Rollback of a coordinator already moved to [`CoordinatorState::RollingBack`].
    async fn finish_rollback(
        &mut self,
        transaction_id: TransactionId,
    ) -> Result<ReplayHandle, TransactionError> {
        let pool_error = rollback_local(mem::take(&mut self.local_transactions)).await;
        let handle = if self.phase == Phase::Try {
            self.replay_cancel(transaction_id.clone()).await
        } else {
            ReplayHandle::none()
        };
        info!(
            tcc.transaction.id = %transaction_id,
            participants = self.service_list.len(),
            "Transaction rolled back"
        );
        counter!(TRANSACTION_ROLLBACK).increment(1);
        self.state = CoordinatorState::Done;

        match pool_error {
            Some(err) => Err(err.into()),
            None => Ok(handle),
        }
    }

    /// Rolls back only if the coordinator is active.
    pub async fn rollback_if_active(&mut self) -> Result<Option<ReplayHandle>, TransactionError> {
        if self.is_transaction() {
            self.rollback().await.map(Some)
        } else {
            Ok(None)
        }
    }

    fn active_transaction(
        &self,
        operation: &'static str,
    ) -> Result<TransactionId, TransactionError> {
        match (&self.state, &self.transaction_id) {
            (CoordinatorState::Active, Some(id)) => Ok(id.clone()),
            _ => Err(TransactionStateError::NotStarted { operation }.into()),
        }
    }

    async fn persist_confirm_rows(&mut self) -> Result<(), TransactionError> {
        let log = self.shared.invoker.log();
        let max_retry = self.shared.invoker.max_retry();
        for (inserted, entry) in self.service_list.iter().enumerate() {
            let row =
                NewInvocation::remote(entry.key(Phase::Confirm), entry.args.clone(), max_retry);
            if let Err(err) = log.upsert_wait(row).await {
                for written in &self.service_list[..inserted] {
                    if let Err(err) = log.delete(&written.key(Phase::Confirm)).await {
                        warn!(%err, "Could not remove a confirm row");
                    }
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn replay_cancel(&mut self, transaction_id: TransactionId) -> ReplayHandle {
        if self.service_list.is_empty() {
            return ReplayHandle::none();
        }
        let log = self.shared.invoker.log();
        let max_retry = self.shared.invoker.max_retry();
        for entry in &self.service_list {
            let row =
                NewInvocation::remote(entry.key(Phase::Cancel), entry.args.clone(), max_retry);
            if let Err(err) = log.upsert_wait(row).await {
                warn!(
                    tcc.transaction.id = %transaction_id,
                    %err,
                    "Could not persist a cancel row, the reservation is left to the try timeout"
                );
            }
        }
        self.spawn_replay(transaction_id, Phase::Cancel)
    }

    fn spawn_replay(&self, transaction_id: TransactionId, phase: Phase) -> ReplayHandle {
        Replay {
            transaction_id,
            phase,
            entries: self.service_list.clone(),
            resolver: Arc::clone(&self.shared.resolver),
            log: Arc::clone(self.shared.invoker.log()),
        }
        .spawn()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.state != CoordinatorState::Active {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let mut abandoned = mem::replace(self, Coordinator::idle(shared));
        // not Active anymore: dropping it again, e.g. with a runtime shutting down before the
        // task ran, must not schedule another rollback
        abandoned.state = CoordinatorState::RollingBack;
        let (Ok(runtime), Some(transaction_id)) = (
            tokio::runtime::Handle::try_current(),
            abandoned.transaction_id.clone(),
        ) else {
            error!(
                tcc.transaction.id = ?abandoned.transaction_id,
                "Coordinator dropped outside of a tokio runtime, it cannot be rolled back"
            );
            abandoned.state = CoordinatorState::Done;
            return;
        };
        warn!(
            tcc.transaction.id = %transaction_id,
            "Coordinator dropped while active, rolling back"
        );
        runtime.spawn(async move {
            if let Err(err) = abandoned.finish_rollback(transaction_id).await {
                error!(%err, "Rollback of an abandoned coordinator failed");
            }
        });
    }
}

type LocalTransactions = Vec<(String, Box<dyn LocalTransaction>)>;

async fn commit_local(transactions: LocalTransactions) -> Result<(), PoolError> {
    let mut pending = transactions.into_iter();
    while let Some((name, tx)) = pending.next() {
        if let Err(err) = tx.commit().await {
            warn!(pool = %name, %err, "Local commit failed");
            rollback_local(pending.collect()).await;
            return Err(err);
        }
    }
    Ok(())
}

/// Rolls back every transaction, returning the first failure.
async fn rollback_local(transactions: LocalTransactions) -> Option<PoolError> {
    let mut first_error = None;
    for (name, tx) in transactions {
        if let Err(err) = tx.rollback().await {
            warn!(pool = %name, %err, "Local rollback failed");
            first_error.get_or_insert(err);
        }
    }
    first_error
}
