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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use googletest::prelude::*;
use parking_lot::Mutex;
use test_log::test;
use tokio_util::sync::CancellationToken;

use tcc_compensation::{CompensationWorker, Duty, Leadership, lock_key};
use tcc_coordinator::{IdempotentInvoker, LocalServiceResolver};
use tcc_core::test_util::{CallJournal, RecordingService};
use tcc_core::{InMemoryLeaseLock, InvocationError, LeaseLock, LockError, ServiceRegistry};
use tcc_storage_api::invocation_log::{
    InMemoryInvocationLog, InvocationKey, InvocationLog, InvocationStatus, NewInvocation,
};
use tcc_types::config::Configuration;
use tcc_types::time::{ManualClock, MillisSinceEpoch};
use tcc_types::{Payload, Phase, RequestId, TransactionContext, TransactionId};

const QUIET_PERIOD: Duration = Duration::from_secs(61);

struct Harness {
    clock: ManualClock,
    log: InMemoryInvocationLog,
    calls: CallJournal,
    inventory: RecordingService,
    invoker: IdempotentInvoker,
    worker: CompensationWorker,
}

fn harness() -> Harness {
    let clock = ManualClock::new(MillisSinceEpoch::new(1_700_000_000_000));
    let log = InMemoryInvocationLog::with_clock(clock.clone());
    let calls = CallJournal::default();
    let inventory = RecordingService::new("Inventory", calls.clone());
    let registry =
        Arc::new(ServiceRegistry::default().with_service(inventory.definition(&["reserve"])));
    let invoker = IdempotentInvoker::new(Arc::new(log.clone()), 3);
    let resolver = LocalServiceResolver::new(registry.as_ref().clone(), invoker.clone());

    let worker = CompensationWorker::new(
        Configuration::default(),
        registry,
        invoker.clone(),
        Arc::new(resolver),
        Arc::new(InMemoryLeaseLock::default()),
    );
    Harness {
        clock,
        log,
        calls,
        inventory,
        invoker,
        worker,
    }
}

fn ctx(phase: Phase) -> TransactionContext {
    TransactionContext::new(TransactionId::from("tx-1"), phase, RequestId::from("0"))
}

fn key(phase: Phase) -> InvocationKey {
    InvocationKey::from_context(&ctx(phase), "Inventory", "reserve")
}

impl Harness {
    async fn exec(&self, ctx: TransactionContext) -> std::result::Result<(), InvocationError> {
        let definition = self.inventory.definition(&["reserve"]);
        self.invoker
            .exec_service_method(Some(&ctx), &definition, "reserve", "[\"sku-1\"]".into())
            .await
            .map(|_| ())
    }
}

#[test(tokio::test)]
async fn orphaned_try_is_cancelled_after_the_timeout() -> anyhow::Result<()> {
    let mut h = harness();
    h.exec(ctx(Phase::Try)).await?;

    h.clock.advance(Duration::from_secs(100));
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::OrphanTry).unwrap().rows(), eq(0));
    assert_that!(h.calls.count("Inventory", "reserve", Phase::Cancel), eq(0));

    h.clock.advance(Duration::from_secs(21));
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::OrphanTry).unwrap().resolved, eq(1));
    assert_eq!(h.calls.succeeded(Phase::Cancel), vec!["Inventory.reserve@0"]);

    // the cancel superseded the try, nothing is cancelled twice
    assert_eq!(h.log.find(&key(Phase::Try)).await?, None);
    let cancel = h.log.find(&key(Phase::Cancel)).await?.unwrap();
    assert_eq!(cancel.status, InvocationStatus::Success);
    assert!(cancel.is_local);

    h.clock.advance(Duration::from_secs(300));
    h.worker.run_cycle().await;
    assert_that!(h.calls.count("Inventory", "reserve", Phase::Cancel), eq(1));
    Ok(())
}

#[test(tokio::test)]
async fn confirmed_try_is_left_alone() -> anyhow::Result<()> {
    let mut h = harness();
    h.exec(ctx(Phase::Try)).await?;
    h.exec(ctx(Phase::Confirm)).await?;

    h.clock.advance(Duration::from_secs(600));
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::OrphanTry).unwrap().rows(), eq(0));
    assert_that!(h.calls.count("Inventory", "reserve", Phase::Cancel), eq(0));
    Ok(())
}

#[test(tokio::test)]
async fn pending_local_confirm_is_retried_after_the_quiet_period() -> anyhow::Result<()> {
    let mut h = harness();
    h.inventory.fail("reserve", Phase::Confirm, Some(1));
    let err = h
        .exec(ctx(Phase::Confirm).local_request(true))
        .await
        .unwrap_err();
    assert!(err.bookkeeping_recorded());

    // too recent
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::LocalRepair).unwrap().rows(), eq(0));

    h.clock.advance(QUIET_PERIOD);
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::LocalRepair).unwrap().resolved, eq(1));

    let row = h.log.find(&key(Phase::Confirm)).await?.unwrap();
    assert_eq!(row.status, InvocationStatus::Success);
    assert_that!(row.execute_count, eq(2));
    Ok(())
}

#[test(tokio::test)]
async fn pending_remote_cancel_is_driven_and_removed() -> anyhow::Result<()> {
    let mut h = harness();
    h.log
        .upsert_wait(NewInvocation::remote(key(Phase::Cancel), "[\"sku-1\"]".into(), 3))
        .await?;

    h.clock.advance(QUIET_PERIOD);
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::RemoteRepair).unwrap().resolved, eq(1));
    assert_eq!(h.calls.succeeded(Phase::Cancel), vec!["Inventory.reserve@0"]);
    assert!(h.log.is_empty());
    Ok(())
}

#[test(tokio::test)]
async fn failing_compensation_becomes_terminal() -> anyhow::Result<()> {
    let mut h = harness();
    h.inventory.fail("reserve", Phase::Cancel, None);
    h.log
        .upsert_wait(NewInvocation::remote(key(Phase::Cancel), Payload::empty(), 3))
        .await?;

    for attempt in 1..=3u32 {
        h.clock.advance(QUIET_PERIOD);
        let report = h.worker.run_cycle().await;
        assert_that!(report.duty(Duty::RemoteRepair).unwrap().pending, eq(1));

        let row = h.log.find(&key(Phase::Cancel)).await?.unwrap();
        // counted once per attempt, by the participant
        assert_that!(row.execute_count, eq(attempt));
    }

    let row = h.log.find(&key(Phase::Cancel)).await?.unwrap();
    assert_eq!(row.status, InvocationStatus::Fail);

    h.clock.advance(QUIET_PERIOD);
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::RemoteRepair).unwrap().rows(), eq(0));
    assert_that!(report.duty(Duty::TerminalReport).unwrap().pending, eq(1));
    assert_that!(h.calls.count("Inventory", "reserve", Phase::Cancel), eq(3));

    // terminal rows are never purged
    h.clock.advance(Duration::from_secs(5 * 60 * 60));
    h.worker.run_cycle().await;
    assert!(h.log.find(&key(Phase::Cancel)).await?.is_some());
    Ok(())
}

#[test(tokio::test)]
async fn successful_rows_are_purged_after_the_retention() -> anyhow::Result<()> {
    let mut h = harness();
    h.exec(ctx(Phase::Cancel).local_request(true)).await?;

    h.clock.advance(Duration::from_secs(60 * 60));
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::Purge).unwrap().resolved, eq(0));

    h.clock.advance(Duration::from_secs(3 * 60 * 60 + 1));
    let report = h.worker.run_cycle().await;
    assert_that!(report.duty(Duty::Purge).unwrap().resolved, eq(1));
    assert!(h.log.is_empty());
    assert_that!(report.errors(), eq(0));
    Ok(())
}

/// Tracks which tokens currently believe they hold a lease.
#[derive(Clone, Default)]
struct HolderTracking {
    inner: InMemoryLeaseLock,
    holders: Arc<Mutex<HashSet<String>>>,
    acquisitions: Arc<Mutex<Vec<String>>>,
    max_concurrent: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl LeaseLock for HolderTracking {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let acquired = self.inner.acquire(key, token, ttl).await?;
        let mut holders = self.holders.lock();
        if acquired {
            if holders.insert(token.to_owned()) {
                self.acquisitions.lock().push(token.to_owned());
            }
        } else {
            holders.remove(token);
        }
        self.max_concurrent.fetch_max(holders.len(), Ordering::Relaxed);
        Ok(acquired)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        self.holders.lock().remove(token);
        self.inner.release(key, token).await
    }
}

#[test(tokio::test(start_paused = true))]
async fn lease_is_held_by_one_worker_at_a_time() -> anyhow::Result<()> {
    let lock = HolderTracking::default();
    let log = InMemoryInvocationLog::new();
    let registry = Arc::new(ServiceRegistry::default());
    let invoker = IdempotentInvoker::new(Arc::new(log), 3);
    let resolver = Arc::new(LocalServiceResolver::new(
        ServiceRegistry::default(),
        invoker.clone(),
    ));
    let config = Configuration::default();
    let ttl = config.compensation.lease_ttl();

    let cancel = CancellationToken::new();
    let mut workers = Vec::new();
    for token in ["a", "b", "c"] {
        let leadership = Leadership::with_token(
            Arc::new(lock.clone()),
            &config.compensation.app_name,
            token,
            ttl,
        );
        let worker = CompensationWorker::with_leadership(
            config.clone(),
            registry.clone(),
            invoker.clone(),
            resolver.clone(),
            leadership,
        );
        workers.push(tokio::spawn(worker.run(cancel.clone())));
    }

    // dozens of hand-overs between the workers
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    cancel.cancel();
    for worker in workers {
        worker.await?;
    }

    assert_that!(lock.max_concurrent.load(Ordering::Relaxed), eq(1));
    let acquisitions = lock.acquisitions.lock().clone();
    assert_that!(acquisitions.len(), ge(10));
    let distinct: HashSet<_> = acquisitions.iter().cloned().collect();
    assert_that!(distinct.len(), ge(2));

    let key = lock_key(&config.compensation.app_name);
    assert_that!(lock.inner.holder(&key), none());
    assert!(lock.holders.lock().is_empty());
    Ok(())
}
