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
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, error, instrument, warn};

use tcc_core::{InvocationError, InvocationOutcome, MethodDispatchError, ServiceDefinition};
use tcc_storage_api::invocation_log::{
    InvocationKey, InvocationLog, InvocationStatus, NewInvocation,
};
use tcc_types::{Payload, Phase, TransactionContext};

use crate::metric_definitions::{
    INVOCATION, INVOCATION_DURATION, INVOCATION_TERMINAL_FAILURE, OUTCOME_COMPLETED,
    OUTCOME_DEFERRED, OUTCOME_EXHAUSTED, OUTCOME_FAILED, OUTCOME_REPLAYED,
};

/// Runs phase operations of local services at most once per idempotency key.
#[derive(Clone)]
pub struct IdempotentInvoker {
    log: Arc<dyn InvocationLog>,
    max_retry: u32,
}

impl IdempotentInvoker {
    pub fn new(log: Arc<dyn InvocationLog>, max_retry: u32) -> Self {
        Self { log, max_retry }
    }

    pub fn log(&self) -> &Arc<dyn InvocationLog> {
        &self.log
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Executes `service.method` under the phase found in `ctx`.
    ///
    /// A key that already succeeded returns its stored result, a key that failed terminally
    /// returns [`InvocationError::RetriesExhausted`]. In both cases the handler is not invoked.
    /// A failed Try removes its row. A failed Confirm/Cancel counts the attempt and is only
    /// reported to local callers; remote callers get [`InvocationOutcome::Deferred`].
    pub async fn exec_service_method(
        &self,
        ctx: Option<&TransactionContext>,
        service: &ServiceDefinition,
        method: &str,
        args: Payload,
    ) -> Result<InvocationOutcome, InvocationError> {
        let ctx = ctx.ok_or(MethodDispatchError::NoActivePhase)?;
        self.invoke(ctx, service, method, args).await
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(
            tcc.transaction.id = %ctx.transaction_id,
            tcc.request.id = %ctx.transaction_req,
            tcc.phase = %ctx.phase,
            tcc.service = service.name(),
            tcc.method = method,
        )
    )]
    async fn invoke(
        &self,
        ctx: &TransactionContext,
        service: &ServiceDefinition,
        method: &str,
        args: Payload,
    ) -> Result<InvocationOutcome, InvocationError> {
        let handler = service.handler(method, ctx.phase)?;
        let key = InvocationKey::from_context(ctx, service.name(), method);
        let phase: &'static str = ctx.phase.into();

        match self.log.find(&key).await? {
            Some(row) if row.status == InvocationStatus::Success => {
                debug!("Returning the stored result of a previous attempt");
                counter!(INVOCATION, "phase" => phase, "outcome" => OUTCOME_REPLAYED).increment(1);
                return Ok(InvocationOutcome::Replayed(
                    row.service_result.unwrap_or_default(),
                ));
            }
            Some(row) if row.status == InvocationStatus::Fail => {
                counter!(INVOCATION, "phase" => phase, "outcome" => OUTCOME_EXHAUSTED)
                    .increment(1);
                return Err(InvocationError::RetriesExhausted { key });
            }
            Some(_) => {}
            None => {
                self.log
                    .upsert_wait(NewInvocation::local(
                        key.clone(),
                        args.clone(),
                        self.max_retry,
                    ))
                    .await?;
            }
        }

        if ctx.phase != Phase::Try
            && self
                .log
                .delete_if_status(&key.with_phase(Phase::Try), InvocationStatus::Success)
                .await?
        {
            debug!("Removed the superseded try row");
        }

        let started = Instant::now();
        let result = handler.invoke(ctx.clone(), args).await;
        histogram!(INVOCATION_DURATION, "phase" => phase).record(started.elapsed());

        match result {
            Ok(payload) => {
                self.log.mark_success(&key, payload.clone()).await?;
                counter!(INVOCATION, "phase" => phase, "outcome" => OUTCOME_COMPLETED)
                    .increment(1);
                Ok(InvocationOutcome::Completed(payload))
            }
            Err(err) if ctx.phase == Phase::Try => {
                self.log.delete(&key).await?;
                counter!(INVOCATION, "phase" => phase, "outcome" => OUTCOME_FAILED).increment(1);
                debug!(error = %err, "Try failed, its row was removed");
                Err(InvocationError::TryPhase { key, source: err })
            }
            Err(err) => {
                let status = self
                    .log
                    .mark_retry_or_fail(&key)
                    .await?
                    .unwrap_or(InvocationStatus::Wait);
                if status == InvocationStatus::Fail {
                    error!(
                        error = %err,
                        "Invocation exhausted its retries and needs manual intervention"
                    );
                    counter!(INVOCATION_TERMINAL_FAILURE, "phase" => phase).increment(1);
                } else {
                    warn!(error = %err, "Invocation failed, it will be retried");
                }

                if ctx.is_local_request {
                    counter!(INVOCATION, "phase" => phase, "outcome" => OUTCOME_FAILED)
                        .increment(1);
                    Err(InvocationError::Compensation {
                        key,
                        status,
                        source: err,
                    })
                } else {
                    counter!(INVOCATION, "phase" => phase, "outcome" => OUTCOME_DEFERRED)
                        .increment(1);
                    Ok(InvocationOutcome::Deferred)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;
    use test_log::test;

    use tcc_core::test_util::{CallJournal, RecordingService};
    use tcc_storage_api::invocation_log::InMemoryInvocationLog;
    use tcc_types::{RequestId, TransactionId};

    struct Fixture {
        log: InMemoryInvocationLog,
        invoker: IdempotentInvoker,
        calls: CallJournal,
        service: RecordingService,
        definition: ServiceDefinition,
    }

    fn fixture(max_retry: u32) -> Fixture {
        let log = InMemoryInvocationLog::new();
        let calls = CallJournal::default();
        let service = RecordingService::new("Inventory", calls.clone());
        let definition = service.definition(&["reserve"]);
        Fixture {
            invoker: IdempotentInvoker::new(Arc::new(log.clone()), max_retry),
            log,
            calls,
            service,
            definition,
        }
    }

    fn ctx(phase: Phase) -> TransactionContext {
        TransactionContext::new(TransactionId::from("tx-1"), phase, RequestId::from("0"))
    }

    fn key(phase: Phase) -> InvocationKey {
        InvocationKey::from_context(&ctx(phase), "Inventory", "reserve")
    }

    #[test(tokio::test)]
    async fn missing_phase_is_a_dispatch_error() {
        let f = fixture(3);
        let err = f
            .invoker
            .exec_service_method(None, &f.definition, "reserve", Payload::empty())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvocationError::MethodDispatch(MethodDispatchError::NoActivePhase)
        ));
    }

    #[test(tokio::test)]
    async fn success_is_replayed_without_invoking_again() -> anyhow::Result<()> {
        let f = fixture(3);
        let first = f
            .invoker
            .exec_service_method(Some(&ctx(Phase::Try)), &f.definition, "reserve", "[1]".into())
            .await?;
        let second = f
            .invoker
            .exec_service_method(Some(&ctx(Phase::Try)), &f.definition, "reserve", "[1]".into())
            .await?;

        assert!(matches!(first, InvocationOutcome::Completed(_)));
        assert_eq!(second, InvocationOutcome::Replayed(first.into_payload().unwrap()));
        assert_that!(f.calls.count("Inventory", "reserve", Phase::Try), eq(1));

        let row = f.log.find(&key(Phase::Try)).await?.unwrap();
        assert_eq!(row.status, InvocationStatus::Success);
        assert_that!(row.is_local, eq(true));
        assert_that!(row.execute_count, eq(1));
        Ok(())
    }

    #[test(tokio::test)]
    async fn failed_try_leaves_no_row() -> anyhow::Result<()> {
        let f = fixture(3);
        f.service.fail("reserve", Phase::Try, None);

        let err = f
            .invoker
            .exec_service_method(Some(&ctx(Phase::Try)), &f.definition, "reserve", "[1]".into())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::TryPhase { .. }));
        assert!(f.log.is_empty());
        Ok(())
    }

    #[test(tokio::test)]
    async fn cancel_supersedes_the_try_row() -> anyhow::Result<()> {
        let f = fixture(3);
        f.invoker
            .exec_service_method(Some(&ctx(Phase::Try)), &f.definition, "reserve", "[1]".into())
            .await?;
        f.invoker
            .exec_service_method(
                Some(&ctx(Phase::Cancel)),
                &f.definition,
                "reserve",
                "[1]".into(),
            )
            .await?;

        assert_eq!(f.log.find(&key(Phase::Try)).await?, None);
        let cancel = f.log.find(&key(Phase::Cancel)).await?.unwrap();
        assert_eq!(cancel.status, InvocationStatus::Success);
        Ok(())
    }

    #[test(tokio::test)]
    async fn local_callers_see_compensation_failures_until_exhausted() -> anyhow::Result<()> {
        let f = fixture(3);
        f.service.fail("reserve", Phase::Confirm, None);
        let local = ctx(Phase::Confirm).local_request(true);

        let mut statuses = vec![];
        for _ in 0..3 {
            match f
                .invoker
                .exec_service_method(Some(&local), &f.definition, "reserve", "[1]".into())
                .await
            {
                Err(InvocationError::Compensation { status, .. }) => statuses.push(status),
                other => panic!("unexpected result {other:?}"),
            }
        }
        assert_eq!(
            statuses,
            vec![
                InvocationStatus::Wait,
                InvocationStatus::Wait,
                InvocationStatus::Fail
            ]
        );

        // Fail is terminal, the handler is not called anymore
        let err = f
            .invoker
            .exec_service_method(Some(&local), &f.definition, "reserve", "[1]".into())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::RetriesExhausted { .. }));
        assert_that!(f.calls.count("Inventory", "reserve", Phase::Confirm), eq(3));
        Ok(())
    }

    #[test(tokio::test)]
    async fn remote_callers_get_a_deferred_outcome() -> anyhow::Result<()> {
        let f = fixture(3);
        f.service.fail("reserve", Phase::Cancel, Some(1));

        let outcome = f
            .invoker
            .exec_service_method(
                Some(&ctx(Phase::Cancel)),
                &f.definition,
                "reserve",
                "[1]".into(),
            )
            .await?;
        assert_eq!(outcome, InvocationOutcome::Deferred);

        let row = f.log.find(&key(Phase::Cancel)).await?.unwrap();
        assert_eq!(row.status, InvocationStatus::Wait);
        assert_that!(row.execute_count, eq(1));
        Ok(())
    }
}
