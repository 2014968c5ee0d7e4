// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fixtures recording what the coordinator does to services and connection pools.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use tcc_types::{Payload, Phase, RequestId, TransactionContext, TransactionId};

use crate::db::{ConnectionPool, LocalTransaction, PoolError, PoolOperation};
use crate::service::ServiceDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub service: String,
    pub method: String,
    pub phase: Phase,
    pub transaction_id: TransactionId,
    pub request_id: RequestId,
    pub is_local_request: bool,
    pub args: Payload,
    pub failed: bool,
}

/// Every phase operation executed by [`RecordingService`]s sharing the journal, in call order.
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Arc<Mutex<Vec<RecordedCall>>>);

impl CallJournal {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.0.lock().clone()
    }

    /// Successful calls of `phase` as `service.method@request`.
    pub fn succeeded(&self, phase: Phase) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|c| c.phase == phase && !c.failed)
            .map(|c| format!("{}.{}@{}", c.service, c.method, c.request_id))
            .collect()
    }

    pub fn count(&self, service: &str, method: &str, phase: Phase) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|c| c.service == service && c.method == method && c.phase == phase)
            .count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn push(&self, call: RecordedCall) {
        self.0.lock().push(call);
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Always,
    Times(u32),
}

/// A service whose phase operations record themselves and fail on demand.
///
/// Successful operations return the JSON string `"<service>.<method><phase>"`.
#[derive(Debug, Clone)]
pub struct RecordingService {
    name: String,
    journal: CallJournal,
    faults: Arc<Mutex<HashMap<(String, Phase), Fault>>>,
}

impl RecordingService {
    pub fn new(name: impl Into<String>, journal: CallJournal) -> Self {
        Self {
            name: name.into(),
            journal,
            faults: Arc::default(),
        }
    }

    /// Makes `method` fail in `phase`, for the next `times` calls or forever.
    pub fn fail(&self, method: &str, phase: Phase, times: Option<u32>) {
        let fault = times.map_or(Fault::Always, Fault::Times);
        self.faults.lock().insert((method.to_owned(), phase), fault);
    }

    pub fn heal(&self, method: &str, phase: Phase) {
        self.faults.lock().remove(&(method.to_owned(), phase));
    }

    /// A definition exposing Try, Confirm and Cancel for each of `methods`.
    pub fn definition(&self, methods: &[&str]) -> ServiceDefinition {
        let mut definition = ServiceDefinition::new(self.name.clone());
        for method in methods {
            for phase in [Phase::Try, Phase::Confirm, Phase::Cancel] {
                let this = self.clone();
                let method_name = (*method).to_owned();
                definition = definition.with_handler(
                    *method,
                    phase,
                    move |ctx: TransactionContext, args: Payload| {
                        let outcome = this.execute(&method_name, phase, ctx, args);
                        async move { outcome }
                    },
                );
            }
        }
        definition
    }

    fn should_fail(&self, method: &str, phase: Phase) -> bool {
        let mut faults = self.faults.lock();
        let key = (method.to_owned(), phase);
        match faults.get_mut(&key) {
            Some(Fault::Always) => true,
            Some(Fault::Times(n)) => {
                *n -= 1;
                if *n == 0 {
                    faults.remove(&key);
                }
                true
            }
            None => false,
        }
    }

    fn execute(
        &self,
        method: &str,
        phase: Phase,
        ctx: TransactionContext,
        args: Payload,
    ) -> anyhow::Result<Payload> {
        assert_eq!(ctx.phase, phase, "handler invoked under the wrong phase");
        let failed = self.should_fail(method, phase);
        self.journal.push(RecordedCall {
            service: self.name.clone(),
            method: method.to_owned(),
            phase,
            transaction_id: ctx.transaction_id,
            request_id: ctx.transaction_req,
            is_local_request: ctx.is_local_request,
            args,
            failed,
        });
        if failed {
            anyhow::bail!("{}.{method}{phase} failed", self.name);
        }
        Ok(Payload::json(&format!("{}.{method}{phase}", self.name))?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEvent {
    pub pool: String,
    pub operation: PoolOperation,
}

/// Operations executed on [`RecordingPool`]s sharing the journal.
#[derive(Debug, Clone, Default)]
pub struct PoolJournal(Arc<Mutex<Vec<PoolEvent>>>);

impl PoolJournal {
    pub fn events(&self) -> Vec<PoolEvent> {
        self.0.lock().clone()
    }

    pub fn operations(&self, pool: &str) -> Vec<PoolOperation> {
        self.0
            .lock()
            .iter()
            .filter(|e| e.pool == pool)
            .map(|e| e.operation)
            .collect()
    }

    fn push(&self, pool: &str, operation: PoolOperation) {
        self.0.lock().push(PoolEvent {
            pool: pool.to_owned(),
            operation,
        });
    }
}

#[derive(Debug, Clone)]
pub struct RecordingPool {
    name: String,
    journal: PoolJournal,
}

impl RecordingPool {
    pub fn new(name: impl Into<String>, journal: PoolJournal) -> Self {
        Self {
            name: name.into(),
            journal,
        }
    }
}

struct RecordingTransaction {
    pool: String,
    journal: PoolJournal,
}

#[async_trait::async_trait]
impl ConnectionPool for RecordingPool {
    async fn begin(&self) -> Result<Box<dyn LocalTransaction>, PoolError> {
        self.journal.push(&self.name, PoolOperation::Begin);
        Ok(Box::new(RecordingTransaction {
            pool: self.name.clone(),
            journal: self.journal.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl LocalTransaction for RecordingTransaction {
    async fn commit(self: Box<Self>) -> Result<(), PoolError> {
        self.journal.push(&self.pool, PoolOperation::Commit);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PoolError> {
        self.journal.push(&self.pool, PoolOperation::Rollback);
        Ok(())
    }
}
