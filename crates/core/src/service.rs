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
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use tcc_storage_api::StorageError;
use tcc_storage_api::invocation_log::{InvocationKey, InvocationStatus};
use tcc_types::errors::GenericError;
use tcc_types::{Payload, Phase, TransactionContext};

/// One phase operation of a service method.
pub trait Handler: Send + Sync + 'static {
    fn invoke(&self, ctx: TransactionContext, args: Payload)
    -> BoxFuture<'static, anyhow::Result<Payload>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(TransactionContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    fn invoke(
        &self,
        ctx: TransactionContext,
        args: Payload,
    ) -> BoxFuture<'static, anyhow::Result<Payload>> {
        (self)(ctx, args).boxed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MethodDispatchError {
    #[error("no transaction phase in context")]
    NoActivePhase,
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("service '{service}' has no method '{method}'")]
    UnknownMethod { service: String, method: String },
    #[error("method '{service}.{method}' does not implement phase {phase}")]
    PhaseNotImplemented {
        service: String,
        method: String,
        phase: Phase,
    },
}

/// A service taking part in sagas, declaring its Try, Confirm and Cancel operations per
/// method.
pub struct ServiceDefinition {
    name: String,
    methods: HashMap<String, HashMap<Phase, Arc<dyn Handler>>>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_handler(
        mut self,
        method: impl Into<String>,
        phase: Phase,
        handler: impl Handler,
    ) -> Self {
        self.methods
            .entry(method.into())
            .or_default()
            .insert(phase, Arc::new(handler));
        self
    }

    /// Declares all three phases of `method` at once.
    pub fn with_tcc_method(
        self,
        method: impl Into<String>,
        try_handler: impl Handler,
        confirm_handler: impl Handler,
        cancel_handler: impl Handler,
    ) -> Self {
        let method = method.into();
        self.with_handler(method.clone(), Phase::Try, try_handler)
            .with_handler(method.clone(), Phase::Confirm, confirm_handler)
            .with_handler(method, Phase::Cancel, cancel_handler)
    }

    pub fn handler(
        &self,
        method: &str,
        phase: Phase,
    ) -> Result<Arc<dyn Handler>, MethodDispatchError> {
        let phases = self
            .methods
            .get(method)
            .ok_or_else(|| MethodDispatchError::UnknownMethod {
                service: self.name.clone(),
                method: method.to_owned(),
            })?;
        phases
            .get(&phase)
            .cloned()
            .ok_or_else(|| MethodDispatchError::PhaseNotImplemented {
                service: self.name.clone(),
                method: method.to_owned(),
                phase,
            })
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Services implemented in this process, by name.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceDefinition>>,
}

impl ServiceRegistry {
    pub fn register(&mut self, definition: ServiceDefinition) {
        self.services
            .insert(definition.name().to_owned(), Arc::new(definition));
    }

    pub fn with_service(mut self, definition: ServiceDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, service: &str) -> Result<Arc<ServiceDefinition>, MethodDispatchError> {
        self.services
            .get(service)
            .cloned()
            .ok_or_else(|| MethodDispatchError::UnknownService(service.to_owned()))
    }
}

/// Result of an idempotent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The phase operation ran now.
    Completed(Payload),
    /// A previous attempt already succeeded, this is its stored result.
    Replayed(Payload),
    /// The Confirm/Cancel operation failed for a remote caller. The participant's log row keeps
    /// retrying it.
    Deferred,
}

impl InvocationOutcome {
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            InvocationOutcome::Completed(p) | InvocationOutcome::Replayed(p) => Some(p),
            InvocationOutcome::Deferred => None,
        }
    }

    pub fn into_payload(self) -> Option<Payload> {
        match self {
            InvocationOutcome::Completed(p) | InvocationOutcome::Replayed(p) => Some(p),
            InvocationOutcome::Deferred => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    MethodDispatch(#[from] MethodDispatchError),
    #[error("try of {key} failed: {source}")]
    TryPhase {
        key: InvocationKey,
        source: anyhow::Error,
    },
    #[error("{key} failed, row is {status}: {source}")]
    Compensation {
        key: InvocationKey,
        status: InvocationStatus,
        source: anyhow::Error,
    },
    #[error("{key} exhausted its retries")]
    RetriesExhausted { key: InvocationKey },
    #[error("service unavailable: {0}")]
    Unavailable(GenericError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl InvocationError {
    /// The failed attempt has already been counted on the row of the same key.
    pub fn bookkeeping_recorded(&self) -> bool {
        matches!(self, InvocationError::Compensation { .. })
    }
}

/// Calls the methods of one service, locally or across the network.
#[async_trait::async_trait]
pub trait ServiceClient: Send + Sync {
    async fn call(
        &self,
        ctx: TransactionContext,
        method: &str,
        args: Payload,
    ) -> Result<InvocationOutcome, InvocationError>;
}

pub trait ServiceResolver: Send + Sync + 'static {
    fn resolve(&self, service: &str) -> Result<Arc<dyn ServiceClient>, InvocationError>;
}
