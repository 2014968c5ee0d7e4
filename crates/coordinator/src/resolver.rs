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

use tcc_core::{
    InvocationError, InvocationOutcome, ServiceClient, ServiceDefinition, ServiceRegistry,
    ServiceResolver,
};
use tcc_types::{Payload, TransactionContext};

use crate::invoker::IdempotentInvoker;

/// Resolves services hosted by this process. Calls go straight to the idempotent invoker as
/// local requests.
#[derive(Clone)]
pub struct LocalServiceResolver {
    registry: Arc<ServiceRegistry>,
    invoker: IdempotentInvoker,
}

impl LocalServiceResolver {
    pub fn new(registry: ServiceRegistry, invoker: IdempotentInvoker) -> Self {
        Self {
            registry: Arc::new(registry),
            invoker,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }
}

impl ServiceResolver for LocalServiceResolver {
    fn resolve(&self, service: &str) -> Result<Arc<dyn ServiceClient>, InvocationError> {
        let definition = self.registry.get(service)?;
        Ok(Arc::new(LocalServiceClient {
            definition,
            invoker: self.invoker.clone(),
        }))
    }
}

struct LocalServiceClient {
    definition: Arc<ServiceDefinition>,
    invoker: IdempotentInvoker,
}

#[async_trait::async_trait]
impl ServiceClient for LocalServiceClient {
    async fn call(
        &self,
        ctx: TransactionContext,
        method: &str,
        args: Payload,
    ) -> Result<InvocationOutcome, InvocationError> {
        let ctx = ctx.local_request(true);
        self.invoker
            .exec_service_method(Some(&ctx), &self.definition, method, args)
            .await
    }
}
