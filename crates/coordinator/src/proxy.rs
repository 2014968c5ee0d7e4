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

use serde::Serialize;
use serde::de::DeserializeOwned;

use tcc_core::{InvocationOutcome, ServiceClient};
use tcc_types::Payload;

use crate::coordinator::Coordinator;
use crate::error::TransactionError;

/// Calls one service on behalf of a [`Coordinator`].
///
/// Each successful call gets a fresh request id. Successful Try calls are recorded for the
/// coordinator's commit or rollback. Failed calls record nothing.
pub struct ServiceProxy<'a> {
    coordinator: &'a mut Coordinator,
    service: String,
    client: Arc<dyn ServiceClient>,
}

impl<'a> ServiceProxy<'a> {
    pub(crate) fn new(
        coordinator: &'a mut Coordinator,
        service: String,
        client: Arc<dyn ServiceClient>,
    ) -> Self {
        Self {
            coordinator,
            service,
            client,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn call(
        &mut self,
        method: &str,
        args: Payload,
    ) -> Result<InvocationOutcome, TransactionError> {
        self.coordinator
            .call_through(&self.service, self.client.as_ref(), method, args)
            .await
    }

    /// Like [`ServiceProxy::call`] with JSON encoded arguments and result. `None` if the call
    /// was deferred.
    pub async fn call_json<A, R>(
        &mut self,
        method: &str,
        args: &A,
    ) -> Result<Option<R>, TransactionError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let outcome = self.call(method, Payload::json(args)?).await?;
        Ok(outcome.payload().map(Payload::decode).transpose()?)
    }
}
