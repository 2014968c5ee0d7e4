// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tcc_core::{InvocationError, PoolError};
use tcc_storage_api::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum TransactionStateError {
    #[error("transaction already started")]
    AlreadyStarted,
    #[error("cannot {operation}: no active transaction")]
    NotStarted { operation: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error(transparent)]
    State(#[from] TransactionStateError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to encode or decode a payload: {0}")]
    Codec(#[from] serde_json::Error),
}
