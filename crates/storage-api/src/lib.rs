// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("generic storage error: {0}")]
    Generic(#[from] anyhow::Error),
    #[error("integrity constraint is violated: {0}")]
    DataIntegrityError(String),
    #[error("operational error that can be caused during a graceful shutdown")]
    OperationalError,
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub mod invocation_log;
