// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Background recovery of TCC sagas.
//!
//! One [`CompensationWorker`] per cluster holds a lease and periodically scans the invocation
//! log: it purges old successes, re-drives pending Confirm/Cancel rows, cancels Try
//! reservations no coordinator ever resolved and reports rows that exhausted their retries.

mod leadership;
mod metric_definitions;
mod worker;

pub use leadership::{Leadership, lease_token, lock_key};
pub use worker::{CompensationWorker, CycleReport, Duty, DutyReport, RowOutcome};
