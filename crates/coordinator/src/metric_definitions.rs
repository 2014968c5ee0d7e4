// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_histogram};

pub const TRANSACTION_BEGIN: &str = "tcc.transaction.begin.total";
pub const TRANSACTION_COMMIT: &str = "tcc.transaction.commit.total";
pub const TRANSACTION_ROLLBACK: &str = "tcc.transaction.rollback.total";

/// dimensioned by "phase" and "outcome" (OUTCOME_*)
pub const INVOCATION: &str = "tcc.invocation.total";
pub const INVOCATION_DURATION: &str = "tcc.invocation.duration.seconds";
pub const INVOCATION_TERMINAL_FAILURE: &str = "tcc.invocation.terminal_failure.total";

/// dimensioned by "phase" and "settlement"
pub const REPLAY_SETTLEMENT: &str = "tcc.replay.settlement.total";

pub const OUTCOME_COMPLETED: &str = "completed";
pub const OUTCOME_REPLAYED: &str = "replayed";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_DEFERRED: &str = "deferred";
pub const OUTCOME_EXHAUSTED: &str = "exhausted";

pub(crate) fn describe_metrics() {
    describe_counter!(
        TRANSACTION_BEGIN,
        Unit::Count,
        "Number of coordinators that began a transaction"
    );
    describe_counter!(
        TRANSACTION_COMMIT,
        Unit::Count,
        "Number of transactions committed by their first node"
    );
    describe_counter!(
        TRANSACTION_ROLLBACK,
        Unit::Count,
        "Number of transactions rolled back"
    );
    describe_counter!(
        INVOCATION,
        Unit::Count,
        "Number of idempotent invocations, dimensioned by phase and outcome"
    );
    describe_histogram!(
        INVOCATION_DURATION,
        Unit::Seconds,
        "Time spent in the phase operation of a service method"
    );
    describe_counter!(
        INVOCATION_TERMINAL_FAILURE,
        Unit::Count,
        "Number of invocations that exhausted their retries"
    );
    describe_counter!(
        REPLAY_SETTLEMENT,
        Unit::Count,
        "Confirm/Cancel replays driven by a coordinator, dimensioned by phase and settlement"
    );
}
