// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const LEASE_ACQUIRED: &str = "tcc.compensation.lease.acquired.total";
pub const CYCLE: &str = "tcc.compensation.cycle.total";
pub const CYCLE_DURATION: &str = "tcc.compensation.cycle.duration.seconds";

/// dimensioned by "duty" and "outcome"
pub const ROW_OUTCOME: &str = "tcc.compensation.row.total";
pub const PURGED_ROWS: &str = "tcc.compensation.purged.total";

pub const TERMINAL_ROWS: &str = "tcc.compensation.terminal_rows";
pub const TERMINAL_REPORTED: &str = "tcc.compensation.terminal_reported.total";

pub(crate) fn describe_metrics() {
    describe_counter!(
        LEASE_ACQUIRED,
        Unit::Count,
        "Number of times this worker acquired the compensation lease"
    );
    describe_counter!(CYCLE, Unit::Count, "Number of compensation cycles run");
    describe_histogram!(
        CYCLE_DURATION,
        Unit::Seconds,
        "Time spent running all duties of a compensation cycle"
    );
    describe_counter!(
        ROW_OUTCOME,
        Unit::Count,
        "Rows handled by the compensation worker, dimensioned by duty and outcome"
    );
    describe_counter!(
        PURGED_ROWS,
        Unit::Count,
        "Successful invocation rows removed after their retention"
    );
    describe_gauge!(
        TERMINAL_ROWS,
        Unit::Count,
        "Invocation rows in the Fail status, waiting for an operator"
    );
    describe_counter!(
        TERMINAL_REPORTED,
        Unit::Count,
        "Terminal rows reported for the first time by this worker"
    );
}
