// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

use crate::identifiers::{RequestId, TransactionId};

/// Phase of a TCC invocation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
    strum_macros::VariantArray,
)]
pub enum Phase {
    Try,
    Confirm,
    Cancel,
}

impl Phase {
    /// Phases replayed by commit/rollback and repaired by the compensation worker.
    pub const COMPENSATING: [Phase; 2] = [Phase::Confirm, Phase::Cancel];

    pub fn is_compensating(&self) -> bool {
        matches!(self, Phase::Confirm | Phase::Cancel)
    }
}

/// Context carried by every invocation of a saga.
///
/// It is passed explicitly across every invocation boundary and serialized across network hops.
/// `is_first_node` and `is_local_request` only make sense within one process and are therefore
/// never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransactionContext {
    pub transaction_id: TransactionId,
    #[serde(rename = "transaction-type")]
    pub phase: Phase,
    pub transaction_req: RequestId,
    #[serde(default)]
    pub parent_req: RequestId,
    #[serde(skip)]
    pub is_first_node: bool,
    #[serde(skip)]
    pub is_local_request: bool,
}

impl TransactionContext {
    pub fn new(transaction_id: TransactionId, phase: Phase, transaction_req: RequestId) -> Self {
        Self {
            transaction_id,
            phase,
            transaction_req,
            parent_req: RequestId::default(),
            is_first_node: false,
            is_local_request: false,
        }
    }

    pub fn with_parent(mut self, parent_req: RequestId) -> Self {
        self.parent_req = parent_req;
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn first_node(mut self, is_first_node: bool) -> Self {
        self.is_first_node = is_first_node;
        self
    }

    /// Marks the call as issued synchronously from within the same process. Confirm/Cancel
    /// failures are only reported back to such callers.
    pub fn local_request(mut self, is_local_request: bool) -> Self {
        self.is_local_request = is_local_request;
        self
    }

    /// The context as seen by the callee of a network hop.
    pub fn for_remote_hop(&self) -> Self {
        Self {
            is_first_node: false,
            is_local_request: false,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    use googletest::prelude::*;

    fn context() -> TransactionContext {
        TransactionContext::new(
            TransactionId::from("tx-1"),
            Phase::Try,
            RequestId::from("0"),
        )
        .first_node(true)
        .local_request(true)
    }

    #[test]
    fn phase_names_match_the_persisted_form() {
        assert_eq!(Phase::Confirm.to_string(), "Confirm");
        assert_eq!(Phase::from_str("Cancel").unwrap(), Phase::Cancel);
        assert_that!(Phase::Try.is_compensating(), eq(false));
        assert_that!(Phase::Cancel.is_compensating(), eq(true));
    }

    #[test]
    fn remote_hop_clears_process_local_flags() {
        let hop = context().for_remote_hop();
        assert_that!(hop.is_first_node, eq(false));
        assert_that!(hop.is_local_request, eq(false));
        assert_eq!(hop.transaction_req, RequestId::from("0"));
    }

    #[test]
    fn serialized_context_omits_process_local_flags() {
        let json = serde_json::to_value(context()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "transaction-id": "tx-1",
                "transaction-type": "Try",
                "transaction-req": "0",
                "parent-req": "",
            })
        );

        let decoded: TransactionContext = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, context().for_remote_hop());
    }
}
