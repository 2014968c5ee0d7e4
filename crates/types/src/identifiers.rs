// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identifiers used by the coordinator and the invocation log.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use ulid::Ulid;
use xxhash_rust::xxh3::xxh3_64;

/// Process-wide sequence disambiguating transaction ids generated in the same millisecond.
static LOCAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_local_sequence() -> u64 {
    LOCAL_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

/// Identifies a whole saga. It stays the same on every node of the call chain.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generates a fresh id of the form `<ulid>-<pid>-<local sequence>`.
    pub fn generate() -> Self {
        Self(format!(
            "{}-{}-{}",
            Ulid::new(),
            std::process::id(),
            next_local_sequence()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TransactionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Hierarchical request id: `parent-localcounter-index`.
///
/// The empty id is the parent of a saga's entry point.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` was issued below `ancestor` in the call graph.
    pub fn descends_from(&self, ancestor: &RequestId) -> bool {
        ancestor.is_empty()
            || self
                .0
                .strip_prefix(ancestor.as_str())
                .is_some_and(|rest| rest.starts_with('-'))
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Generates the request ids of one coordinator.
///
/// The first node of a saga emits `[parent-]index`. A joined node emits
/// `[parent-]localcounter-index`, where `localcounter` is a digest of the transaction and the
/// inbound request. A participant joining the same inbound request again, under any phase,
/// therefore issues the same ids as before, so its nested Confirm/Cancel and redelivered Trys
/// land on the rows of the original nested Trys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdSequence {
    prefix: String,
    next_index: u32,
}

impl RequestIdSequence {
    pub fn first_node(parent: &RequestId) -> Self {
        let mut prefix = String::new();
        if !parent.is_empty() {
            let _ = write!(prefix, "{parent}-");
        }
        Self {
            prefix,
            next_index: 0,
        }
    }

    pub fn joined_node(transaction_id: &TransactionId, parent: &RequestId) -> Self {
        let mut sequence = Self::first_node(parent);
        let _ = write!(
            sequence.prefix,
            "{:08x}-",
            local_counter(transaction_id, parent)
        );
        sequence
    }

    /// The request id the next outgoing call will carry.
    pub fn current(&self) -> RequestId {
        RequestId(format!("{}{}", self.prefix, self.next_index))
    }

    /// Moves to the next request id and returns it.
    pub fn advance(&mut self) -> RequestId {
        self.next_index += 1;
        self.current()
    }

    pub fn issued(&self) -> u32 {
        self.next_index
    }
}

fn local_counter(transaction_id: &TransactionId, parent: &RequestId) -> u32 {
    let digest = xxh3_64(format!("{transaction_id}/{parent}").as_bytes());
    // truncated to 32 bits
    (digest & u64::from(u32::MAX)) as u32
}
