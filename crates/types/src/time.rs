// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::fmt::Display;
use std::ops::Add;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Milliseconds since the unix epoch
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct MillisSinceEpoch(u64);

impl MillisSinceEpoch {
    pub const UNIX_EPOCH: MillisSinceEpoch = MillisSinceEpoch::new(0);
    pub const MAX: MillisSinceEpoch = MillisSinceEpoch::new(u64::MAX);

    pub const fn new(millis_since_epoch: u64) -> Self {
        MillisSinceEpoch(millis_since_epoch)
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Moves the timestamp back by `duration`, clamping at the epoch.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// Time elapsed between `self` and `later`, zero if `later` is not after `self`.
    pub fn duration_until(&self, later: MillisSinceEpoch) -> Duration {
        Duration::from_millis(later.0.saturating_sub(self.0))
    }
}

impl From<u64> for MillisSinceEpoch {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<SystemTime> for MillisSinceEpoch {
    fn from(value: SystemTime) -> Self {
        // clocks before the epoch are clamped to it
        let millis = value
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        MillisSinceEpoch::new(millis)
    }
}

impl From<MillisSinceEpoch> for SystemTime {
    fn from(value: MillisSinceEpoch) -> Self {
        SystemTime::UNIX_EPOCH.add(Duration::from_millis(value.as_u64()))
    }
}

impl Display for MillisSinceEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms since epoch", self.0)
    }
}

/// Source of the wall-clock time stamped on invocation log rows.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> MillisSinceEpoch;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> MillisSinceEpoch {
        MillisSinceEpoch::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: MillisSinceEpoch) -> Self {
        Self(Arc::new(AtomicU64::new(start.as_u64())))
    }

    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.0.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn set(&self, to: MillisSinceEpoch) {
        self.0.store(to.as_u64(), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MillisSinceEpoch {
        MillisSinceEpoch::new(self.0.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(MillisSinceEpoch::new(1_000));
        let other = clock.clone();
        other.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), MillisSinceEpoch::new(3_000));

        clock.set(MillisSinceEpoch::new(10));
        assert_eq!(other.now().as_u64(), 10);
    }

    #[test]
    fn saturating_sub_clamps_at_epoch() {
        let ts = MillisSinceEpoch::new(500);
        assert_eq!(ts.saturating_sub(Duration::from_secs(1)), MillisSinceEpoch::UNIX_EPOCH);
        assert_eq!(
            ts.saturating_sub(Duration::from_millis(200)).duration_until(ts),
            Duration::from_millis(200)
        );
    }
}
