//! Utilities for telling and faking time
//!
//! Session expiry is tracked in whole seconds since the Unix epoch (that is what
//! the auth server hands out), while the refresh scheduler reasons in
//! milliseconds. Both representations live here, together with a [`Clock`]
//! abstraction so that expiry logic can be driven by a [`TestClock`] in tests.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time in seconds
///
/// The number of whole seconds elapsed since 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct UnixTime(pub u64);

/// Unix time in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct UnixTimeMs(pub u64);

/// A duration measured in whole seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct DurationSecs(pub u64);

impl From<SystemTime> for UnixTimeMs {
    #[inline]
    fn from(t: SystemTime) -> Self {
        // Clocks set before 1970 are clamped to the epoch.
        let elapsed = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();

        UnixTimeMs(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

impl From<SystemTime> for UnixTime {
    #[inline]
    fn from(t: SystemTime) -> Self {
        UnixTimeMs::from(t).into()
    }
}

impl From<UnixTimeMs> for UnixTime {
    #[inline]
    fn from(t: UnixTimeMs) -> Self {
        UnixTime(t.0 / 1000)
    }
}

impl From<UnixTime> for UnixTimeMs {
    #[inline]
    fn from(t: UnixTime) -> Self {
        UnixTimeMs(t.0.saturating_mul(1000))
    }
}

impl UnixTimeMs {
    /// Signed number of milliseconds from `self` until `later`
    ///
    /// Negative when `later` is actually in the past relative to `self`.
    #[inline]
    pub fn millis_until(self, later: UnixTimeMs) -> i64 {
        let diff = i128::from(later.0) - i128::from(self.0);
        i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
    }
}

impl ops::Add<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        UnixTime(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> Self::Output {
        UnixTime(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Sub for UnixTime {
    type Output = DurationSecs;

    /// Saturates at zero when `rhs` is later than `self`
    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        DurationSecs(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Add<Duration> for UnixTimeMs {
    type Output = UnixTimeMs;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        let millis = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        UnixTimeMs(self.0.saturating_add(millis))
    }
}

impl From<DurationSecs> for Duration {
    #[inline]
    fn from(d: DurationSecs) -> Self {
        Duration::from_secs(d.0)
    }
}

impl From<Duration> for DurationSecs {
    /// Truncates any sub-second remainder
    #[inline]
    fn from(d: Duration) -> Self {
        DurationSecs(d.as_secs())
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
mod serde_impls {
    use super::*;

    macro_rules! transparent_u64 {
        ($($ty:ident),*) => {$(
            impl Serialize for $ty {
                #[inline]
                fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    self.0.serialize(serializer)
                }
            }

            impl<'de> Deserialize<'de> for $ty {
                #[inline]
                fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    // Some servers emit fractional seconds; keep the whole part.
                    let raw = f64::deserialize(deserializer)?;
                    if raw.is_finite() && raw >= 0.0 {
                        Ok(Self(raw.trunc() as u64))
                    } else {
                        Err(serde::de::Error::custom("expected a non-negative number"))
                    }
                }
            }
        )*};
    }

    transparent_u64!(UnixTime, UnixTimeMs, DurationSecs);
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time in milliseconds according to this clock
    fn now_ms(&self) -> UnixTimeMs;

    /// Gets the current time in whole seconds according to this clock
    #[inline]
    fn now(&self) -> UnixTime {
        self.now_ms().into()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now_ms(&self) -> UnixTimeMs {
        (**self).now_ms()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now_ms(&self) -> UnixTimeMs {
        (**self).now_ms()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now_ms(&self) -> UnixTimeMs {
        UnixTimeMs::from(SystemTime::now())
    }
}

/// A test clock whose time only moves when told to
///
/// Clones share the same underlying time, so a clock handed to a component can
/// still be advanced from the test body.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now_ms(&self) -> UnixTimeMs {
        UnixTimeMs(self.0.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock reading `time`
    pub fn new(time: impl Into<UnixTimeMs>) -> Self {
        Self(Arc::new(AtomicU64::new(time.into().0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: impl Into<UnixTimeMs>) {
        self.0.store(val.into().0, Ordering::Release);
    }

    /// Moves the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.0.fetch_add(millis, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(UnixTime(1_000));
        let handle = clock.clone();

        handle.advance(Duration::from_millis(2_500));

        assert_eq!(clock.now_ms(), UnixTimeMs(1_002_500));
        assert_eq!(clock.now(), UnixTime(1_002));
    }

    #[test]
    fn millis_until_is_signed() {
        let now = UnixTimeMs(10_000);
        assert_eq!(now.millis_until(UnixTimeMs(12_500)), 2_500);
        assert_eq!(now.millis_until(UnixTimeMs(9_000)), -1_000);
    }

    #[test]
    fn unix_time_arithmetic_saturates() {
        assert_eq!(UnixTime(5) - UnixTime(10), DurationSecs(0));
        assert_eq!(UnixTime(5) - DurationSecs(10), UnixTime(0));
        assert_eq!(UnixTime(u64::MAX) + DurationSecs(1), UnixTime(u64::MAX));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_fractional_seconds() {
        let t: UnixTime = serde_json::from_str("1700000000.75").unwrap();
        assert_eq!(t, UnixTime(1_700_000_000));

        let err = serde_json::from_str::<DurationSecs>("-3");
        assert!(err.is_err());
    }
}
