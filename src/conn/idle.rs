//! Idle-time bookkeeping and the reuse policy.

use std::time::Duration;

/// How long a connection may sit idle and still be reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MaxIdle {
    /// Reusable no matter how long it has been idle.
    #[default]
    Infinite,

    /// Reusable while idle for at most this long.
    Limit(Duration),
}

impl MaxIdle {
    /// Does this limit permit reusing a connection which has been idle for `idle_time`?
    ///
    /// The boundary is inclusive: a connection idle for exactly the limit is reusable.
    pub fn permits(&self, idle_time: Duration) -> bool {
        match self {
            MaxIdle::Infinite => true,
            MaxIdle::Limit(limit) => idle_time <= *limit,
        }
    }
}

impl From<Option<Duration>> for MaxIdle {
    fn from(limit: Option<Duration>) -> Self {
        limit.map_or(MaxIdle::Infinite, MaxIdle::Limit)
    }
}

impl From<Duration> for MaxIdle {
    fn from(limit: Duration) -> Self {
        MaxIdle::Limit(limit)
    }
}

/// Can a connection idle for `idle_time` be reused under `max_idle`?
pub fn reusable(max_idle: MaxIdle, idle_time: Duration) -> bool {
    max_idle.permits(idle_time)
}

/// Units for reporting idle time as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// Nanoseconds
    Nanosecond,
    /// Microseconds
    Microsecond,
    /// Milliseconds
    Millisecond,
    /// Whole seconds
    Second,
}

impl TimeUnit {
    /// Express `duration` in this unit, truncating.
    pub fn convert(&self, duration: Duration) -> u128 {
        match self {
            TimeUnit::Nanosecond => duration.as_nanos(),
            TimeUnit::Microsecond => duration.as_micros(),
            TimeUnit::Millisecond => duration.as_millis(),
            TimeUnit::Second => u128::from(duration.as_secs()),
        }
    }
}
