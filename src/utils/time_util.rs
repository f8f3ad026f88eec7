use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
    time::{self, Duration, SystemTime, UNIX_EPOCH},
};
/// represent a point in time with seconds and fraction of a second in nanoseconds
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct TimeDurationStruct {
    /// seconds
    pub sec: u64,
    /// fraction of a second in nanoseconds
    pub nsec: u32,
}

impl TimeDurationStruct {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self {
            sec: nanos / 1_000_000_000,
            nsec: (nanos % 1_000_000_000) as u32,
        }
    }

    pub const fn as_nanos(&self) -> u64 {
        self.sec * 1_000_000_000 + self.nsec as u64
    }

    /// time elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn saturating_since(&self, earlier: TimeDurationStruct) -> Duration {
        Duration::from_nanos(self.as_nanos().saturating_sub(earlier.as_nanos()))
    }
}

/// calculate what time is it since `1970-1-1 00:00:00`,named as [UNIX_EPOCH]
pub fn now() -> TimeDurationStruct {
    let now = SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .unwrap_or_default();
    TimeDurationStruct {
        sec: now.as_secs(),
        nsec: now.subsec_nanos(),
    }
}

impl From<TimeDurationStruct> for SystemTime {
    fn from(value: TimeDurationStruct) -> Self {
        let duration = Duration::new(value.sec, value.nsec);
        UNIX_EPOCH + duration
    }
}

impl TryFrom<SystemTime> for TimeDurationStruct {
    type Error = anyhow::Error;
    fn try_from(value: SystemTime) -> Result<Self, Self::Error> {
        match value.duration_since(UNIX_EPOCH) {
            Ok(duration) => Ok(TimeDurationStruct {
                sec: duration.as_secs(),
                nsec: duration.subsec_nanos(),
            }),
            Err(before_epoch_error) => Err(anyhow!(
                "doesn't support time before UNIX_EPOCH: {}",
                before_epoch_error
            )),
        }
    }
}

/// source of every timestamp the filesystem records
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> TimeDurationStruct;
}

/// wall clock, clamped so it never goes backwards within one run
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl Clock for SystemClock {
    fn now(&self) -> TimeDurationStruct {
        let wall = now().as_nanos();
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        TimeDurationStruct::from_nanos(previous.max(wall))
    }
}

/// a clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start: TimeDurationStruct) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeDurationStruct {
        TimeDurationStruct::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}
