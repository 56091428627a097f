use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use tokio::time::Instant;

/// Source of "now" in the scheduler's fixed timezone.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock shifted into a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// `None` when the offset is outside ±24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(Self::new)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

/// Clock pinned to `anchor` at construction that advances with tokio time.
///
/// Under a paused tokio runtime the reported wall time moves only when tokio
/// time does, which makes window boundaries reproducible.
#[derive(Debug, Clone)]
pub struct AnchoredClock {
    anchor: DateTime<FixedOffset>,
    started: Instant,
}

impl AnchoredClock {
    pub fn new(anchor: DateTime<FixedOffset>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).unwrap_or(TimeDelta::MAX);
        self.anchor
            .checked_add_signed(elapsed)
            .unwrap_or(self.anchor)
    }
}
