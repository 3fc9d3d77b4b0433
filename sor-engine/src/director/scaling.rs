//! Elastic registration: when to open and close the second window.

/// Best estimate of the registration backlog.
///
/// The queue depth probe and the shared counter can each lag the other, so
/// the larger one wins. Without a probe the counter stands alone.
#[must_use]
pub fn backlog_estimate(depth: Option<usize>, counter: i32) -> i32 {
    let counter = counter.max(0);
    match depth {
        Some(depth) => i32::try_from(depth).unwrap_or(i32::MAX).max(counter),
        None => counter,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    Open,
    Close,
    Hold,
}

/// Hysteresis band: open at `K`, close below `N/3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub open_at: i32,
    pub close_below: i32,
}

impl ScalingPolicy {
    #[must_use]
    pub const fn new(capacity: i32, open_threshold: i32) -> Self {
        Self {
            open_at: open_threshold,
            close_below: capacity / 3,
        }
    }

    #[must_use]
    pub const fn decide(&self, backlog: i32, elastic_active: bool) -> ScalingAction {
        if !elastic_active && backlog >= self.open_at {
            ScalingAction::Open
        } else if elastic_active && backlog < self.close_below {
            ScalingAction::Close
        } else {
            ScalingAction::Hold
        }
    }
}
