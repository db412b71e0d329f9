use std::time::Duration;

use crate::config::RunConfig;

/// One ramp step: a batch of workers launched together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampGroup {
    pub index: usize,
    pub workers: usize,
    /// Nominal launch time relative to the first group, ignoring spawn cost.
    pub launch_offset_ms: u64,
    /// Pause before the next group; `None` for the last one.
    pub delay_after: Option<Duration>,
}

/// Deterministic thread-group schedule: groups launch strictly in order with a
/// fixed pause between consecutive groups and none after the last.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    group_size: usize,
    num_groups: usize,
    delay: Duration,
}

impl RampPlanner {
    pub fn new(group_size: usize, num_groups: usize, delay: Duration) -> Self {
        Self {
            group_size,
            num_groups,
            delay,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.thread_group_size,
            config.num_thread_groups,
            Duration::from_secs(config.inter_group_delay_secs),
        )
    }

    /// Iterate groups strictly in order.
    pub fn groups(&self) -> impl Iterator<Item = RampGroup> + '_ {
        (0..self.num_groups).map(move |index| RampGroup {
            index,
            workers: self.group_size,
            launch_offset_ms: self.delay_ms().saturating_mul(index as u64),
            delay_after: (index + 1 < self.num_groups).then_some(self.delay),
        })
    }

    /// Size of the global completion latch.
    pub fn total_workers(&self) -> usize {
        self.group_size * self.num_groups
    }

    /// Time the orchestrator spends sleeping between groups.
    pub fn total_delay(&self) -> Duration {
        let gaps = u32::try_from(self.num_groups.saturating_sub(1)).unwrap_or(u32::MAX);
        self.delay.saturating_mul(gaps)
    }

    fn delay_ms(&self) -> u64 {
        u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX)
    }
}
