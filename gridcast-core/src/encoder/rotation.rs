//! Degraded-mode rotation over source subgroups.

use std::time::Duration;

use super::pipeline::SourceId;

/// Cycles through fixed subgroups of the session's sources.
#[derive(Debug, Clone)]
pub struct RotationPlan {
    groups: Vec<Vec<SourceId>>,
    next: usize,
    dwell: Duration,
}

impl RotationPlan {
    /// Splits `sources` into consecutive groups of `group_size`; the last
    /// group may be smaller. A zero group size is treated as one.
    pub fn new(sources: &[SourceId], group_size: usize, dwell: Duration) -> Self {
        let groups = sources
            .chunks(group_size.max(1))
            .map(<[SourceId]>::to_vec)
            .collect();
        Self {
            groups,
            next: 0,
            dwell,
        }
    }

    /// Group to show next, wrapping around forever. `None` only for an empty plan.
    pub fn next_group(&mut self) -> Option<&[SourceId]> {
        if self.groups.is_empty() {
            return None;
        }
        let index = self.next;
        self.next = (self.next + 1) % self.groups.len();
        Some(&self.groups[index])
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }
}
