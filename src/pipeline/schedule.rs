//! Work selection policies for the stage loop.
//!
//! A stage never plans its whole batch up front. Each time the loop is idle it asks
//! its [`SchedulePolicy`] which [`UniqueKey`] to run next, given the per-batch
//! [`StageCounters`], and then blocks until that key is runnable.
//!
//! - [`FillDrain`]: all forwards, then all backwards (GPipe ordering).
//! - [`OneFOneB`]: forward while the outstanding window has room, backward once it
//!   is full, so in-flight microbatches stay bounded by the pipeline depth.

use super::work_item::{Phase, UniqueKey};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Which policy a pipeline uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    FillDrain,
    #[serde(rename = "1f1b")]
    OneFOneB,
}

impl ScheduleKind {
    pub fn policy(self) -> Box<dyn SchedulePolicy> {
        match self {
            ScheduleKind::FillDrain => Box::new(FillDrain),
            ScheduleKind::OneFOneB => Box::new(OneFOneB),
        }
    }
}

/// Where a stage sits in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePosition {
    pub rank: usize,
    pub num_stages: usize,
    pub num_microbatches: usize,
}

impl StagePosition {
    pub fn is_last(&self) -> bool {
        self.rank + 1 == self.num_stages
    }
}

/// Per-batch progress of a stage, reset at every batch boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounters {
    pub forward_times: usize,
    pub backward_times: usize,
    /// Microbatches whose forward ran but whose backward has not.
    pub outstanding: usize,
    /// `(forward_at_or_below, backward_at_or_above)` thresholds on `outstanding`.
    pub outstanding_range: (usize, usize),
}

impl StageCounters {
    pub fn new(range: (usize, usize)) -> Self {
        Self {
            outstanding_range: range,
            ..Self::default()
        }
    }

    /// Account for the start of a forward pass.
    pub fn record_forward(&mut self, forward_only: bool) {
        self.forward_times += 1;
        if !forward_only {
            self.outstanding += 1;
        }
    }

    /// Account for the start of a backward pass.
    pub fn record_backward(&mut self) -> Result<()> {
        self.backward_times += 1;
        self.outstanding = self
            .outstanding
            .checked_sub(1)
            .ok_or_else(|| Error::Invariant {
                reason: "backward started with no outstanding forward".to_string(),
            })?;
        Ok(())
    }
}

/// Chooses the next work item a stage should run.
pub trait SchedulePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Window thresholds at the start of a batch.
    fn initial_range(&self, pos: &StagePosition) -> (usize, usize) {
        if pos.is_last() {
            (0, 1)
        } else {
            (pos.num_stages, pos.num_stages)
        }
    }

    /// Pick the next key. May adjust `counters.outstanding_range`.
    fn next_key(&self, counters: &mut StageCounters, pos: &StagePosition) -> Result<UniqueKey>;
}

/// Every forward of the batch before any backward.
#[derive(Debug, Clone, Copy, Default)]
pub struct FillDrain;

impl SchedulePolicy for FillDrain {
    fn name(&self) -> &'static str {
        "fill_drain"
    }

    fn next_key(&self, counters: &mut StageCounters, pos: &StagePosition) -> Result<UniqueKey> {
        if counters.forward_times < pos.num_microbatches {
            Ok(UniqueKey::forward(counters.forward_times))
        } else {
            Ok(UniqueKey::backward(counters.backward_times))
        }
    }
}

/// One forward, one backward once the pipeline is full.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneFOneB;

impl SchedulePolicy for OneFOneB {
    fn name(&self) -> &'static str {
        "1f1b"
    }

    fn next_key(&self, counters: &mut StageCounters, pos: &StagePosition) -> Result<UniqueKey> {
        let (low, high) = counters.outstanding_range;
        let key = if counters.outstanding <= low {
            UniqueKey::forward(counters.forward_times)
        } else if counters.outstanding >= high {
            UniqueKey::backward(counters.backward_times)
        } else {
            return Err(Error::Invariant {
                reason: format!(
                    "outstanding {} inside window ({low}, {high}); window width must be 0 or 1",
                    counters.outstanding
                ),
            });
        };

        // Narrow the window when warmup ends, close it after the last forward.
        if !pos.is_last() && key.phase == Phase::Forward {
            let s = pos.num_stages;
            // With two or fewer microbatches there is no steady state.
            if key.microbatch_id + 1 == s && pos.num_microbatches > 2 {
                counters.outstanding_range = (s - pos.rank - 1, s - pos.rank);
            }
            if key.microbatch_id + 1 == pos.num_microbatches {
                counters.outstanding_range = (0, 0);
            }
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a policy as if every requested key were immediately runnable.
    fn simulate(policy: &dyn SchedulePolicy, pos: StagePosition) -> Vec<UniqueKey> {
        let mut counters = StageCounters::new(policy.initial_range(&pos));
        let mut keys = Vec::new();
        while counters.backward_times < pos.num_microbatches {
            let key = policy.next_key(&mut counters, &pos).unwrap();
            match key.phase {
                Phase::Forward => counters.record_forward(false),
                Phase::Backward => counters.record_backward().unwrap(),
                Phase::Input => unreachable!(),
            }
            assert!(counters.outstanding <= pos.num_stages);
            keys.push(key);
        }
        keys
    }

    fn render(keys: &[UniqueKey]) -> String {
        keys.iter()
            .map(|k| match k.phase {
                Phase::Forward => format!("F{}", k.microbatch_id),
                Phase::Backward => format!("B{}", k.microbatch_id),
                Phase::Input => format!("I{}", k.microbatch_id),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn pos(rank: usize, num_stages: usize, num_microbatches: usize) -> StagePosition {
        StagePosition {
            rank,
            num_stages,
            num_microbatches,
        }
    }

    #[test]
    fn test_fill_drain_order() {
        let keys = simulate(&FillDrain, pos(1, 4, 4));
        assert_eq!(render(&keys), "F0 F1 F2 F3 B0 B1 B2 B3");
    }

    #[test]
    fn test_1f1b_first_stage_window() {
        let keys = simulate(&OneFOneB, pos(0, 4, 8));
        assert_eq!(
            render(&keys),
            "F0 F1 F2 F3 B0 F4 B1 F5 B2 F6 B3 F7 B4 B5 B6 B7"
        );
    }

    #[test]
    fn test_1f1b_last_stage_alternates() {
        let keys = simulate(&OneFOneB, pos(3, 4, 4));
        assert_eq!(render(&keys), "F0 B0 F1 B1 F2 B2 F3 B3");
    }

    #[test]
    fn test_1f1b_few_microbatches_has_no_steady_state() {
        let keys = simulate(&OneFOneB, pos(0, 2, 2));
        assert_eq!(render(&keys), "F0 F1 B0 B1");
    }

    #[test]
    fn test_initial_range() {
        assert_eq!(OneFOneB.initial_range(&pos(3, 4, 8)), (0, 1));
        assert_eq!(OneFOneB.initial_range(&pos(1, 4, 8)), (4, 4));
    }

    #[test]
    fn test_forward_only_never_opens_window() {
        let p = pos(0, 4, 6);
        let mut counters = StageCounters::new(OneFOneB.initial_range(&p));
        for expected in 0..6 {
            let key = OneFOneB.next_key(&mut counters, &p).unwrap();
            assert_eq!(key, UniqueKey::forward(expected));
            counters.record_forward(true);
        }
        assert_eq!(counters.outstanding, 0);
    }

    #[test]
    fn test_backward_underflow_is_invariant_error() {
        let mut counters = StageCounters::default();
        assert!(matches!(
            counters.record_backward(),
            Err(Error::Invariant { .. })
        ));
    }

    #[test]
    fn test_schedule_kind_serde() {
        let kind: ScheduleKind = serde_yaml::from_str("1f1b").unwrap();
        assert_eq!(kind, ScheduleKind::OneFOneB);
        assert_eq!(kind.policy().name(), "1f1b");
        let kind: ScheduleKind = serde_yaml::from_str("fill_drain").unwrap();
        assert_eq!(kind, ScheduleKind::FillDrain);
    }
}
