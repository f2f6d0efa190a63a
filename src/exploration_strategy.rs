//! Pluggable search heuristics. The scheduler only ever talks to the
//! [`ExplorationStrategy`] trait; which state runs next is policy.

use crate::state::StateId;
use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};

pub trait ExplorationStrategy {
    /// The state to step next. Only called while at least one state is
    /// live.
    fn select(&mut self) -> StateId;

    /// Commit the scheduler's updates: `current` stepped (if any),
    /// `added` joined the pool, `removed` left it.
    fn update(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]);
}

/// Always runs the most recently added state, driving one path to a
/// terminal before backtracking.
#[derive(Debug, Default)]
pub struct DepthFirstStrategy {
    stack: Vec<StateId>,
}

impl DepthFirstStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExplorationStrategy for DepthFirstStrategy {
    fn select(&mut self) -> StateId {
        *self.stack.last().expect("no states left to select")
    }

    fn update(&mut self, _current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        for id in removed {
            if let Some(position) = self.stack.iter().position(|s| s == id) {
                self.stack.remove(position);
            }
        }
        for id in added {
            trace!("scheduling {}", id);
            self.stack.push(*id);
        }
    }
}

/// Picks a uniformly random live state each step; reproducible under a
/// fixed seed.
#[derive(Debug)]
pub struct RandomStateStrategy {
    states: Vec<StateId>,
    rng: StdRng,
}

impl RandomStateStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            states: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ExplorationStrategy for RandomStateStrategy {
    fn select(&mut self) -> StateId {
        let index = self.rng.gen_range(0..self.states.len());
        self.states[index]
    }

    fn update(&mut self, _current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        for id in removed {
            if let Some(position) = self.states.iter().position(|s| s == id) {
                self.states.swap_remove(position);
            }
        }
        self.states.extend_from_slice(added);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_first_prefers_the_newest_state() {
        let mut strategy = DepthFirstStrategy::new();
        strategy.update(None, &[StateId(0)], &[]);
        assert_eq!(strategy.select(), StateId(0));

        strategy.update(Some(StateId(0)), &[StateId(1)], &[]);
        assert_eq!(strategy.select(), StateId(1));

        strategy.update(Some(StateId(1)), &[], &[StateId(1)]);
        assert_eq!(strategy.select(), StateId(0));
    }
}
