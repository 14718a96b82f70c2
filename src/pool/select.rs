use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::SelectionMode;

/// A server as seen by a selection strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub addr: String,
    pub weight: u32,
}

/// Picks the server for the next pool call.
///
/// Never called with an empty candidate list. `last` is the previously
/// selected address, returned only when nothing else can be chosen.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, candidates: &[Candidate], last: Option<&str>) -> Option<String>;
}

/// Streaming weighted choice: each server is picked with probability
/// `weight / total`, independent of iteration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedSelect;

impl WeightedSelect {
    pub fn select_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        candidates: &[Candidate],
        last: Option<&str>,
    ) -> Option<String> {
        let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
        if total == 0 {
            // All weights zero: nothing to prefer
            return UniformSelect.select_with(rng, candidates, last);
        }

        let mut remaining = total;
        for candidate in candidates {
            let weight = u64::from(candidate.weight);
            if weight == 0 {
                continue;
            }
            // Fresh draw per candidate, against what is left of the total
            if rng.gen_range(0..remaining) < weight {
                return Some(candidate.addr.clone());
            }
            remaining -= weight;
        }

        last.map(str::to_string)
    }
}

impl SelectionStrategy for WeightedSelect {
    fn select(&self, candidates: &[Candidate], last: Option<&str>) -> Option<String> {
        self.select_with(&mut rand::thread_rng(), candidates, last)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UniformSelect;

impl UniformSelect {
    pub fn select_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        candidates: &[Candidate],
        last: Option<&str>,
    ) -> Option<String> {
        candidates
            .choose(rng)
            .map(|c| c.addr.clone())
            .or_else(|| last.map(str::to_string))
    }
}

impl SelectionStrategy for UniformSelect {
    fn select(&self, candidates: &[Candidate], last: Option<&str>) -> Option<String> {
        self.select_with(&mut rand::thread_rng(), candidates, last)
    }
}

/// Strategy for a configured selection mode.
pub fn strategy_for(mode: SelectionMode) -> Box<dyn SelectionStrategy> {
    match mode {
        SelectionMode::Weighted => Box::new(WeightedSelect),
        SelectionMode::Uniform => Box::new(UniformSelect),
    }
}
