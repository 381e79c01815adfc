//! Backend selection policies
//!
//! Rank filtering runs before the policy: only candidates sharing the best
//! available rank are scored. The adaptive policy builds a roulette wheel
//! from inverse cubed average response times, flooring every slot at a small
//! fraction of the total so a slow server keeps getting sampled and can be
//! noticed recovering.

use std::sync::Arc;

use rand::Rng;
use serde::Deserialize;

use crate::backend::ServerDescriptor;

/// Selection policy for read targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Fewest connections across the whole process
    LeastGlobalConnections,
    /// Fewest connections opened by this router
    LeastRouterConnections,
    /// Fewest commands currently in flight
    #[default]
    LeastCurrentOperations,
    /// Lowest measured replication lag
    LeastBehindMaster,
    /// Probability proportional to inverse cubed mean response time
    Adaptive,
}

/// A selectable backend with its router-local connection count
pub struct Candidate {
    pub server: Arc<ServerDescriptor>,
    pub router_connections: u32,
}

/// An unmeasured server scores as if extremely fast so it is tried almost
/// immediately and gets a real sample.
const UNMEASURED_SECS: f64 = 1.0 / 10_000_000.0;

/// Floor divisor for the adaptive wheel: every slot keeps at least
/// ~0.5% of the pre-floor total.
const ADAPTIVE_FLOOR_DIVISOR: f64 = 197.0;

/// Pick the index of the best candidate under `policy`
///
/// Returns None for an empty candidate list. Candidates not sharing the best
/// rank are excluded before scoring.
pub fn select(policy: SelectionPolicy, candidates: &[Candidate]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let best_rank = candidates.iter().map(|c| c.server.rank()).min()?;
    let ranked: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].server.rank() == best_rank)
        .collect();

    let chosen = match policy {
        SelectionPolicy::LeastGlobalConnections => {
            best_by_score(&ranked, |i| candidates[i].server.connection_count() as i64)
        }
        SelectionPolicy::LeastRouterConnections => {
            best_by_score(&ranked, |i| candidates[i].router_connections as i64)
        }
        SelectionPolicy::LeastCurrentOperations => {
            best_by_score(&ranked, |i| candidates[i].server.current_ops() as i64)
        }
        SelectionPolicy::LeastBehindMaster => best_by_score(&ranked, |i| {
            let lag = candidates[i].server.replication_lag();
            // Unknown lag sorts last
            if lag < 0 {
                i64::MAX
            } else {
                lag
            }
        }),
        SelectionPolicy::Adaptive => adaptive_select(&ranked, candidates),
    };

    chosen
}

fn best_by_score(ranked: &[usize], score: impl Fn(usize) -> i64) -> Option<usize> {
    ranked.iter().copied().min_by_key(|&i| score(i))
}

fn adaptive_select(ranked: &[usize], candidates: &[Candidate]) -> Option<usize> {
    if ranked.is_empty() {
        return None;
    }

    // Fill slots with inverses of averages, cubed to favor faster servers
    let mut slots: Vec<f64> = ranked
        .iter()
        .map(|&i| {
            let avg = candidates[i].server.response_time_average().as_secs_f64();
            let avg = if avg == 0.0 { UNMEASURED_SECS } else { avg };
            let inv = 1.0 / avg;
            inv * inv * inv
        })
        .collect();

    let pre_total: f64 = slots.iter().sum();

    // Guarantee the slowest servers a minimum share of the wheel
    let floor = pre_total / ADAPTIVE_FLOOR_DIVISOR;
    let mut total = 0.0;
    for slot in &mut slots {
        *slot = slot.max(floor);
        total += *slot;
    }

    let ball: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let mut walk = 0.0;
    for (pos, slot) in slots.iter().enumerate() {
        walk += slot / total;
        if ball < walk {
            return Some(ranked[pos]);
        }
    }
    ranked.last().copied()
}
