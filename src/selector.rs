//! Eligibility filtering and ranking. Filters and rankers are pure over
//! config/state snapshots; two concurrent selectors reading the same store
//! may pick the same instance, which admission later bounds.

use rand::Rng;

use crate::config::{InstanceConfig, ProviderType, RoutingStrategy};
use crate::state::InstanceState;

/// Latency assumed for instances that have not reported one yet.
const DEFAULT_LATENCY_MS: f64 = 100.0;

/// A config paired with its state snapshot, after eligibility filtering.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub config: InstanceConfig,
    pub state: InstanceState,
}

/// Filter 1: capability. Drops disabled instances, provider mismatches,
/// unsupported models, and instances whose ceiling is below the request.
pub fn filter_by_capability<'a>(
    configs: &'a [InstanceConfig],
    model: &str,
    tokens: u64,
    provider: Option<ProviderType>,
) -> Vec<&'a InstanceConfig> {
    configs
        .iter()
        .filter(|config| config.enabled)
        .filter(|config| provider.map_or(true, |p| config.provider_type == p))
        .filter(|config| config.supports_model(model))
        .filter(|config| tokens <= config.max_tpm)
        .collect()
}

/// Ranks survivors of filters 1–3 and returns the chosen instance name.
pub fn rank(strategy: RoutingStrategy, candidates: &[Candidate]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    let chosen = match strategy {
        RoutingStrategy::Failover => by_failover(candidates),
        RoutingStrategy::Weighted => by_weight(candidates),
        RoutingStrategy::RoundRobin => by_round_robin(candidates),
        RoutingStrategy::LowestUtilization => by_lowest_utilization(candidates),
        RoutingStrategy::LowestLatency => by_lowest_latency(candidates),
        RoutingStrategy::Composite => by_composite(candidates),
    };
    Some(chosen.config.name.clone())
}

/// Lowest priority number wins; ties break on name so the order is stable.
fn by_failover(candidates: &[Candidate]) -> &Candidate {
    first_min_by(candidates, |a, b| {
        (a.config.priority, a.config.name.as_str()).cmp(&(b.config.priority, b.config.name.as_str()))
    })
}

/// Uniform draw over the summed weights, then a prefix-sum walk.
fn by_weight(candidates: &[Candidate]) -> &Candidate {
    let total_weight: u64 = candidates.iter().map(|c| u64::from(c.config.weight)).sum();
    if total_weight == 0 {
        return &candidates[0];
    }

    let target = rand::thread_rng().gen_range(0..total_weight);
    let mut current: u64 = 0;
    for candidate in candidates {
        current += u64::from(candidate.config.weight);
        if current > target {
            return candidate;
        }
    }
    &candidates[0]
}

/// Least recently used first.
fn by_round_robin(candidates: &[Candidate]) -> &Candidate {
    first_min_by(candidates, |a, b| a.state.last_used.cmp(&b.state.last_used))
}

fn by_lowest_utilization(candidates: &[Candidate]) -> &Candidate {
    first_min_by(candidates, |a, b| {
        a.state
            .utilization_percentage
            .total_cmp(&b.state.utilization_percentage)
    })
}

fn by_lowest_latency(candidates: &[Candidate]) -> &Candidate {
    let latency = |c: &Candidate| c.state.avg_latency_ms.unwrap_or(DEFAULT_LATENCY_MS);
    first_min_by(candidates, |a, b| latency(a).total_cmp(&latency(b)))
}

fn by_composite(candidates: &[Candidate]) -> &Candidate {
    first_min_by(candidates, |a, b| {
        // Highest score wins.
        composite_score(b).total_cmp(&composite_score(a))
    })
}

fn composite_score(candidate: &Candidate) -> f64 {
    let weight_score = f64::from(candidate.config.weight) / 20.0;
    let utilization_score = (100.0 - candidate.state.utilization_percentage) / 100.0;
    let error_score = (100.0 - candidate.state.current_error_rate) / 100.0;
    let latency = candidate.state.avg_latency_ms.unwrap_or(DEFAULT_LATENCY_MS);
    let latency_score = (1.0 - latency / 1000.0).max(0.0);

    weight_score * 0.3 + utilization_score * 0.4 + error_score * 0.2 + latency_score * 0.1
}

/// First minimal element under `cmp`, keeping input order on ties.
fn first_min_by<'a, F>(candidates: &'a [Candidate], cmp: F) -> &'a Candidate
where
    F: Fn(&Candidate, &Candidate) -> std::cmp::Ordering,
{
    candidates
        .iter()
        .reduce(|best, candidate| {
            if cmp(candidate, best) == std::cmp::Ordering::Less {
                candidate
            } else {
                best
            }
        })
        .expect("candidates are non-empty")
}
