use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of one pool, presented to the balance strategy.
/// The manager filters pools (availability, health) before selection.
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    pub pool_id: String,
    pub current_connections: usize,
    pub utilization: f64,
    pub cpu_usage: f64,
    pub memory_norm: f64,
    pub load_score: f64,
    pub weight: f64,
}

/// Trait for pluggable connection-balancing strategies.
pub trait BalanceStrategy: Send + Sync {
    /// Select one candidate from the list. Returns the index into `candidates`.
    fn select(&self, candidates: &[PoolCandidate]) -> Option<usize>;

    /// Human-readable name for logging / metrics.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// RoundRobin — rotate through candidates in order
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl BalanceStrategy for RoundRobin {
    fn select(&self, candidates: &[PoolCandidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let tick = self.counter.fetch_add(1, Ordering::Relaxed);
        Some((tick % candidates.len() as u64) as usize)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

// ---------------------------------------------------------------------------
// LeastConnections — pick the candidate with fewest live connections
// ---------------------------------------------------------------------------

pub struct LeastConnections;

impl BalanceStrategy for LeastConnections {
    fn select(&self, candidates: &[PoolCandidate]) -> Option<usize> {
        let mut best_idx: Option<usize> = None;
        let mut best_count = usize::MAX;

        for (i, c) in candidates.iter().enumerate() {
            if c.current_connections < best_count {
                best_count = c.current_connections;
                best_idx = Some(i);
            }
        }

        best_idx
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

// ---------------------------------------------------------------------------
// WeightedRoundRobin — rotation proportional to configured pool weights.
// Falls back to plain round-robin when all weights are equal or non-positive.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct WeightedRoundRobin {
    counter: AtomicU64,
}

impl BalanceStrategy for WeightedRoundRobin {
    fn select(&self, candidates: &[PoolCandidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        // Integer slots, two decimals of weight resolution.
        let slots: Vec<u64> = candidates
            .iter()
            .map(|c| (c.weight.max(0.0) * 100.0) as u64)
            .collect();
        let total: u64 = slots.iter().sum();
        if total == 0 {
            let tick = self.counter.fetch_add(1, Ordering::Relaxed);
            return Some((tick % candidates.len() as u64) as usize);
        }

        let tick = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        let mut acc = 0u64;
        for (i, slot) in slots.iter().enumerate() {
            acc += slot;
            if tick < acc {
                return Some(i);
            }
        }
        Some(candidates.len() - 1)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

// ---------------------------------------------------------------------------
// CpuAware / MemoryAware — pick the candidate with the lowest single gauge
// ---------------------------------------------------------------------------

pub struct CpuAware;

impl BalanceStrategy for CpuAware {
    fn select(&self, candidates: &[PoolCandidate]) -> Option<usize> {
        lowest_by(candidates, |c| c.cpu_usage)
    }

    fn name(&self) -> &'static str {
        "cpu_aware"
    }
}

pub struct MemoryAware;

impl BalanceStrategy for MemoryAware {
    fn select(&self, candidates: &[PoolCandidate]) -> Option<usize> {
        lowest_by(candidates, |c| c.memory_norm)
    }

    fn name(&self) -> &'static str {
        "memory_aware"
    }
}

// ---------------------------------------------------------------------------
// Adaptive — lowest blended load score (current default)
// ---------------------------------------------------------------------------

pub struct Adaptive;

impl BalanceStrategy for Adaptive {
    fn select(&self, candidates: &[PoolCandidate]) -> Option<usize> {
        lowest_by(candidates, |c| c.load_score)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}

fn lowest_by(candidates: &[PoolCandidate], key: impl Fn(&PoolCandidate) -> f64) -> Option<usize> {
    let mut best_idx: Option<usize> = None;
    let mut best = f64::INFINITY;

    for (i, c) in candidates.iter().enumerate() {
        let v = key(c);
        if v < best {
            best = v;
            best_idx = Some(i);
        }
    }

    best_idx
}

/// Parse a strategy name string into a boxed strategy.
pub fn parse_strategy(name: &str) -> Result<Box<dyn BalanceStrategy>, String> {
    match name {
        "round_robin" => Ok(Box::new(RoundRobin::default())),
        "least_connections" => Ok(Box::new(LeastConnections)),
        "weighted_round_robin" => Ok(Box::new(WeightedRoundRobin::default())),
        "cpu_aware" => Ok(Box::new(CpuAware)),
        "memory_aware" => Ok(Box::new(MemoryAware)),
        "adaptive" => Ok(Box::new(Adaptive)),
        other => Err(format!(
            "unknown balance strategy '{}', available: round_robin, least_connections, weighted_round_robin, cpu_aware, memory_aware, adaptive",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(id: &str, connections: usize, cpu: f64, memory: f64) -> PoolCandidate {
        let utilization = connections as f64 / 100.0;
        PoolCandidate {
            pool_id: id.to_string(),
            current_connections: connections,
            utilization,
            cpu_usage: cpu,
            memory_norm: memory,
            load_score: 0.4 * utilization + 0.3 * cpu + 0.2 * memory,
            weight: 1.0,
        }
    }

    #[test]
    fn test_round_robin_rotates() {
        let s = RoundRobin::default();
        let candidates = vec![
            make_candidate("p0", 0, 0.0, 0.0),
            make_candidate("p1", 0, 0.0, 0.0),
            make_candidate("p2", 0, 0.0, 0.0),
        ];
        let picks: Vec<usize> = (0..6).filter_map(|_| s.select(&candidates)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_connections() {
        let candidates = vec![
            make_candidate("p0", 8, 0.0, 0.0),
            make_candidate("p1", 2, 0.0, 0.0),
        ];
        assert_eq!(LeastConnections.select(&candidates), Some(1));
    }

    #[test]
    fn test_weighted_round_robin_respects_weights() {
        let s = WeightedRoundRobin::default();
        let mut heavy = make_candidate("p0", 0, 0.0, 0.0);
        heavy.weight = 3.0;
        let light = make_candidate("p1", 0, 0.0, 0.0);
        let candidates = vec![heavy, light];

        let mut counts = [0usize; 2];
        for _ in 0..400 {
            counts[s.select(&candidates).expect("pick")] += 1;
        }
        assert_eq!(counts[0], 300);
        assert_eq!(counts[1], 100);
    }

    #[test]
    fn test_cpu_and_memory_aware() {
        let candidates = vec![
            make_candidate("p0", 0, 0.9, 0.1),
            make_candidate("p1", 0, 0.2, 0.8),
        ];
        assert_eq!(CpuAware.select(&candidates), Some(1));
        assert_eq!(MemoryAware.select(&candidates), Some(0));
    }

    #[test]
    fn test_adaptive_picks_lowest_load() {
        let candidates = vec![
            make_candidate("p0", 50, 0.5, 0.5),
            make_candidate("p1", 10, 0.1, 0.1),
        ];
        assert_eq!(Adaptive.select(&candidates), Some(1));
    }

    #[test]
    fn test_parse_strategy_rejects_unknown() {
        assert!(parse_strategy("adaptive").is_ok());
        assert!(parse_strategy("fastest").is_err());
    }
}
