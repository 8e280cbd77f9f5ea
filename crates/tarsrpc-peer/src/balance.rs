//! Endpoint selection.
//!
//! Each proxy owns one balancer instance, so cursors are per servant and
//! shared by every thread calling through that proxy.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use siphasher::sip::SipHasher13;

use crate::config::ServantProxyConfig;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use crate::sync::lock_ignore_poison;

pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Pick one endpoint for the next call.
    ///
    /// `hash` is the caller's routing key, used by hashing strategies.
    fn pick(
        &self,
        config: &ServantProxyConfig,
        endpoints: &[Endpoint],
        hash: Option<u64>,
    ) -> Result<Endpoint>;
}

/// Active endpoints, narrowed to the proxy's set division when set routing
/// is on and at least one endpoint is in that set.
pub fn candidates<'a>(config: &ServantProxyConfig, endpoints: &'a [Endpoint]) -> Vec<&'a Endpoint> {
    let active: Vec<&Endpoint> = endpoints.iter().filter(|e| e.active).collect();
    if let Some(set) = config.active_set() {
        let in_set: Vec<&Endpoint> = active
            .iter()
            .copied()
            .filter(|e| e.set_id.as_deref() == Some(set))
            .collect();
        if !in_set.is_empty() {
            return in_set;
        }
    }
    active
}

fn no_endpoint(config: &ServantProxyConfig) -> RpcError {
    RpcError::NoEndpoint(config.simple_object_name.clone())
}

/// Rotating cursor over the candidates. The default strategy.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn pick(
        &self,
        config: &ServantProxyConfig,
        endpoints: &[Endpoint],
        _hash: Option<u64>,
    ) -> Result<Endpoint> {
        let candidates = candidates(config, endpoints);
        if candidates.is_empty() {
            return Err(no_endpoint(config));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }
}

/// Smooth weighted round-robin: each pick adds every candidate's weight to
/// its running score, takes the highest, and subtracts the total from it.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    scores: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn pick(
        &self,
        config: &ServantProxyConfig,
        endpoints: &[Endpoint],
        _hash: Option<u64>,
    ) -> Result<Endpoint> {
        let candidates = candidates(config, endpoints);
        if candidates.is_empty() {
            return Err(no_endpoint(config));
        }

        let mut scores = lock_ignore_poison(&self.scores);
        scores.retain(|address, _| candidates.iter().any(|e| &e.address() == address));

        let total: i64 = candidates.iter().map(|e| i64::from(e.effective_weight())).sum();
        let mut best: Option<(&Endpoint, i64)> = None;
        for &endpoint in &candidates {
            let score = scores.entry(endpoint.address()).or_insert(0);
            *score += i64::from(endpoint.effective_weight());
            if best.map_or(true, |(_, top)| *score > top) {
                best = Some((endpoint, *score));
            }
        }

        let (chosen, _) = best.ok_or_else(|| no_endpoint(config))?;
        if let Some(score) = scores.get_mut(&chosen.address()) {
            *score -= total;
        }
        Ok(chosen.clone())
    }
}

/// Rendezvous hashing on the caller's hash code; round-robin when the call
/// carries none.
///
/// Adding or removing an endpoint only moves the keys that hashed to it.
/// Scores are SipHash-1-3 with zero keys over the big-endian key, host and
/// big-endian port, so every client picks the same endpoint for a key.
#[derive(Debug, Default)]
pub struct ConsistentHash {
    fallback: RoundRobin,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self::default()
    }

    fn score(key: u64, endpoint: &Endpoint) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(&key.to_be_bytes());
        hasher.write(endpoint.host.as_bytes());
        hasher.write(&endpoint.port.to_be_bytes());
        hasher.finish()
    }
}

impl LoadBalancer for ConsistentHash {
    fn pick(
        &self,
        config: &ServantProxyConfig,
        endpoints: &[Endpoint],
        hash: Option<u64>,
    ) -> Result<Endpoint> {
        let Some(key) = hash else {
            return self.fallback.pick(config, endpoints, None);
        };
        candidates(config, endpoints)
            .into_iter()
            .max_by_key(|endpoint| Self::score(key, endpoint))
            .cloned()
            .ok_or_else(|| no_endpoint(config))
    }
}

/// Balancing strategy selectable per proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    Weighted,
    ConsistentHash,
}

impl BalanceStrategy {
    pub fn build(self) -> Box<dyn LoadBalancer> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::new()),
            Self::Weighted => Box::new(WeightedRoundRobin::new()),
            Self::ConsistentHash => Box::new(ConsistentHash::new()),
        }
    }
}
