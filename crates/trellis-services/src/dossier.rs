//! Dossier — per-peer reputation ledger.
//!
//! Each entry remembers when a peer was last heard from, running averages of
//! sampled metrics, and success/failure counts. Routing maintenance writes
//! to it after every ping and reads it to decide when a peer that has gone
//! quiet should be forgotten.
//!
//! When constructed with a persistence path the ledger is reloaded on start
//! and written back by `flush`, which the Reunion daemon calls after every
//! pass.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use trellis_core::envelope::unix_millis;
use trellis_core::{NodeAddress, NodeId};

/// Weight of the previous average when folding in a new sample.
pub const AVERAGE_BIAS: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Latency,
    Available,
    Routing,
    Publisher,
}

impl Metric {
    /// Contribution of this metric's success rate to the reputation score.
    fn weight(self) -> f64 {
        match self {
            Metric::Available => 50.0,
            Metric::Routing => 25.0,
            Metric::Publisher => 25.0,
            Metric::Latency => 0.0,
        }
    }
}

/// Exponentially weighted moving average.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Average {
    pub value: f64,
    pub samples: u64,
}

impl Average {
    pub fn add_sample(&mut self, sample: f64) {
        self.value = if self.samples == 0 {
            sample
        } else {
            AVERAGE_BIAS * self.value + (1.0 - AVERAGE_BIAS) * sample
        };
        self.samples += 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub attempts: u64,
    pub successes: u64,
}

impl Counter {
    pub fn record(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
    }

    /// Fraction of successful attempts. 0.0 with no attempts.
    pub fn probability(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DossierEntry {
    pub address: NodeAddress,
    /// Milliseconds since the Unix epoch of the last successful contact.
    pub last_contact_ms: u64,
    pub averages: BTreeMap<Metric, Average>,
    pub counters: BTreeMap<Metric, Counter>,
}

impl DossierEntry {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            last_contact_ms: unix_millis(),
            averages: BTreeMap::from([(Metric::Latency, Average::default())]),
            counters: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_contact_ms = now_ms;
    }

    pub fn add_sample(&mut self, metric: Metric, sample: f64) {
        self.averages.entry(metric).or_default().add_sample(sample);
    }

    pub fn record(&mut self, metric: Metric, success: bool) {
        self.counters.entry(metric).or_default().record(success);
    }

    pub fn average(&self, metric: Metric) -> Option<f64> {
        self.averages
            .get(&metric)
            .filter(|a| a.samples > 0)
            .map(|a| a.value)
    }

    pub fn counter(&self, metric: Metric) -> Counter {
        self.counters.get(&metric).copied().unwrap_or_default()
    }

    /// True when the last contact is more than `ttl` before `now_ms`.
    pub fn is_stale(&self, ttl: Duration, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_contact_ms) > millis(ttl)
    }

    /// Weighted success rate over the counted metrics, 0–100.
    pub fn reputation(&self) -> f64 {
        let (score, weight) = self
            .counters
            .iter()
            .filter(|(m, c)| m.weight() > 0.0 && c.attempts > 0)
            .fold((0.0, 0.0), |(s, w), (m, c)| {
                (s + m.weight() * c.probability(), w + m.weight())
            });
        if weight == 0.0 {
            0.0
        } else {
            100.0 * score / weight
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub trait Dossier: Send + Sync {
    /// Record a successful observation. Latency values are folded into the
    /// running average; other metrics count a success.
    fn record_success(&self, address: &NodeAddress, metric: Metric, value: f64);

    fn record_failure(&self, address: &NodeAddress, metric: Metric);

    /// Lock the entry for `address` (creating it if absent), run `f`, unlock.
    ///
    /// `f` must not call back into the dossier.
    fn with_entry(&self, address: &NodeAddress, f: &mut dyn FnMut(&mut DossierEntry));

    fn entry(&self, id: &NodeId) -> Option<DossierEntry>;

    fn remove(&self, id: &NodeId) -> Option<DossierEntry>;

    fn addresses(&self) -> Vec<NodeAddress>;

    /// Persist if the implementation supports it.
    fn flush(&self) {}
}

// ── In-memory ledger ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryDossier {
    entries: Arc<DashMap<NodeId, DossierEntry>>,
    persist_path: Arc<Option<PathBuf>>,
}

impl Default for MemoryDossier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDossier {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            persist_path: Arc::new(None),
        }
    }

    /// Create a ledger that persists to `path`, loading it if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let dossier = Self {
            entries: Arc::new(DashMap::new()),
            persist_path: Arc::new(Some(path)),
        };
        dossier.load_from_disk();
        dossier
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn load_from_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) if p.exists() => p,
            _ => return,
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read dossier");
                return;
            }
        };
        match serde_json::from_str::<Vec<DossierEntry>>(&text) {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    self.entries.insert(*entry.address.id(), entry);
                }
                tracing::info!(count, path = %path.display(), "dossier loaded");
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse dossier");
            }
        }
    }

    fn save_to_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return,
        };
        let snapshot: Vec<DossierEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist dossier");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize dossier");
            }
        }
    }
}

impl Dossier for MemoryDossier {
    fn record_success(&self, address: &NodeAddress, metric: Metric, value: f64) {
        self.with_entry(address, &mut |entry| match metric {
            Metric::Latency => entry.add_sample(metric, value),
            _ => entry.record(metric, true),
        });
    }

    fn record_failure(&self, address: &NodeAddress, metric: Metric) {
        self.with_entry(address, &mut |entry| entry.record(metric, false));
    }

    fn with_entry(&self, address: &NodeAddress, f: &mut dyn FnMut(&mut DossierEntry)) {
        let mut entry = self
            .entries
            .entry(*address.id())
            .or_insert_with(|| DossierEntry::new(address.clone()));
        entry.address = address.clone();
        f(entry.value_mut());
    }

    fn entry(&self, id: &NodeId) -> Option<DossierEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    fn remove(&self, id: &NodeId) -> Option<DossierEntry> {
        self.entries.remove(id).map(|(_, e)| e)
    }

    fn addresses(&self) -> Vec<NodeAddress> {
        self.entries.iter().map(|e| e.value().address.clone()).collect()
    }

    fn flush(&self) {
        self.save_to_disk();
    }
}
