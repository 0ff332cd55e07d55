//! Tensor-network memory store.
//!
//! Nodes keep their encoded state as a chain factorization. Importance decays
//! exponentially with elapsed hours and is refreshed by similarity hits; at
//! capacity the globally least important node is evicted. Every
//! `compress_every` insertions each node's chain is re-truncated.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::affect::AffectVector;
use crate::chain::ChainState;
use crate::error::{CoreError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub capacity: usize,
    pub decay_rate: f64,
    pub min_importance: f64,
    pub compress_every: usize,
    pub variance_threshold: f64,
    pub max_bond_dim: usize,
    pub association_threshold: f64,
    pub refresh_boost: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            decay_rate: 0.99,
            min_importance: 0.01,
            compress_every: 10,
            variance_threshold: 0.95,
            max_bond_dim: 16,
            association_threshold: 0.7,
            refresh_boost: 0.1,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CoreError::InvalidConfig("memory capacity must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.decay_rate) || self.decay_rate == 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "decay_rate {} outside (0, 1]",
                self.decay_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.min_importance) {
            return Err(CoreError::InvalidConfig(format!(
                "min_importance {} outside [0, 1]",
                self.min_importance
            )));
        }
        if !(0.0..=1.0).contains(&self.variance_threshold) || self.max_bond_dim == 0 {
            return Err(CoreError::InvalidConfig(
                "variance_threshold must be in [0, 1] and max_bond_dim positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub node_id: Uuid,
    pub strength: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub affect: AffectVector,
    pub state: ChainState,
    pub importance: f64,
    pub associations: Vec<Association>,
    pub metadata: BTreeMap<String, String>,
    pub importance_updated_at: DateTime<Utc>,
    pub access_count: u64,
}

impl MemoryNode {
    fn associate(&mut self, node_id: Uuid, strength: f64) {
        match self.associations.iter_mut().find(|a| a.node_id == node_id) {
            Some(existing) => existing.strength = existing.strength.max(strength),
            None => self.associations.push(Association { node_id, strength }),
        }
    }

    fn decay_to(&mut self, now: DateTime<Utc>, config: &MemoryConfig) {
        let elapsed = now - self.importance_updated_at;
        let hours = elapsed.num_milliseconds().max(0) as f64 / 3_600_000.0;
        if hours > 0.0 {
            self.importance =
                (self.importance * config.decay_rate.powf(hours)).max(config.min_importance);
            self.importance_updated_at = now;
        }
    }
}

/// Running totals over every `compress()` pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionMetrics {
    pub runs: u64,
    pub parameters_before: usize,
    pub parameters_after: usize,
    pub compression_ratio: f64,
    pub mean_retained_variance: f64,
    pub max_bond: usize,
}

/// What a single insert did to the store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreOutcome {
    pub id: Uuid,
    /// `(id, importance at eviction)` of the node pushed out to make room.
    pub evicted: Option<(Uuid, f64)>,
    pub associations: usize,
    pub compressed: bool,
    /// Set when the periodic compression pass failed. The insert itself
    /// still stands and the nodes keep their previous chains.
    pub compression_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemoryMatch {
    pub id: Uuid,
    pub affect: AffectVector,
    pub similarity: f64,
    pub score: f64,
    pub importance: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct TensorNetworkStore {
    config: MemoryConfig,
    nodes: Vec<MemoryNode>,
    insertions: u64,
    metrics: CompressionMetrics,
}

impl TensorNetworkStore {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            nodes: Vec::new(),
            insertions: 0,
            metrics: CompressionMetrics::default(),
        })
    }

    /// Rebuild from persisted nodes. Nodes beyond capacity are dropped least important first.
    pub fn from_nodes(
        config: MemoryConfig,
        mut nodes: Vec<MemoryNode>,
        metrics: CompressionMetrics,
    ) -> Result<Self> {
        config.validate()?;
        if nodes.len() > config.capacity {
            nodes.sort_by(|a, b| {
                b.importance
                    .total_cmp(&a.importance)
                    .then(b.timestamp.cmp(&a.timestamp))
            });
            nodes.truncate(config.capacity);
        }
        Ok(Self {
            insertions: nodes.len() as u64,
            config,
            nodes,
            metrics,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[MemoryNode] {
        &self.nodes
    }

    pub fn get(&self, id: Uuid) -> Option<&MemoryNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn compression_metrics(&self) -> &CompressionMetrics {
        &self.metrics
    }

    pub fn total_parameters(&self) -> usize {
        self.nodes.iter().map(|n| n.state.parameter_count()).sum()
    }

    pub fn lowest_importance(&self) -> Option<f64> {
        self.nodes.iter().map(|n| n.importance).min_by(f64::total_cmp)
    }

    pub fn store_memory(
        &mut self,
        affect: AffectVector,
        state: ChainState,
        metadata: BTreeMap<String, String>,
    ) -> Result<StoreOutcome> {
        self.store_memory_at(affect, state, metadata, Utc::now())
    }

    pub fn store_memory_at(
        &mut self,
        affect: AffectVector,
        mut state: ChainState,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<StoreOutcome> {
        state.normalize()?;
        self.decay_all(now);

        let evicted = if self.nodes.len() >= self.config.capacity {
            self.evict_lowest()
        } else {
            None
        };

        let id = Uuid::new_v4();
        let mut node = MemoryNode {
            id,
            timestamp: now,
            affect,
            state,
            importance: 1.0,
            associations: Vec::new(),
            metadata,
            importance_updated_at: now,
            access_count: 0,
        };

        let threshold = self.config.association_threshold;
        let mut associations = 0;
        for other in &mut self.nodes {
            let similarity = affect.cosine_similarity(other.affect);
            if similarity > threshold {
                other.associate(id, similarity);
                node.associate(other.id, similarity);
                associations += 1;
            }
        }

        self.nodes.push(node);
        self.insertions += 1;

        let due = self.config.compress_every > 0
            && self.insertions % self.config.compress_every as u64 == 0;
        let compression_error = if due {
            self.compress().err().map(|e| e.to_string())
        } else {
            None
        };

        Ok(StoreOutcome {
            id,
            evicted,
            associations,
            compressed: due && compression_error.is_none(),
            compression_error,
        })
    }

    fn decay_all(&mut self, now: DateTime<Utc>) {
        for node in &mut self.nodes {
            node.decay_to(now, &self.config);
        }
    }

    /// Remove the least important node; ties go to the oldest.
    fn evict_lowest(&mut self) -> Option<(Uuid, f64)> {
        let idx = self
            .nodes
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.importance
                    .total_cmp(&b.importance)
                    .then(a.timestamp.cmp(&b.timestamp))
            })
            .map(|(i, _)| i)?;
        let node = self.nodes.remove(idx);
        self.drop_associations_to(node.id);
        Some((node.id, node.importance))
    }

    fn drop_associations_to(&mut self, id: Uuid) {
        for other in &mut self.nodes {
            other.associations.retain(|a| a.node_id != id);
        }
    }

    pub fn delete_memory(&mut self, id: Uuid) -> bool {
        let Some(idx) = self.nodes.iter().position(|n| n.id == id) else {
            return false;
        };
        self.nodes.remove(idx);
        self.drop_associations_to(id);
        true
    }

    pub fn find_similar_memories(&mut self, affect: AffectVector, top_k: usize) -> Vec<MemoryMatch> {
        self.find_similar_memories_at(affect, top_k, Utc::now())
    }

    /// Rank by `cosine similarity * importance`, newest first on ties, and
    /// refresh the importance of every returned node. Returned nodes whose
    /// similarity exceeds the association threshold are linked to each other,
    /// each link as strong as the weaker of the two hits.
    pub fn find_similar_memories_at(
        &mut self,
        affect: AffectVector,
        top_k: usize,
        now: DateTime<Utc>,
    ) -> Vec<MemoryMatch> {
        self.decay_all(now);

        let mut ranked: Vec<(usize, f64, f64)> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let similarity = affect.cosine_similarity(n.affect);
                (i, similarity, similarity * n.importance)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then(self.nodes[b.0].timestamp.cmp(&self.nodes[a.0].timestamp))
        });
        ranked.truncate(top_k);

        let boost = self.config.refresh_boost;
        let matches: Vec<MemoryMatch> = ranked
            .iter()
            .map(|&(i, similarity, score)| {
                let node = &mut self.nodes[i];
                node.importance = (node.importance + boost * similarity.max(0.0)).min(1.0);
                node.importance_updated_at = now;
                node.access_count += 1;
                MemoryMatch {
                    id: node.id,
                    affect: node.affect,
                    similarity,
                    score,
                    importance: node.importance,
                    timestamp: node.timestamp,
                }
            })
            .collect();

        let threshold = self.config.association_threshold;
        let strong: Vec<(usize, f64)> = ranked
            .iter()
            .filter(|(_, similarity, _)| *similarity > threshold)
            .map(|&(i, similarity, _)| (i, similarity))
            .collect();
        for (a, &(i, si)) in strong.iter().enumerate() {
            for &(j, sj) in &strong[a + 1..] {
                let strength = si.min(sj);
                let (id_i, id_j) = (self.nodes[i].id, self.nodes[j].id);
                self.nodes[i].associate(id_j, strength);
                self.nodes[j].associate(id_i, strength);
            }
        }
        matches
    }

    /// Re-truncate every node's chain and fold the pass into the running metrics.
    /// A failure on any node leaves every chain as it was.
    pub fn compress(&mut self) -> Result<CompressionMetrics> {
        if self.nodes.is_empty() {
            return Ok(self.metrics.clone());
        }
        let mut before = 0;
        let mut after = 0;
        let mut retained = 0.0;
        let mut max_bond = 1;
        let mut truncated = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut state = node.state.clone();
            let report = state.truncate(self.config.variance_threshold, self.config.max_bond_dim)?;
            before += report.parameters_before;
            after += report.parameters_after;
            retained += report.retained_variance;
            max_bond = max_bond.max(report.max_bond);
            truncated.push(state);
        }
        for (node, state) in self.nodes.iter_mut().zip(truncated) {
            node.state = state;
        }

        let pass_retained = retained / self.nodes.len() as f64;
        let runs = self.metrics.runs + 1;
        self.metrics = CompressionMetrics {
            runs,
            parameters_before: before,
            parameters_after: after,
            compression_ratio: if after > 0 { before as f64 / after as f64 } else { 1.0 },
            mean_retained_variance: (self.metrics.mean_retained_variance * self.metrics.runs as f64
                + pass_retained)
                / runs as f64,
            max_bond,
        };
        Ok(self.metrics.clone())
    }
}
