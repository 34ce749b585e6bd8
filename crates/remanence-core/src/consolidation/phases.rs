//! The five-phase consolidation pipeline
//!
//! decay -> association -> clustering -> compression -> forgetting
//!
//! Each phase reads a consistent snapshot through the storage engine and
//! writes back through the same API. Phases are idempotent per unit
//! (memory hash or cluster key), so a partially completed run is safe to
//! repeat. The pipeline never deletes a memory outside the forgetting
//! phase, and forgetting itself only archives until the grace window has
//! passed.
//!
//! All phases take an explicit `now` (epoch seconds) so scheduled runs,
//! catch-up runs, and tests are reproducible.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ConsolidationConfig;
use crate::consolidation::cluster::{centroid, choose_theme, dbscan, derive_eps};
use crate::embeddings::cosine_similarity;
use crate::memory::{Association, Cluster, SOURCE_HASHES_KEY, SUMMARY_TYPE};
use crate::service::OpBudget;
use crate::storage::{MemoryStore, SnapshotRow, StorageError};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Metadata key on summaries holding the deterministic cluster identity
const CLUSTER_KEY: &str = "cluster_key";

/// Tag stamped on every compression summary
const CONSOLIDATION_TAG: &str = "consolidation";

// ============================================================================
// PHASES AND REPORTS
// ============================================================================

/// A consolidation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Decay,
    Association,
    Clustering,
    Compression,
    Forgetting,
}

impl Phase {
    /// The full pipeline in execution order
    pub fn pipeline() -> [Phase; 5] {
        [
            Phase::Decay,
            Phase::Association,
            Phase::Clustering,
            Phase::Compression,
            Phase::Forgetting,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Decay => "decay",
            Phase::Association => "association",
            Phase::Clustering => "clustering",
            Phase::Compression => "compression",
            Phase::Forgetting => "forgetting",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "decay" => Ok(Phase::Decay),
            "association" | "associations" => Ok(Phase::Association),
            "clustering" => Ok(Phase::Clustering),
            "compression" => Ok(Phase::Compression),
            "forgetting" => Ok(Phase::Forgetting),
            other => Err(format!("unknown consolidation phase: {other}")),
        }
    }
}

/// Result of one phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub phase: Phase,
    pub duration_ms: u64,
    /// Units examined (memories, pairs, or clusters depending on phase)
    pub processed: usize,
    /// Units written (scores cached, pairs upserted, clusters stored,
    /// summaries created, memories archived + purged)
    pub changed: usize,
    pub details: Vec<String>,
}

/// Result of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub started_at: f64,
    pub finished_at: f64,
    pub phases: Vec<PhaseReport>,
}

/// Consolidation error taxonomy
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConsolidationError {
    /// The run lock is held by another run (possibly another process)
    #[error("consolidation already running")]
    AlreadyRunning,
    /// A phase failed; the run aborted, state is safe, the lock released
    #[error("consolidation phase {phase} failed: {message}")]
    PhaseFailed { phase: Phase, message: String },
    /// Failure outside any phase (lock bookkeeping, run records)
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ============================================================================
// CONSOLIDATOR
// ============================================================================

/// Runs consolidation phases against a store handle
pub struct Consolidator {
    store: Arc<MemoryStore>,
    config: ConsolidationConfig,
}

impl Consolidator {
    pub fn new(store: Arc<MemoryStore>, config: ConsolidationConfig) -> Self {
        Self { store, config }
    }

    /// Run the given phases in order, aborting on the first failure
    pub fn run(
        &self,
        phases: &[Phase],
        now: f64,
        budget: &OpBudget,
    ) -> Result<RunReport, ConsolidationError> {
        let started_at = now;
        let mut reports = Vec::with_capacity(phases.len());

        for phase in phases {
            budget.check("consolidate").map_err(|e| ConsolidationError::PhaseFailed {
                phase: *phase,
                message: e.to_string(),
            })?;
            let report = self.run_phase(*phase, now, budget)?;
            tracing::info!(
                phase = phase.as_str(),
                processed = report.processed,
                changed = report.changed,
                duration_ms = report.duration_ms,
                "consolidation phase complete"
            );
            reports.push(report);
        }

        Ok(RunReport {
            started_at,
            finished_at: self.store.now_pair().epoch.max(now),
            phases: reports,
        })
    }

    /// Run a single phase
    pub fn run_phase(
        &self,
        phase: Phase,
        now: f64,
        budget: &OpBudget,
    ) -> Result<PhaseReport, ConsolidationError> {
        let wrap = |e: StorageError| ConsolidationError::PhaseFailed {
            phase,
            message: e.to_string(),
        };
        match phase {
            Phase::Decay => self.phase_decay(now, budget).map_err(wrap),
            Phase::Association => self.phase_association(now, budget).map_err(wrap),
            Phase::Clustering => self.phase_clustering(now, budget).map_err(wrap),
            Phase::Compression => self.phase_compression(now, budget).map_err(wrap),
            Phase::Forgetting => self.phase_forgetting(now, budget).map_err(wrap),
        }
    }

    // ========================================================================
    // PHASE 1: EXPONENTIAL DECAY SCORING
    // ========================================================================
    //
    // score = exp(-age_days / retention_days(type)); pinned memories are
    // forced to 1.0. Scores live in the transient decay_scores cache, not
    // on the memory rows.

    fn phase_decay(&self, now: f64, budget: &OpBudget) -> Result<PhaseReport, StorageError> {
        let started = Instant::now();
        let snapshot = self.store.load_snapshot(false)?;

        let mut scores = Vec::with_capacity(snapshot.len());
        let mut pinned = 0usize;
        for (index, row) in snapshot.iter().enumerate() {
            if index % 256 == 0 {
                budget.check("decay")?;
            }
            let score = if row.pinned {
                pinned += 1;
                1.0
            } else {
                decay_score(row, now, &self.config)
            };
            scores.push((row.content_hash.clone(), score));
        }

        self.store.replace_decay_scores(&scores, now)?;

        let below_threshold = scores
            .iter()
            .filter(|(_, s)| *s < self.config.forgetting.relevance_threshold)
            .count();

        Ok(PhaseReport {
            phase: Phase::Decay,
            duration_ms: started.elapsed().as_millis() as u64,
            processed: snapshot.len(),
            changed: scores.len(),
            details: vec![
                format!("{pinned} pinned memories held at 1.0"),
                format!("{below_threshold} memories below the relevance threshold"),
            ],
        })
    }

    // ========================================================================
    // PHASE 2: CREATIVE ASSOCIATION DISCOVERY
    // ========================================================================
    //
    // Sample memory pairs whose cosine similarity falls in the creative
    // band. Pair order is derived from the hash ordering of the snapshot,
    // which is stable for a given corpus and uncorrelated with insertion
    // order. Existing pairs are refreshed with the latest similarity.

    fn phase_association(&self, now: f64, budget: &OpBudget) -> Result<PhaseReport, StorageError> {
        let started = Instant::now();

        let cutoff = now - self.config.artifact_retention_days.0 * SECONDS_PER_DAY;
        let (purged_associations, purged_clusters) = self.store.purge_artifacts_before(cutoff)?;

        let mut snapshot = self.store.load_snapshot(false)?;
        snapshot.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));

        let band = &self.config.association;
        let cap = band.max_pairs_per_run;
        let mut evaluated = 0usize;
        let mut new_pairs = 0usize;
        let mut refreshed = 0usize;

        'outer: for i in 0..snapshot.len() {
            budget.check("association")?;
            for j in (i + 1)..snapshot.len() {
                if new_pairs + refreshed >= cap {
                    break 'outer;
                }
                evaluated += 1;
                let similarity =
                    cosine_similarity(&snapshot[i].embedding, &snapshot[j].embedding);
                if similarity < band.low || similarity > band.high {
                    continue;
                }
                let association = Association::ordered(
                    &snapshot[i].content_hash,
                    &snapshot[j].content_hash,
                    similarity,
                    now,
                );
                if self.store.upsert_association(&association)? {
                    new_pairs += 1;
                } else {
                    refreshed += 1;
                }
            }
        }

        Ok(PhaseReport {
            phase: Phase::Association,
            duration_ms: started.elapsed().as_millis() as u64,
            processed: evaluated,
            changed: new_pairs + refreshed,
            details: vec![
                format!("{new_pairs} new pairs, {refreshed} refreshed"),
                format!(
                    "band [{:.2}, {:.2}], cap {cap}",
                    band.low, band.high
                ),
                format!(
                    "purged {purged_associations} stale associations, {purged_clusters} stale clusters"
                ),
            ],
        })
    }

    // ========================================================================
    // PHASE 3: SEMANTIC CLUSTERING
    // ========================================================================
    //
    // DBSCAN over live non-summary embeddings, eps derived per run. Prior
    // clusters are replaced atomically. Member order inside a cluster is
    // created_at ascending, which compression relies on.

    fn phase_clustering(&self, now: f64, budget: &OpBudget) -> Result<PhaseReport, StorageError> {
        let started = Instant::now();

        let snapshot: Vec<SnapshotRow> = self
            .store
            .load_snapshot(false)?
            .into_iter()
            .filter(|row| row.memory_type.as_deref() != Some(SUMMARY_TYPE))
            .collect();

        budget.check("clustering")?;

        let vectors: Vec<Vec<f32>> = snapshot.iter().map(|r| r.embedding.clone()).collect();
        let eps = derive_eps(
            &vectors,
            self.config.cluster.eps_floor,
            self.config.cluster.eps_ceiling,
        );
        let labels = dbscan(&vectors, eps, self.config.cluster.min_samples);

        budget.check("clustering")?;

        let cluster_count = labels.iter().flatten().max().map_or(0, |m| m + 1);
        let mut clusters = Vec::with_capacity(cluster_count);
        for ordinal in 0..cluster_count {
            let mut members: Vec<&SnapshotRow> = labels
                .iter()
                .zip(snapshot.iter())
                .filter(|(label, _)| **label == Some(ordinal))
                .map(|(_, row)| row)
                .collect();
            members.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));

            let member_vectors: Vec<&[f32]> =
                members.iter().map(|r| r.embedding.as_slice()).collect();
            let member_tags: Vec<&[String]> = members.iter().map(|r| r.tags.as_slice()).collect();

            clusters.push(Cluster {
                cluster_id: uuid::Uuid::new_v4().to_string(),
                theme: choose_theme(&member_tags, ordinal),
                centroid: centroid(&member_vectors),
                member_hashes: members.iter().map(|r| r.content_hash.clone()).collect(),
                created_at: now,
            });
        }

        let noise = labels.iter().filter(|l| l.is_none()).count();
        self.store.replace_clusters(&clusters)?;

        Ok(PhaseReport {
            phase: Phase::Clustering,
            duration_ms: started.elapsed().as_millis() as u64,
            processed: snapshot.len(),
            changed: clusters.len(),
            details: vec![
                format!("eps {eps:.3}, min_samples {}", self.config.cluster.min_samples),
                format!("{} clusters, {noise} noise points", clusters.len()),
            ],
        })
    }

    // ========================================================================
    // PHASE 4: MEMORY COMPRESSION
    // ========================================================================
    //
    // Each qualifying cluster is compressed into a summary memory: the
    // leading fragment of every member, oldest first, truncated at the
    // configured limit. The summary's identity key is the hash of the
    // sorted member hashes, so re-running the phase on an unchanged
    // cluster is a no-op. Originals are never touched.

    fn phase_compression(&self, now: f64, budget: &OpBudget) -> Result<PhaseReport, StorageError> {
        let started = Instant::now();

        let clusters = self.store.clusters()?;
        let existing_keys: HashSet<String> = self
            .store
            .summaries()?
            .into_iter()
            .filter_map(|m| {
                m.metadata
                    .get(CLUSTER_KEY)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();

        let mut created = 0usize;
        let mut skipped = 0usize;
        for cluster in &clusters {
            budget.check("compression")?;
            if cluster.member_hashes.len() < self.config.cluster.min_samples {
                continue;
            }

            let key = cluster_key(&cluster.member_hashes);
            if existing_keys.contains(&key) {
                skipped += 1;
                continue;
            }

            let mut members = Vec::with_capacity(cluster.member_hashes.len());
            for hash in &cluster.member_hashes {
                if let Some(memory) = self.store.get_by_hash(hash)? {
                    members.push(memory);
                }
            }
            if members.len() < self.config.cluster.min_samples {
                continue;
            }
            members.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));

            let content = summarize(
                members.iter().map(|m| m.content.as_str()),
                self.config.compression.max_chars,
            );

            // Theme tags come from member tags, which are length-limited,
            // but the "cluster:" prefix can push them past the cap
            let theme_tag: String = format!("cluster:{}", cluster.theme)
                .chars()
                .take(crate::storage::MAX_TAG_LEN)
                .collect();
            let mut tags = vec![CONSOLIDATION_TAG.to_string(), theme_tag];
            for member in &members {
                for tag in &member.tags {
                    if tags.len() >= self.config.compression.max_tags {
                        break;
                    }
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
            }

            let mut metadata = Map::new();
            metadata.insert(
                SOURCE_HASHES_KEY.to_string(),
                Value::Array(
                    members
                        .iter()
                        .map(|m| Value::from(m.content_hash.clone()))
                        .collect(),
                ),
            );
            metadata.insert(CLUSTER_KEY.to_string(), Value::from(key));
            metadata.insert("theme".to_string(), Value::from(cluster.theme.clone()));

            let outcome = self
                .store
                .store(&content, &tags, Some(SUMMARY_TYPE), metadata)?;
            if outcome.success {
                created += 1;
            } else {
                skipped += 1;
            }
        }

        Ok(PhaseReport {
            phase: Phase::Compression,
            duration_ms: started.elapsed().as_millis() as u64,
            processed: clusters.len(),
            changed: created,
            details: vec![format!("{created} summaries created, {skipped} already present")],
        })
    }

    // ========================================================================
    // PHASE 5: CONTROLLED FORGETTING
    // ========================================================================
    //
    // Memories past the age gate whose decay score fell below the
    // relevance threshold are archived (tagged, retained). Pinned memories
    // and memories referenced by any surviving summary are exempt.
    // Archived memories past the grace window are hard-deleted.

    fn phase_forgetting(&self, now: f64, budget: &OpBudget) -> Result<PhaseReport, StorageError> {
        let started = Instant::now();
        let forgetting = &self.config.forgetting;

        let mut scores = self.store.decay_scores()?;
        let snapshot = self.store.load_snapshot(false)?;

        // A standalone forgetting run may find the cache empty or partial;
        // recompute missing scores rather than treating them as zero
        for row in &snapshot {
            scores.entry(row.content_hash.clone()).or_insert_with(|| {
                if row.pinned {
                    1.0
                } else {
                    decay_score(row, now, &self.config)
                }
            });
        }

        let protected: HashSet<String> = self
            .store
            .summaries()?
            .iter()
            .flat_map(|summary| summary.source_hashes())
            .collect();

        let mut archived = 0usize;
        for (index, row) in snapshot.iter().enumerate() {
            if index % 64 == 0 {
                budget.check("forgetting")?;
            }
            if row.pinned || protected.contains(&row.content_hash) {
                continue;
            }
            let age_days = (now - row.created_at) / SECONDS_PER_DAY;
            if age_days <= forgetting.access_threshold_days {
                continue;
            }
            let score = scores.get(&row.content_hash).copied().unwrap_or(1.0);
            if score >= forgetting.relevance_threshold {
                continue;
            }
            if self.store.archive_memory(&row.content_hash, now)? {
                archived += 1;
            }
        }

        let purge_cutoff = now - forgetting.grace_days * SECONDS_PER_DAY;
        let purged = self.store.purge_archived_before(purge_cutoff)?;

        Ok(PhaseReport {
            phase: Phase::Forgetting,
            duration_ms: started.elapsed().as_millis() as u64,
            processed: snapshot.len(),
            changed: archived + purged,
            details: vec![
                format!("{archived} memories archived"),
                format!("{purged} archived memories past the grace window purged"),
                format!("{} memories protected by summaries", protected.len()),
            ],
        })
    }
}

/// Decay score for one memory
fn decay_score(row: &SnapshotRow, now: f64, config: &ConsolidationConfig) -> f64 {
    let age_days = ((now - row.created_at) / SECONDS_PER_DAY).max(0.0);
    let retention = config.retention.days_for(row.memory_type.as_deref()).max(f64::EPSILON);
    (-age_days / retention).exp().clamp(0.0, 1.0)
}

/// Deterministic identity of a cluster: hash of its sorted member hashes
fn cluster_key(member_hashes: &[String]) -> String {
    let mut sorted: Vec<&String> = member_hashes.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for hash in sorted {
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Extractive summary: the leading sentence (or fragment) of each input
/// in order, truncated with an ellipsis at the character limit
fn summarize<'a>(contents: impl Iterator<Item = &'a str>, max_chars: usize) -> String {
    let mut out = String::new();
    for content in contents {
        let fragment = leading_fragment(content);
        if fragment.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(fragment);
        if out.chars().count() >= max_chars {
            break;
        }
    }
    if out.chars().count() > max_chars {
        let truncated: String = out.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", truncated.trim_end())
    } else {
        out
    }
}

/// First sentence of a text, or its first 120 characters when no sentence
/// terminator appears early enough
fn leading_fragment(content: &str) -> &str {
    let trimmed = content.trim();
    for (index, ch) in trimmed.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            return &trimmed[..index + ch.len_utf8()];
        }
        if ch == '\n' {
            return trimmed[..index].trim_end();
        }
    }
    match trimmed.char_indices().nth(120) {
        Some((index, _)) => &trimmed[..index],
        None => trimmed,
    }
}

// ============================================================================
// TESTS
// ============================================================================
