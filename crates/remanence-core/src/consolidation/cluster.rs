//! DBSCAN clustering over unit-norm embeddings
//!
//! Distance is cosine distance (`1 - cosine`). `eps` is derived per run
//! from the 90th percentile of nearest-neighbor distances in the working
//! set, clamped to a configured band, so the density threshold adapts to
//! however tight the corpus happens to be.

use std::collections::VecDeque;

use crate::embeddings::{cosine_similarity, normalize_in_place};

/// Cosine distance between two vectors
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Derive eps from the 90th percentile of nearest-neighbor distances,
/// clamped to `[floor, ceiling]`
pub fn derive_eps(vectors: &[Vec<f32>], floor: f32, ceiling: f32) -> f32 {
    if vectors.len() < 2 {
        return floor;
    }

    let mut nearest: Vec<f32> = Vec::with_capacity(vectors.len());
    for (i, a) in vectors.iter().enumerate() {
        let mut best = f32::MAX;
        for (j, b) in vectors.iter().enumerate() {
            if i == j {
                continue;
            }
            let d = cosine_distance(a, b);
            if d < best {
                best = d;
            }
        }
        nearest.push(best);
    }

    nearest.sort_by(f32::total_cmp);
    let index = ((nearest.len() as f32) * 0.9).floor() as usize;
    let p90 = nearest[index.min(nearest.len() - 1)];
    p90.clamp(floor, ceiling)
}

/// DBSCAN cluster assignment. Returns one label per input vector:
/// `Some(cluster_ordinal)` or `None` for noise points, which the pipeline
/// ignores. Neighborhoods include the point itself, so a cluster has at
/// least `min_samples` members.
pub fn dbscan(vectors: &[Vec<f32>], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let n = vectors.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_cluster = 0usize;

    let neighbors_of = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| cosine_distance(&vectors[i], &vectors[j]) <= eps)
            .collect()
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let seed_neighbors = neighbors_of(i);
        if seed_neighbors.len() < min_samples {
            continue; // noise (may still be captured by a later core point)
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut queue: VecDeque<usize> = seed_neighbors.into();
        while let Some(j) = queue.pop_front() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let reachable = neighbors_of(j);
            if reachable.len() >= min_samples {
                for k in reachable {
                    if labels[k].is_none() {
                        queue.push_back(k);
                    }
                }
            }
        }
    }

    labels
}

/// Renormalized mean of member vectors
pub fn centroid(members: &[&[f32]]) -> Vec<f32> {
    let Some(first) = members.first() else {
        return vec![];
    };
    let mut mean = vec![0.0_f32; first.len()];
    for member in members {
        for (slot, value) in mean.iter_mut().zip(member.iter()) {
            *slot += value;
        }
    }
    let count = members.len() as f32;
    for slot in &mut mean {
        *slot /= count;
    }
    normalize_in_place(&mut mean);
    mean
}

/// Theme for a cluster: the most frequent tag among members, ties broken
/// lexicographically; `cluster-<ordinal>` when members carry no tags.
pub fn choose_theme(member_tags: &[&[String]], ordinal: usize) -> String {
    let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for tags in member_tags {
        for tag in *tags {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(tag, _)| tag.to_string())
        .unwrap_or_else(|| format!("cluster-{ordinal}"))
}

// ============================================================================
// TESTS
// ============================================================================
