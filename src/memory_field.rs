//! Optional external memory-field service.
//!
//! Engines can be given a [`MemoryField`] to store observations in and recall
//! related fragments from. The field is advisory: an engine without one, or
//! one whose field errors, still perceives, decides and learns normally.

use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::SriaResult;

/// A stored piece of content, returned ranked by `score` from queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub field_id: String,
    pub content: String,
    pub significance: f64,
    /// Relevance to the query that returned it, in `[0, 1]`.
    #[serde(default)]
    pub score: f64,
    pub stored_at: u64,
}

/// Knowledge store consulted during perception and written during learning.
pub trait MemoryField: Send + Sync {
    /// Store `content` under `field_id`. Returns the new fragment id.
    fn store(&self, field_id: &str, content: &str, significance: f64) -> SriaResult<String>;

    /// Fragments in `field_id` scoring at least `threshold`, best first.
    fn query(&self, field_id: &str, query: &str, threshold: f64) -> SriaResult<Vec<Fragment>>;
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Fragments kept per field before the least significant is evicted.
pub const DEFAULT_FIELD_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct FieldEntries {
    next_id: u64,
    fragments: Vec<Fragment>,
}

/// Process-local [`MemoryField`] ranking fragments by token overlap weighted
/// by significance.
///
/// Each field holds at most `capacity` fragments. Storing into a full field
/// evicts the least significant fragment, oldest first on ties.
#[derive(Debug)]
pub struct InMemoryField {
    fields: DashMap<String, FieldEntries>,
    capacity: usize,
}

impl Default for InMemoryField {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FIELD_CAPACITY)
    }
}

impl InMemoryField {
    pub fn new() -> Self {
        Self::default()
    }

    /// A field store keeping at most `capacity` fragments per field (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of fragments stored under `field_id`.
    pub fn len(&self, field_id: &str) -> usize {
        self.fields
            .get(field_id)
            .map_or(0, |entries| entries.fragments.len())
    }
}

impl MemoryField for InMemoryField {
    fn store(&self, field_id: &str, content: &str, significance: f64) -> SriaResult<String> {
        let mut entries = self.fields.entry(field_id.to_string()).or_default();
        let id = format!("frag_{field_id}_{}", entries.next_id);
        entries.next_id += 1;

        if entries.fragments.len() >= self.capacity {
            let weakest = entries
                .fragments
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.significance.total_cmp(&b.significance))
                .map(|(i, _)| i);
            if let Some(i) = weakest {
                let evicted = entries.fragments.remove(i);
                tracing::debug!(field = field_id, fragment = %evicted.id, "memory field full, evicted");
            }
        }

        entries.fragments.push(Fragment {
            id: id.clone(),
            field_id: field_id.to_string(),
            content: content.to_string(),
            significance: significance.clamp(0.0, 1.0),
            score: 0.0,
            stored_at: crate::now_millis(),
        });
        Ok(id)
    }

    fn query(&self, field_id: &str, query: &str, threshold: f64) -> SriaResult<Vec<Fragment>> {
        let wanted = tokens(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let Some(entries) = self.fields.get(field_id) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Fragment> = entries
            .fragments
            .iter()
            .filter_map(|frag| {
                let have = tokens(&frag.content);
                let union = wanted.union(&have).count();
                if union == 0 {
                    return None;
                }
                let overlap = wanted.intersection(&have).count() as f64 / union as f64;
                let score = overlap * (0.5 + 0.5 * frag.significance);
                (score >= threshold).then(|| Fragment {
                    score,
                    ..frag.clone()
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits)
    }
}
