use crate::marker::extract_markers;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Transport shape for one synthesized fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub code: String,
    pub libs: Vec<String>,
}

/// Bounded, insertion-ordered prompt -> fragment map. Oldest-inserted
/// entries are evicted first once the capacity is exceeded. Re-inserting an
/// existing prompt updates the fragment without changing its slot.
#[derive(Debug, Clone)]
pub struct PromptCache {
    entries: IndexMap<String, Fragment>,
    capacity: usize,
}

impl PromptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, prompt: &str) -> Option<&Fragment> {
        self.entries.get(prompt)
    }

    pub fn contains(&self, prompt: &str) -> bool {
        self.entries.contains_key(prompt)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, prompt: String, fragment: Fragment) {
        self.entries.insert(prompt, fragment);
        while self.entries.len() > self.capacity {
            if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
                tracing::debug!("prompt cache evicted oldest entry: {evicted:?}");
            }
        }
    }

    /// Drops every entry whose prompt no longer appears as a live marker in
    /// the current text. Invoked on every text change so the cache tracks
    /// the program instead of growing across iterative edits.
    pub fn prune_to_live(&mut self, raw_text: &str) {
        let live: HashSet<String> = extract_markers(raw_text)
            .into_iter()
            .map(|marker| marker.prompt)
            .collect();
        self.entries.retain(|prompt, _| live.contains(prompt));
    }

    /// Union of the required libraries across all cached fragments, in
    /// first-seen order. The import normalizer imposes its own table order.
    pub fn libs_union(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut union = Vec::new();
        for fragment in self.entries.values() {
            for lib in &fragment.libs {
                if seen.insert(lib.clone()) {
                    union.push(lib.clone());
                }
            }
        }
        union
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpliceOutcome {
    pub text: String,
    pub uncached: Vec<String>,
}

/// Replaces every marker whose prompt is cached with the fragment code,
/// wrapped in single newline padding to preserve statement separation.
/// Uncached markers stay in place byte-for-byte and their prompt is appended
/// to the miss list once per occurrence, in first-seen order. The cache is
/// not mutated.
pub fn splice(raw: &str, cache: &PromptCache) -> SpliceOutcome {
    let markers = extract_markers(raw);
    if markers.is_empty() {
        return SpliceOutcome {
            text: raw.to_string(),
            uncached: Vec::new(),
        };
    }

    let mut text = String::with_capacity(raw.len());
    let mut uncached = Vec::new();
    let mut cursor = 0;
    for marker in &markers {
        text.push_str(&raw[cursor..marker.span.start]);
        match cache.get(&marker.prompt) {
            Some(fragment) => {
                text.push('\n');
                text.push_str(&fragment.code);
                text.push('\n');
            }
            None => {
                text.push_str(&marker.full_match);
                uncached.push(marker.prompt.clone());
            }
        }
        cursor = marker.span.end;
    }
    text.push_str(&raw[cursor..]);

    SpliceOutcome { text, uncached }
}
