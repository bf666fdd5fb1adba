//! Tag index: exact values after separator split

use std::collections::BTreeMap;

use roaring::RoaringTreemap;

use crate::schema::TagOptions;
use crate::types::DocId;

/// One value in a `{a|b*}` tag query
#[derive(Debug, Clone, PartialEq)]
pub struct TagQuery {
    pub value: String,
    pub prefix: bool,
}

#[derive(Debug, Clone)]
pub struct TagIndex {
    options: TagOptions,
    values: BTreeMap<String, RoaringTreemap>,
    num_entries: u64,
}

impl TagIndex {
    pub fn new(options: TagOptions) -> Self {
        Self {
            options,
            values: BTreeMap::new(),
            num_entries: 0,
        }
    }

    /// Fold case unless the index was created case sensitive.
    pub fn normalize(&self, value: &str) -> String {
        if self.options.case_sensitive {
            value.to_string()
        } else {
            value.to_lowercase()
        }
    }

    /// Split raw values on the separator, trimming and dropping empties.
    pub fn split(&self, raw: &str) -> Vec<String> {
        raw.split(self.options.separator)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| self.normalize(s))
            .collect()
    }

    pub fn insert(&mut self, doc_id: DocId, tags: &[String]) {
        for tag in tags {
            if self.values.entry(tag.clone()).or_default().insert(doc_id) {
                self.num_entries += 1;
            }
        }
    }

    /// Ids carrying any of the queried values. Prefix matches are capped at
    /// `max_expansions` values; the flag reports truncation.
    pub fn query(&self, queries: &[TagQuery], max_expansions: usize) -> (Vec<DocId>, bool) {
        let mut acc = RoaringTreemap::new();
        let mut truncated = false;
        for q in queries {
            let value = self.normalize(&q.value);
            if q.prefix {
                let mut expanded = 0;
                for (tag, ids) in self.values.range(value.clone()..) {
                    if !tag.starts_with(&value) {
                        break;
                    }
                    if expanded >= max_expansions {
                        truncated = true;
                        break;
                    }
                    acc |= ids;
                    expanded += 1;
                }
            } else if let Some(ids) = self.values.get(&value) {
                acc |= ids;
            }
        }
        (acc.iter().collect(), truncated)
    }

    pub fn estimate(&self, queries: &[TagQuery]) -> usize {
        queries
            .iter()
            .map(|q| {
                let value = self.normalize(&q.value);
                if q.prefix {
                    self.values
                        .range(value.clone()..)
                        .take_while(|(t, _)| t.starts_with(&value))
                        .map(|(_, ids)| ids.len() as usize)
                        .sum()
                } else {
                    self.values.get(&value).map(|ids| ids.len() as usize).unwrap_or(0)
                }
            })
            .sum()
    }

    /// Distinct values, sorted.
    pub fn values(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn memory_usage(&self) -> usize {
        self.values
            .iter()
            .map(|(k, ids)| k.len() + ids.serialized_size())
            .sum()
    }

    /// Remove `dead` ids; values left without documents are dropped.
    pub fn collect_garbage(&mut self, dead: &[DocId]) -> usize {
        let dead: RoaringTreemap = dead.iter().copied().collect();
        let mut freed = 0;
        let mut removed = 0;
        self.values.retain(|tag, ids| {
            let before_bytes = ids.serialized_size();
            let before = ids.len();
            *ids -= &dead;
            removed += before - ids.len();
            if ids.is_empty() {
                freed += before_bytes + tag.len();
                false
            } else {
                freed += before_bytes.saturating_sub(ids.serialized_size());
                true
            }
        });
        self.num_entries -= removed.min(self.num_entries);
        // Bitmap compaction may not shrink; still report what was removed.
        freed.max(removed as usize * std::mem::size_of::<DocId>())
    }
}
