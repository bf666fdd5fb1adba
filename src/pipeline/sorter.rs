//! Sorting stage
//!
//! Keeps at most `cap` rows in a heap whose top is the worst kept row, so
//! a `LIMIT offset count` query never holds more than `offset + count`
//! rows regardless of how many match.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::pipeline::{BoxedProcessor, ExecContext, ResultProcessor, Row};
use crate::query::request::SortKey;
use crate::types::Value;
use crate::Result;

#[derive(Debug, Clone)]
enum SortBy {
    /// Score descending
    Score,
    Fields(Arc<[SortKey]>),
}

struct Entry {
    row: Row,
    seq: usize,
    by: SortBy,
}

impl Entry {
    /// `Less` means `self` ranks ahead of `other`.
    fn rank(&self, other: &Self) -> Ordering {
        let primary = match &self.by {
            SortBy::Score => other
                .row
                .score
                .partial_cmp(&self.row.score)
                .unwrap_or(Ordering::Equal),
            SortBy::Fields(keys) => {
                let mut ord = Ordering::Equal;
                for (i, key) in keys.iter().enumerate() {
                    let a = self.row.sort_keys.get(i).unwrap_or(&Value::Null);
                    let b = other.row.sort_keys.get(i).unwrap_or(&Value::Null);
                    ord = compare_key(a, b, key.ascending);
                    if ord != Ordering::Equal {
                        break;
                    }
                }
                ord
            }
        };
        primary
            .then(self.row.doc_id.cmp(&other.row.doc_id))
            .then(self.seq.cmp(&other.seq))
    }
}

/// Nulls sort last in either direction.
fn compare_key(a: &Value, b: &Value, ascending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ if ascending => a.cmp_sort(b),
        _ => b.cmp_sort(a),
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

pub struct Sorter {
    upstream: BoxedProcessor,
    by: SortBy,
    cap: Option<usize>,
    output: Option<std::vec::IntoIter<Row>>,
}

impl Sorter {
    pub fn by_score(upstream: BoxedProcessor, cap: Option<usize>) -> Self {
        Self {
            upstream,
            by: SortBy::Score,
            cap,
            output: None,
        }
    }

    pub fn by_fields(upstream: BoxedProcessor, keys: Vec<SortKey>, cap: Option<usize>) -> Self {
        Self {
            upstream,
            by: SortBy::Fields(keys.into()),
            cap,
            output: None,
        }
    }

    fn consume(&mut self, ctx: &mut ExecContext) -> Result<Vec<Row>> {
        let mut heap = BinaryHeap::new();
        let mut seq = 0;
        while let Some(mut row) = self.upstream.next(ctx)? {
            if let SortBy::Fields(keys) = &self.by {
                row.sort_keys = keys
                    .iter()
                    .map(|k| ctx.value(&row, &k.field).unwrap_or(Value::Null))
                    .collect();
            }
            if self.cap == Some(0) {
                continue;
            }
            heap.push(Entry {
                row,
                seq,
                by: self.by.clone(),
            });
            seq += 1;
            if self.cap.is_some_and(|cap| heap.len() > cap) {
                heap.pop();
            }
        }
        Ok(heap.into_sorted_vec().into_iter().map(|e| e.row).collect())
    }
}

impl ResultProcessor for Sorter {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.output.is_none() {
            let rows = self.consume(ctx)?;
            self.output = Some(rows.into_iter());
        }
        Ok(self.output.as_mut().and_then(Iterator::next))
    }

    fn name(&self) -> &'static str {
        "Sorter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{context, row, source};

    fn drain(mut sorter: Sorter) -> Vec<Row> {
        let mut ctx = context();
        let mut out = Vec::new();
        while let Some(r) = sorter.next(&mut ctx).unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_score_desc_with_id_tiebreak() {
        let rows = [(1, 0.5), (2, 0.9), (3, 0.9), (4, 0.1)]
            .iter()
            .map(|(id, s)| Row {
                score: *s,
                ..row(*id, &[])
            })
            .collect();
        let out = drain(Sorter::by_score(source(rows), Some(3)));
        let ids: Vec<_> = out.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_fields_with_nulls_last() {
        let rows = vec![
            row(1, &[("p", Value::Number(5.0))]),
            row(2, &[]),
            row(3, &[("p", Value::Number(9.0))]),
        ];
        let keys = vec![SortKey {
            field: "p".into(),
            ascending: false,
        }];
        let out = drain(Sorter::by_fields(source(rows), keys, None));
        let ids: Vec<_> = out.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(out[0].sort_keys, vec![Value::Number(9.0)]);
    }

    #[test]
    fn test_zero_cap_yields_nothing() {
        let rows = vec![row(1, &[])];
        assert!(drain(Sorter::by_score(source(rows), Some(0))).is_empty());
    }
}
