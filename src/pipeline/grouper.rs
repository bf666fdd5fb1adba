//! GROUPBY stage

use std::collections::HashMap;

use crate::pipeline::reducers::{Accumulator, ReducerSpec};
use crate::pipeline::{BoxedProcessor, ExecContext, ResultProcessor, Row};
use crate::types::Value;
use crate::Result;

struct Group {
    keys: Vec<Value>,
    accumulators: Vec<Box<dyn Accumulator>>,
}

/// Drains upstream, then yields one row per distinct key tuple.
///
/// Array values fan out: a row whose key is `[a, b]` joins both groups.
pub struct Grouper {
    upstream: BoxedProcessor,
    keys: Vec<String>,
    reducers: Vec<ReducerSpec>,
    output: Option<std::vec::IntoIter<Row>>,
}

impl Grouper {
    pub fn new(upstream: BoxedProcessor, keys: Vec<String>, reducers: Vec<ReducerSpec>) -> Self {
        Self {
            upstream,
            keys,
            reducers,
            output: None,
        }
    }

    fn key_tuples(&self, ctx: &ExecContext, row: &Row) -> Vec<Vec<Value>> {
        let mut tuples = vec![Vec::with_capacity(self.keys.len())];
        for key in &self.keys {
            let values = match ctx.value(row, key) {
                Some(Value::Array(items)) if !items.is_empty() => items,
                Some(v) => vec![v],
                None => vec![Value::Null],
            };
            tuples = tuples
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut t = prefix.clone();
                        t.push(v.clone());
                        t
                    })
                })
                .collect();
        }
        tuples
    }

    fn consume(&mut self, ctx: &mut ExecContext) -> Result<Vec<Row>> {
        let mut order: Vec<Group> = Vec::new();
        let mut index: HashMap<Vec<String>, usize> = HashMap::new();
        while let Some(row) = self.upstream.next(ctx)? {
            for tuple in self.key_tuples(ctx, &row) {
                let fingerprint: Vec<String> = tuple
                    .iter()
                    .map(|v| if v.is_null() { "\0null".to_string() } else { v.to_string() })
                    .collect();
                let slot = *index.entry(fingerprint).or_insert_with(|| {
                    order.push(Group {
                        keys: tuple,
                        accumulators: self.reducers.iter().map(ReducerSpec::accumulator).collect(),
                    });
                    order.len() - 1
                });
                for acc in &mut order[slot].accumulators {
                    acc.add(ctx, &row);
                }
            }
        }
        ctx.total_results = order.len();
        Ok(order
            .into_iter()
            .map(|mut group| {
                let mut row = Row::default();
                for (name, value) in self.keys.iter().zip(group.keys) {
                    row.values.push((name.clone(), value));
                }
                for (spec, acc) in self.reducers.iter().zip(group.accumulators.iter_mut()) {
                    row.values.push((spec.alias.clone(), acc.finish()));
                }
                row
            })
            .collect())
    }
}

impl ResultProcessor for Grouper {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.output.is_none() {
            let rows = self.consume(ctx)?;
            self.output = Some(rows.into_iter());
        }
        Ok(self.output.as_mut().and_then(Iterator::next))
    }

    fn name(&self) -> &'static str {
        "Grouper"
    }
}
