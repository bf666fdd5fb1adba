//! Root stage: turns iterator matches into rows

use std::sync::Arc;

use crate::index::DocTable;
use crate::pipeline::{ExecContext, ResultProcessor, Row};
use crate::query::iterators::{BoxedIterator, ReadStatus};
use crate::types::Value;
use crate::Result;

/// Reads the iterator tree, skipping ids that are no longer live.
///
/// Vector distances found in the record are exposed as row values under
/// their yield names.
pub struct IndexStage {
    root: BoxedIterator,
    docs: Arc<DocTable>,
    done: bool,
}

impl IndexStage {
    pub fn new(root: BoxedIterator, docs: Arc<DocTable>) -> Self {
        Self {
            root,
            docs,
            done: false,
        }
    }
}

impl ResultProcessor for IndexStage {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if ctx.check.tick() {
                self.done = true;
                ctx.on_timeout()?;
                return Ok(None);
            }
            match self.root.read() {
                ReadStatus::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                ReadStatus::TimedOut => {
                    self.done = true;
                    ctx.on_timeout()?;
                    return Ok(None);
                }
                ReadStatus::Ok | ReadStatus::NotFound => {}
            }
            let id = self.root.current_id();
            let Some(meta) = self.docs.get(id) else {
                continue;
            };
            ctx.total_results += 1;
            let record = self.root.record().clone();
            let mut row = Row::for_doc(meta);
            let mut distances = Vec::new();
            record.distances(&mut distances);
            for (name, distance) in distances {
                row.set(&name, Value::Number(distance));
            }
            row.record = Some(record);
            return Ok(Some(row));
        }
    }

    fn name(&self) -> &'static str {
        "Index"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::DocMeta;
    use crate::pipeline::tests::context;
    use crate::query::iterators::IdListIterator;
    use crate::query::timeout::{Deadline, TimeoutCheck};
    use crate::types::TimeoutPolicy;
    use crate::Error;

    fn table(keys: &[&str]) -> Arc<DocTable> {
        let docs = Arc::new(DocTable::new());
        for key in keys {
            let mut meta = DocMeta::new(key, 1.0);
            meta.id = docs.next_id();
            docs.insert(meta);
        }
        docs
    }

    #[test]
    fn test_skips_deleted_ids() {
        let docs = table(&["a", "b", "c"]);
        docs.remove("b");
        let root = IdListIterator::new(vec![1, 2, 3], 1.0).boxed();
        let mut stage = IndexStage::new(root, docs);
        let mut ctx = context();
        assert_eq!(stage.next(&mut ctx).unwrap().unwrap().key(), Some("a"));
        assert_eq!(stage.next(&mut ctx).unwrap().unwrap().key(), Some("c"));
        assert!(stage.next(&mut ctx).unwrap().is_none());
        assert_eq!(ctx.total_results, 2);
    }

    #[test]
    fn test_distances_become_values() {
        let docs = table(&["a"]);
        let root = IdListIterator::with_distances(vec![(1, 0.25)], 1.0, "dist").boxed();
        let mut stage = IndexStage::new(root, docs);
        let row = stage.next(&mut context()).unwrap().unwrap();
        assert_eq!(row.get("dist"), Some(&Value::Number(0.25)));
    }

    #[test]
    fn test_timeout_policies() {
        let docs = table(&["a", "b"]);
        let mut ctx = context();
        ctx.check = TimeoutCheck::new(Deadline::expired(), 1);
        let mut stage = IndexStage::new(IdListIterator::new(vec![1, 2], 1.0).boxed(), docs.clone());
        assert!(stage.next(&mut ctx).unwrap().is_none());
        assert!(ctx.timed_out);

        let mut ctx = context();
        ctx.check = TimeoutCheck::new(Deadline::expired(), 1);
        ctx.policy = TimeoutPolicy::Fail;
        let mut stage = IndexStage::new(IdListIterator::new(vec![1, 2], 1.0).boxed(), docs);
        assert!(matches!(stage.next(&mut ctx), Err(Error::Timeout)));
    }
}
