//! LIMIT stage

use crate::pipeline::{BoxedProcessor, ExecContext, ResultProcessor, Row};
use crate::Result;

/// Skips `offset` rows, then passes at most `limit`.
pub struct Pager {
    upstream: BoxedProcessor,
    offset: usize,
    limit: usize,
    seen: usize,
}

impl Pager {
    pub fn new(upstream: BoxedProcessor, offset: usize, limit: usize) -> Self {
        Self {
            upstream,
            offset,
            limit,
            seen: 0,
        }
    }
}

impl ResultProcessor for Pager {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        while self.seen < self.offset {
            if self.upstream.next(ctx)?.is_none() {
                return Ok(None);
            }
            self.seen += 1;
        }
        if self.seen >= self.offset.saturating_add(self.limit) {
            return Ok(None);
        }
        let row = self.upstream.next(ctx)?;
        if row.is_some() {
            self.seen += 1;
        }
        Ok(row)
    }

    fn name(&self) -> &'static str {
        "Pager/Limiter"
    }
}
