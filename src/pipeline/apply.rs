//! APPLY and FILTER stages

use crate::pipeline::{BoxedProcessor, ExecContext, ResultProcessor, Row};
use crate::query::expr::Expr;
use crate::types::Value;
use crate::Result;

fn evaluate(expr: &Expr, ctx: &ExecContext, row: &Row) -> Result<Value> {
    let lookup = |name: &str| ctx.value(row, name);
    expr.eval(&lookup)
}

/// Stores an expression result under `alias`. Rows whose evaluation fails
/// get a null value.
pub struct Apply {
    upstream: BoxedProcessor,
    expr: Expr,
    alias: String,
}

impl Apply {
    pub fn new(upstream: BoxedProcessor, expr: Expr, alias: String) -> Self {
        Self {
            upstream,
            expr,
            alias,
        }
    }
}

impl ResultProcessor for Apply {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        let Some(mut row) = self.upstream.next(ctx)? else {
            return Ok(None);
        };
        let value = evaluate(&self.expr, ctx, &row).unwrap_or(Value::Null);
        row.set(&self.alias, value);
        Ok(Some(row))
    }

    fn name(&self) -> &'static str {
        "Projector"
    }
}

/// Drops rows whose predicate is falsy or fails to evaluate.
pub struct Filter {
    upstream: BoxedProcessor,
    expr: Expr,
}

impl Filter {
    pub fn new(upstream: BoxedProcessor, expr: Expr) -> Self {
        Self { upstream, expr }
    }
}

impl ResultProcessor for Filter {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        while let Some(row) = self.upstream.next(ctx)? {
            if evaluate(&self.expr, ctx, &row).is_ok_and(|v| v.truthy()) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "Filter"
    }
}
