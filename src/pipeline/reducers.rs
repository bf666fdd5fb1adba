//! GROUPBY reducers

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::pipeline::{ExecContext, Row};
use crate::types::Value;
use crate::{Error, Result};

const HLL_BITS: u32 = 8;
const HLL_REGISTERS: usize = 1 << HLL_BITS;

#[derive(Debug, Clone, PartialEq)]
pub enum ReducerKind {
    Count,
    CountDistinct(String),
    /// Approximate distinct count (HyperLogLog)
    CountDistinctish(String),
    Sum(String),
    Min(String),
    Max(String),
    Avg(String),
    ToList(String),
    FirstValue {
        field: String,
        by: Option<(String, bool)>,
    },
    StdDev(String),
    Quantile(String, f64),
    RandomSample(String, usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducerSpec {
    pub kind: ReducerKind,
    pub alias: String,
}

impl ReducerSpec {
    /// Parse `REDUCE name nargs args... [AS alias]` after the count has been consumed.
    pub fn parse(name: &str, args: &[String], alias: Option<String>) -> Result<Self> {
        let upper = name.to_ascii_uppercase();
        let arity = |n: usize| -> Result<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(Error::bad_argument(format!(
                    "{upper} expects {n} argument(s), got {}",
                    args.len()
                )))
            }
        };
        let kind = match upper.as_str() {
            "COUNT" => {
                arity(0)?;
                ReducerKind::Count
            }
            "COUNT_DISTINCT" => {
                arity(1)?;
                ReducerKind::CountDistinct(field_arg(&args[0])?)
            }
            "COUNT_DISTINCTISH" => {
                arity(1)?;
                ReducerKind::CountDistinctish(field_arg(&args[0])?)
            }
            "SUM" => {
                arity(1)?;
                ReducerKind::Sum(field_arg(&args[0])?)
            }
            "MIN" => {
                arity(1)?;
                ReducerKind::Min(field_arg(&args[0])?)
            }
            "MAX" => {
                arity(1)?;
                ReducerKind::Max(field_arg(&args[0])?)
            }
            "AVG" => {
                arity(1)?;
                ReducerKind::Avg(field_arg(&args[0])?)
            }
            "TOLIST" => {
                arity(1)?;
                ReducerKind::ToList(field_arg(&args[0])?)
            }
            "STDDEV" => {
                arity(1)?;
                ReducerKind::StdDev(field_arg(&args[0])?)
            }
            "QUANTILE" => {
                arity(2)?;
                let q = crate::types::parse_f64(&args[1])
                    .filter(|q| (0.0..=1.0).contains(q))
                    .ok_or_else(|| Error::bad_argument("Quantile must be between 0 and 1"))?;
                ReducerKind::Quantile(field_arg(&args[0])?, q)
            }
            "RANDOM_SAMPLE" => {
                arity(2)?;
                let size = args[1]
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| Error::bad_argument("Sample size must be a positive integer"))?;
                ReducerKind::RandomSample(field_arg(&args[0])?, size)
            }
            "FIRST_VALUE" => {
                let field = field_arg(args.first().ok_or_else(|| {
                    Error::bad_argument("FIRST_VALUE expects at least 1 argument")
                })?)?;
                let by = match args.len() {
                    1 => None,
                    3 | 4 if args[1].eq_ignore_ascii_case("BY") => {
                        let ascending = match args.get(3).map(|s| s.to_ascii_uppercase()) {
                            None => true,
                            Some(dir) if dir == "ASC" => true,
                            Some(dir) if dir == "DESC" => false,
                            Some(dir) => {
                                return Err(Error::bad_argument(format!("Bad sort direction `{dir}`")))
                            }
                        };
                        Some((field_arg(&args[2])?, ascending))
                    }
                    _ => return Err(Error::bad_argument("FIRST_VALUE syntax: @field [BY @sort [ASC|DESC]]")),
                };
                ReducerKind::FirstValue { field, by }
            }
            other => return Err(Error::bad_argument(format!("Unknown reducer `{other}`"))),
        };
        let alias = alias.unwrap_or_else(|| {
            let field = args.first().map(|f| f.trim_start_matches('@')).unwrap_or("");
            format!("__generated_alias{}{}", upper.to_ascii_lowercase(), field)
        });
        Ok(Self { kind, alias })
    }

    /// Fresh per-group state.
    pub fn accumulator(&self) -> Box<dyn Accumulator> {
        match &self.kind {
            ReducerKind::Count => Box::new(Count(0)),
            ReducerKind::CountDistinct(f) => Box::new(CountDistinct {
                field: f.clone(),
                seen: HashSet::new(),
            }),
            ReducerKind::CountDistinctish(f) => Box::new(HyperLogLog {
                field: f.clone(),
                registers: vec![0; HLL_REGISTERS],
            }),
            ReducerKind::Sum(f) => Box::new(Sum {
                field: f.clone(),
                total: 0.0,
            }),
            ReducerKind::Min(f) => Box::new(Extremum {
                field: f.clone(),
                best: None,
                max: false,
            }),
            ReducerKind::Max(f) => Box::new(Extremum {
                field: f.clone(),
                best: None,
                max: true,
            }),
            ReducerKind::Avg(f) => Box::new(Avg {
                field: f.clone(),
                total: 0.0,
                count: 0,
            }),
            ReducerKind::ToList(f) => Box::new(ToList {
                field: f.clone(),
                seen: HashSet::new(),
                values: Vec::new(),
            }),
            ReducerKind::FirstValue { field, by } => Box::new(FirstValue {
                field: field.clone(),
                by: by.clone(),
                best: None,
            }),
            ReducerKind::StdDev(f) => Box::new(Samples::new(f, SampleOutput::StdDev)),
            ReducerKind::Quantile(f, q) => Box::new(Samples::new(f, SampleOutput::Quantile(*q))),
            ReducerKind::RandomSample(f, n) => Box::new(RandomSample {
                field: f.clone(),
                size: *n,
                seen: 0,
                sample: Vec::new(),
            }),
        }
    }
}

fn field_arg(raw: &str) -> Result<String> {
    raw.strip_prefix('@')
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::bad_argument(format!("Bad reducer argument `{raw}`: expected @field")))
}

/// Per-group reducer state
pub trait Accumulator: Send {
    fn add(&mut self, ctx: &ExecContext, row: &Row);

    fn finish(&mut self) -> Value;
}

/// Numbers found for `field`, flattening arrays.
fn numbers(ctx: &ExecContext, row: &Row, field: &str) -> Vec<f64> {
    match ctx.value(row, field) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_number).collect(),
        Some(v) => v.as_number().into_iter().collect(),
        None => Vec::new(),
    }
}

struct Count(u64);

impl Accumulator for Count {
    fn add(&mut self, _ctx: &ExecContext, _row: &Row) {
        self.0 += 1;
    }

    fn finish(&mut self) -> Value {
        Value::Number(self.0 as f64)
    }
}

struct CountDistinct {
    field: String,
    seen: HashSet<String>,
}

impl Accumulator for CountDistinct {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        if let Some(v) = ctx.value(row, &self.field) {
            if !v.is_null() {
                self.seen.insert(v.to_string());
            }
        }
    }

    fn finish(&mut self) -> Value {
        Value::Number(self.seen.len() as f64)
    }
}

struct HyperLogLog {
    field: String,
    registers: Vec<u8>,
}

impl Accumulator for HyperLogLog {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        let Some(v) = ctx.value(row, &self.field).filter(|v| !v.is_null()) else {
            return;
        };
        let mut hasher = DefaultHasher::new();
        v.to_string().hash(&mut hasher);
        let hash = hasher.finish();
        let index = (hash >> (64 - HLL_BITS)) as usize;
        let rest = (hash << HLL_BITS) | (1 << (HLL_BITS - 1));
        let rank = rest.leading_zeros() as u8 + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    fn finish(&mut self) -> Value {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self.registers.iter().map(|r| 2f64.powi(-(*r as i32))).sum();
        let mut estimate = alpha * m * m / sum;
        let zeros = self.registers.iter().filter(|r| **r == 0).count();
        if estimate <= 2.5 * m && zeros > 0 {
            estimate = m * (m / zeros as f64).ln();
        }
        Value::Number(estimate.round())
    }
}

struct Sum {
    field: String,
    total: f64,
}

impl Accumulator for Sum {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        self.total += numbers(ctx, row, &self.field).iter().sum::<f64>();
    }

    fn finish(&mut self) -> Value {
        Value::Number(self.total)
    }
}

struct Extremum {
    field: String,
    best: Option<f64>,
    max: bool,
}

impl Accumulator for Extremum {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        for n in numbers(ctx, row, &self.field) {
            self.best = Some(match self.best {
                None => n,
                Some(b) if self.max => b.max(n),
                Some(b) => b.min(n),
            });
        }
    }

    fn finish(&mut self) -> Value {
        self.best.map(Value::Number).unwrap_or(Value::Null)
    }
}

struct Avg {
    field: String,
    total: f64,
    count: u64,
}

impl Accumulator for Avg {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        for n in numbers(ctx, row, &self.field) {
            self.total += n;
            self.count += 1;
        }
    }

    fn finish(&mut self) -> Value {
        if self.count == 0 {
            Value::Number(f64::NAN)
        } else {
            Value::Number(self.total / self.count as f64)
        }
    }
}

struct ToList {
    field: String,
    seen: HashSet<String>,
    values: Vec<Value>,
}

impl Accumulator for ToList {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        let items = match ctx.value(row, &self.field) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return,
            Some(v) => vec![v],
        };
        for item in items {
            if self.seen.insert(item.to_string()) {
                self.values.push(item);
            }
        }
    }

    fn finish(&mut self) -> Value {
        Value::Array(std::mem::take(&mut self.values))
    }
}

struct FirstValue {
    field: String,
    by: Option<(String, bool)>,
    best: Option<(Value, Value)>,
}

impl Accumulator for FirstValue {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        let value = ctx.value(row, &self.field).unwrap_or(Value::Null);
        let Some((by, ascending)) = &self.by else {
            if self.best.is_none() {
                self.best = Some((value, Value::Null));
            }
            return;
        };
        let key = ctx.value(row, by).unwrap_or(Value::Null);
        let better = match &self.best {
            None => true,
            Some((_, current)) if current.is_null() => !key.is_null(),
            Some(_) if key.is_null() => false,
            Some((_, current)) => {
                let ord = key.cmp_sort(current);
                if *ascending {
                    ord.is_lt()
                } else {
                    ord.is_gt()
                }
            }
        };
        if better {
            self.best = Some((value, key));
        }
    }

    fn finish(&mut self) -> Value {
        self.best.take().map(|(v, _)| v).unwrap_or(Value::Null)
    }
}

enum SampleOutput {
    StdDev,
    Quantile(f64),
}

struct Samples {
    field: String,
    values: Vec<f64>,
    output: SampleOutput,
}

impl Samples {
    fn new(field: &str, output: SampleOutput) -> Self {
        Self {
            field: field.to_string(),
            values: Vec::new(),
            output,
        }
    }
}

impl Accumulator for Samples {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        self.values.extend(numbers(ctx, row, &self.field));
    }

    fn finish(&mut self) -> Value {
        let n = self.values.len();
        match self.output {
            SampleOutput::StdDev => {
                if n < 2 {
                    return Value::Number(0.0);
                }
                let mean = self.values.iter().sum::<f64>() / n as f64;
                let var = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
                Value::Number(var.sqrt())
            }
            SampleOutput::Quantile(q) => {
                if n == 0 {
                    return Value::Null;
                }
                self.values.sort_by(f64::total_cmp);
                let rank = q * (n - 1) as f64;
                let lo = rank.floor() as usize;
                let hi = rank.ceil() as usize;
                let frac = rank - lo as f64;
                Value::Number(self.values[lo] + (self.values[hi] - self.values[lo]) * frac)
            }
        }
    }
}

/// Reservoir sample of at most `size` values
struct RandomSample {
    field: String,
    size: usize,
    seen: usize,
    sample: Vec<Value>,
}

impl Accumulator for RandomSample {
    fn add(&mut self, ctx: &ExecContext, row: &Row) {
        let Some(v) = ctx.value(row, &self.field).filter(|v| !v.is_null()) else {
            return;
        };
        self.seen += 1;
        if self.sample.len() < self.size {
            self.sample.push(v);
        } else {
            let j = fastrand::usize(..self.seen);
            if j < self.size {
                self.sample[j] = v;
            }
        }
    }

    fn finish(&mut self) -> Value {
        Value::Array(std::mem::take(&mut self.sample))
    }
}
