//! Row expressions used by APPLY, FILTER and conditional updates

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::index::geo;
use crate::types::{parse_f64, Value};
use crate::{Error, Result};

#[derive(Parser)]
#[grammar = "query/expr.pest"]
struct ExprGrammar;

const DEFAULT_TIME_FORMAT: &str = "%FT%TZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            "^" => BinaryOp::Pow,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "&&" => BinaryOp::And,
            "||" => BinaryOp::Or,
            _ => return None,
        })
    }
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Exists,
    Upper,
    Lower,
    Substr,
    Strlen,
    StartsWith,
    Contains,
    Format,
    ToNumber,
    ToStr,
    Abs,
    Ceil,
    Floor,
    Sqrt,
    Log,
    Log2,
    Exp,
    TimeFmt,
    ParseTime,
    Day,
    Hour,
    Minute,
    Month,
    Year,
    DayOfWeek,
    DayOfMonth,
    DayOfYear,
    GeoDistance,
}

impl Function {
    fn parse(name: &str) -> Result<Self> {
        use Function::*;
        Ok(match name.to_ascii_lowercase().as_str() {
            "exists" => Exists,
            "upper" => Upper,
            "lower" => Lower,
            "substr" => Substr,
            "strlen" => Strlen,
            "startswith" => StartsWith,
            "contains" => Contains,
            "format" => Format,
            "to_number" => ToNumber,
            "to_str" => ToStr,
            "abs" => Abs,
            "ceil" => Ceil,
            "floor" => Floor,
            "sqrt" => Sqrt,
            "log" => Log,
            "log2" => Log2,
            "exp" => Exp,
            "timefmt" => TimeFmt,
            "parsetime" => ParseTime,
            "day" => Day,
            "hour" => Hour,
            "minute" => Minute,
            "month" => Month,
            "year" => Year,
            "dayofweek" => DayOfWeek,
            "dayofmonth" => DayOfMonth,
            "dayofyear" => DayOfYear,
            "geodistance" => GeoDistance,
            other => return Err(Error::syntax(format!("Unknown function name `{other}`"))),
        })
    }

    /// Accepted argument counts (inclusive).
    fn arity(&self) -> (usize, usize) {
        use Function::*;
        match self {
            Substr => (3, 3),
            StartsWith | Contains | ParseTime => (2, 2),
            TimeFmt => (1, 2),
            Format => (1, usize::MAX),
            GeoDistance => (2, 4),
            _ => (1, 1),
        }
    }

    pub fn name(&self) -> &'static str {
        use Function::*;
        match self {
            Exists => "exists",
            Upper => "upper",
            Lower => "lower",
            Substr => "substr",
            Strlen => "strlen",
            StartsWith => "startswith",
            Contains => "contains",
            Format => "format",
            ToNumber => "to_number",
            ToStr => "to_str",
            Abs => "abs",
            Ceil => "ceil",
            Floor => "floor",
            Sqrt => "sqrt",
            Log => "log",
            Log2 => "log2",
            Exp => "exp",
            TimeFmt => "timefmt",
            ParseTime => "parsetime",
            Day => "day",
            Hour => "hour",
            Minute => "minute",
            Month => "month",
            Year => "year",
            DayOfWeek => "dayofweek",
            DayOfMonth => "dayofmonth",
            DayOfYear => "dayofyear",
            GeoDistance => "geodistance",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

/// Source of `@field` values during evaluation
pub trait Bindings {
    fn value(&self, name: &str) -> Option<Value>;
}

impl<F: Fn(&str) -> Option<Value>> Bindings for F {
    fn value(&self, name: &str) -> Option<Value> {
        self(name)
    }
}

impl Expr {
    pub fn parse(text: &str) -> Result<Expr> {
        let mut pairs =
            ExprGrammar::parse(Rule::expr, text).map_err(|e| Error::syntax(e.to_string()))?;
        let root = pairs
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| Error::syntax("Empty expression"))?;
        build(root)
    }

    /// Field names the expression reads.
    pub fn fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Field(name) => out.push(name.clone()),
            Expr::Unary(_, inner) => inner.fields(out),
            Expr::Binary(_, a, b) => {
                a.fields(out);
                b.fields(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.fields(out)),
            Expr::Literal(_) => {}
        }
    }

    pub fn eval(&self, env: &dyn Bindings) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(name) => Ok(env.value(name).unwrap_or(Value::Null)),
            Expr::Unary(op, inner) => {
                let v = inner.eval(env)?;
                Ok(match op {
                    UnaryOp::Not => bool_value(!v.truthy()),
                    UnaryOp::Neg => match v {
                        Value::Null => Value::Null,
                        other => Value::Number(-number(&other)?),
                    },
                })
            }
            Expr::Binary(BinaryOp::And, a, b) => {
                Ok(bool_value(a.eval(env)?.truthy() && b.eval(env)?.truthy()))
            }
            Expr::Binary(BinaryOp::Or, a, b) => {
                Ok(bool_value(a.eval(env)?.truthy() || b.eval(env)?.truthy()))
            }
            Expr::Binary(op, a, b) => binary(*op, a.eval(env)?, b.eval(env)?),
            Expr::Call(Function::Exists, args) => {
                let exists = match &args[0] {
                    Expr::Field(name) => env.value(name).is_some_and(|v| !v.is_null()),
                    other => !other.eval(env)?.is_null(),
                };
                Ok(bool_value(exists))
            }
            Expr::Call(func, args) => {
                let values = args.iter().map(|a| a.eval(env)).collect::<Result<Vec<_>>>()?;
                call(*func, values)
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::String(s)) => write!(f, "\"{s}\""),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Field(name) => write!(f, "@{name}"),
            Expr::Unary(UnaryOp::Not, e) => write!(f, "!{e}"),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-{e}"),
            Expr::Binary(op, a, b) => write!(f, "({a} {op:?} {b})"),
            Expr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn build(pair: Pair<'_, Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::or_expr | Rule::and_expr | Rule::sum_expr | Rule::product | Rule::cmp_expr => {
            let fixed = match pair.as_rule() {
                Rule::or_expr => Some(BinaryOp::Or),
                Rule::and_expr => Some(BinaryOp::And),
                _ => None,
            };
            let mut inner = pair.into_inner();
            let first = inner.next().ok_or_else(|| Error::syntax("Empty expression"))?;
            let mut acc = build(first)?;
            while let Some(next) = inner.next() {
                let (op, rhs) = match fixed {
                    Some(op) => (op, next),
                    None => {
                        let op = BinaryOp::parse(next.as_str())
                            .ok_or_else(|| Error::syntax(format!("Unknown operator `{}`", next.as_str())))?;
                        let rhs = inner.next().ok_or_else(|| Error::syntax("Missing operand"))?;
                        (op, rhs)
                    }
                };
                acc = Expr::Binary(op, Box::new(acc), Box::new(build(rhs)?));
            }
            Ok(acc)
        }
        Rule::power => {
            // Right associative
            let operands = pair.into_inner().map(build).collect::<Result<Vec<_>>>()?;
            let mut iter = operands.into_iter().rev();
            let mut acc = iter.next().ok_or_else(|| Error::syntax("Empty expression"))?;
            for base in iter {
                acc = Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(acc));
            }
            Ok(acc)
        }
        Rule::unary => {
            let mut ops = Vec::new();
            let mut operand = None;
            for inner in pair.into_inner() {
                match inner.as_rule() {
                    Rule::unary_op => ops.push(if inner.as_str() == "!" {
                        UnaryOp::Not
                    } else {
                        UnaryOp::Neg
                    }),
                    _ => operand = Some(build(inner)?),
                }
            }
            let mut expr = operand.ok_or_else(|| Error::syntax("Missing operand"))?;
            for op in ops.into_iter().rev() {
                expr = match (op, expr) {
                    (UnaryOp::Neg, Expr::Literal(Value::Number(n))) => Expr::Literal(Value::Number(-n)),
                    (op, e) => Expr::Unary(op, Box::new(e)),
                };
            }
            Ok(expr)
        }
        Rule::call => {
            let mut inner = pair.into_inner();
            let name = inner.next().ok_or_else(|| Error::syntax("Missing function name"))?;
            let func = Function::parse(name.as_str())?;
            let args = inner.map(build).collect::<Result<Vec<_>>>()?;
            let (min, max) = func.arity();
            if args.len() < min || args.len() > max {
                return Err(Error::syntax(format!(
                    "Wrong number of arguments for function `{}`",
                    func.name()
                )));
            }
            Ok(Expr::Call(func, args))
        }
        Rule::field => {
            let name = pair
                .into_inner()
                .next()
                .ok_or_else(|| Error::syntax("Missing field name"))?;
            Ok(Expr::Field(name.as_str().to_string()))
        }
        Rule::number => parse_f64(pair.as_str())
            .map(|n| Expr::Literal(Value::Number(n)))
            .ok_or_else(|| Error::syntax(format!("Bad number `{}`", pair.as_str()))),
        Rule::string => {
            let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or_default();
            Ok(Expr::Literal(Value::String(unescape(raw))))
        }
        Rule::null_lit => Ok(Expr::Literal(Value::Null)),
        other => Err(Error::syntax(format!("Unexpected {other:?} in expression"))),
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn bool_value(b: bool) -> Value {
    Value::Number(if b { 1.0 } else { 0.0 })
}

fn number(v: &Value) -> Result<f64> {
    v.as_number()
        .ok_or_else(|| Error::bad_argument(format!("Could not convert `{v}` to a number")))
}

fn string(v: &Value) -> String {
    v.to_string()
}

fn binary(op: BinaryOp, a: Value, b: Value) -> Result<Value> {
    use std::cmp::Ordering;
    match op {
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = match (&a, &b) {
                (Value::Null, Value::Null) => Some(Ordering::Equal),
                (Value::Null, _) | (_, Value::Null) => None,
                _ => match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => Some(string(&a).cmp(&string(&b))),
                },
            };
            let result = match (op, ord) {
                (BinaryOp::Ne, None) => true,
                (_, None) => false,
                (BinaryOp::Eq, Some(o)) => o == Ordering::Equal,
                (BinaryOp::Ne, Some(o)) => o != Ordering::Equal,
                (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
                (BinaryOp::Le, Some(o)) => o != Ordering::Greater,
                (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            };
            Ok(bool_value(result))
        }
        _ => {
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let (x, y) = (number(&a)?, number(&b)?);
            let n = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Mod => {
                    let d = y as i64;
                    if d == 0 {
                        f64::NAN
                    } else {
                        ((x as i64) % d) as f64
                    }
                }
                _ => x.powf(y),
            };
            Ok(Value::Number(n))
        }
    }
}

fn timestamp(v: &Value) -> Result<DateTime<Utc>> {
    let secs = number(v)?;
    Utc.timestamp_opt(secs.floor() as i64, 0)
        .single()
        .ok_or_else(|| Error::bad_argument(format!("Invalid timestamp `{v}`")))
}

fn epoch(dt: NaiveDateTime) -> Value {
    Value::Number(dt.and_utc().timestamp() as f64)
}

/// `lon,lat` string or a bare number pair from the argument list.
fn geo_points(args: &[Value]) -> Result<((f64, f64), (f64, f64))> {
    let point = |v: &Value| geo::parse_point(&string(v));
    match args {
        [a, b] => Ok((point(a)?, point(b)?)),
        [a, lon, lat] if a.as_number().is_none() => Ok((point(a)?, (number(lon)?, number(lat)?))),
        [lon, lat, b] => Ok(((number(lon)?, number(lat)?), point(b)?)),
        [lon1, lat1, lon2, lat2] => Ok((
            (number(lon1)?, number(lat1)?),
            (number(lon2)?, number(lat2)?),
        )),
        _ => Err(Error::bad_argument("geodistance expects two points")),
    }
}

fn call(func: Function, args: Vec<Value>) -> Result<Value> {
    use Function::*;
    if args.first().is_some_and(|v| v.is_null()) && !matches!(func, Format | ToStr) {
        return Ok(Value::Null);
    }
    let num = |i: usize| number(&args[i]);
    let text = |i: usize| string(&args[i]);
    let value = match func {
        Exists => bool_value(!args[0].is_null()),
        Upper => Value::String(text(0).to_uppercase()),
        Lower => Value::String(text(0).to_lowercase()),
        Substr => {
            let chars: Vec<char> = text(0).chars().collect();
            let len = chars.len() as i64;
            let mut offset = num(1)? as i64;
            if offset < 0 {
                offset += len;
            }
            let offset = offset.clamp(0, len);
            let mut count = num(2)? as i64;
            if count < 0 {
                count = len - offset + count + 1;
            }
            let end = (offset + count.max(0)).min(len);
            Value::String(chars[offset as usize..end as usize].iter().collect())
        }
        Strlen => Value::Number(text(0).chars().count() as f64),
        StartsWith => bool_value(text(0).starts_with(&text(1))),
        Contains => {
            let (hay, needle) = (text(0), text(1));
            let count = if needle.is_empty() {
                hay.chars().count() + 1
            } else {
                hay.matches(&needle).count()
            };
            Value::Number(count as f64)
        }
        Format => {
            let fmt = text(0);
            let mut out = String::new();
            let mut rest = args[1..].iter();
            let mut chars = fmt.chars();
            while let Some(c) = chars.next() {
                if c != '%' {
                    out.push(c);
                    continue;
                }
                match chars.next() {
                    Some('%') => out.push('%'),
                    Some('s') => {
                        let arg = rest
                            .next()
                            .ok_or_else(|| Error::bad_argument("Not enough arguments for format"))?;
                        match arg {
                            Value::Null => out.push_str("(null)"),
                            other => out.push_str(&other.to_string()),
                        }
                    }
                    other => {
                        return Err(Error::bad_argument(format!(
                            "Invalid format specifier `%{}`",
                            other.map(String::from).unwrap_or_default()
                        )))
                    }
                }
            }
            Value::String(out)
        }
        ToNumber => Value::Number(num(0)?),
        ToStr => match &args[0] {
            Value::Null => Value::String(String::new()),
            other => Value::String(other.to_string()),
        },
        Abs => Value::Number(num(0)?.abs()),
        Ceil => Value::Number(num(0)?.ceil()),
        Floor => Value::Number(num(0)?.floor()),
        Sqrt => Value::Number(num(0)?.sqrt()),
        Log => Value::Number(num(0)?.ln()),
        Log2 => Value::Number(num(0)?.log2()),
        Exp => Value::Number(num(0)?.exp()),
        TimeFmt => {
            let fmt = args.get(1).map(string).unwrap_or_else(|| DEFAULT_TIME_FORMAT.to_string());
            Value::String(timestamp(&args[0])?.format(&fmt).to_string())
        }
        ParseTime => {
            let (raw, fmt) = (text(0), text(1));
            let parsed = NaiveDateTime::parse_from_str(&raw, &fmt).or_else(|_| {
                NaiveDate::parse_from_str(&raw, &fmt).map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
            });
            match parsed {
                Ok(dt) => epoch(dt),
                Err(_) => Value::Null,
            }
        }
        Day | Hour | Minute | Month => {
            let dt = timestamp(&args[0])?.naive_utc();
            let date = dt.date();
            let rounded = match func {
                Day => date.and_hms_opt(0, 0, 0),
                Hour => date.and_hms_opt(dt.hour(), 0, 0),
                Minute => date.and_hms_opt(dt.hour(), dt.minute(), 0),
                _ => date.with_day(1).and_then(|d| d.and_hms_opt(0, 0, 0)),
            };
            rounded.map(epoch).unwrap_or(Value::Null)
        }
        Year => Value::Number(timestamp(&args[0])?.year() as f64),
        DayOfWeek => Value::Number(timestamp(&args[0])?.weekday().num_days_from_sunday() as f64),
        DayOfMonth => Value::Number(timestamp(&args[0])?.day() as f64),
        DayOfYear => Value::Number(timestamp(&args[0])?.ordinal0() as f64),
        GeoDistance => {
            let ((lon1, lat1), (lon2, lat2)) = geo_points(&args)?;
            Value::Number(geo::haversine(lon1, lat1, lon2, lat2))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn eval_with(text: &str, fields: &[(&str, Value)]) -> Value {
        let map: HashMap<String, Value> = fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let lookup = move |name: &str| map.get(name).cloned();
        Expr::parse(text).unwrap().eval(&lookup).unwrap()
    }

    fn eval(text: &str) -> Value {
        eval_with(text, &[])
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3"), Value::Number(7.0));
        assert_eq!(eval("(1 + 2) * 3"), Value::Number(9.0));
        assert_eq!(eval("2 ^ 3 ^ 2"), Value::Number(512.0));
        assert_eq!(eval("7 % 3"), Value::Number(1.0));
        assert_eq!(eval("-2 + 5"), Value::Number(3.0));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let fields = [("price", Value::Number(10.0)), ("name", Value::str("bob"))];
        assert_eq!(eval_with("@price > 5 && @name == 'bob'", &fields), Value::Number(1.0));
        assert_eq!(eval_with("@price < 5 || !exists(@missing)", &fields), Value::Number(1.0));
        assert_eq!(eval_with("@missing == 1", &fields), Value::Number(0.0));
        assert_eq!(eval_with("@missing != 1", &fields), Value::Number(1.0));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval("upper('abc')"), Value::str("ABC"));
        assert_eq!(eval("substr('hello', 1, 3)"), Value::str("ell"));
        assert_eq!(eval("substr('hello', -3, -1)"), Value::str("llo"));
        assert_eq!(eval("strlen(\"héllo\")"), Value::Number(5.0));
        assert_eq!(eval("contains('banana', 'an')"), Value::Number(2.0));
        assert_eq!(eval("startswith('banana', 'ban')"), Value::Number(1.0));
        assert_eq!(eval("format('%s-%s%%', 'a', 3)"), Value::str("a-3%"));
        assert_eq!(eval("to_number('4.5') + 1"), Value::Number(5.5));
    }

    #[test]
    fn test_time_functions() {
        // 2021-03-04T05:06:07Z
        let ts = "1614834367";
        assert_eq!(eval(&format!("timefmt({ts})")), Value::str("2021-03-04T05:06:07Z"));
        assert_eq!(eval(&format!("year({ts})")), Value::Number(2021.0));
        assert_eq!(eval(&format!("dayofmonth({ts})")), Value::Number(4.0));
        assert_eq!(eval(&format!("dayofweek({ts})")), Value::Number(4.0));
        assert_eq!(eval(&format!("day({ts})")), Value::Number(1614816000.0));
        assert_eq!(eval(&format!("hour({ts})")), Value::Number(1614834000.0));
        assert_eq!(
            eval("parsetime('2021-03-04', '%Y-%m-%d')"),
            Value::Number(1614816000.0)
        );
    }

    #[test]
    fn test_geodistance() {
        let d = eval("geodistance('-122.41,37.77', '-122.41,37.78')");
        let meters = d.as_number().unwrap();
        assert!((meters - 1112.3).abs() < 1.0, "got {meters}");
    }

    #[test]
    fn test_null_propagation_and_errors() {
        assert_eq!(eval_with("@missing + 1", &[]), Value::Null);
        let err = Expr::parse("'abc' * 2").unwrap().eval(&|_: &str| None::<Value>).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
        assert!(Expr::parse("nosuch(1)").is_err());
        assert!(Expr::parse("upper()").is_err());
        assert!(Expr::parse("1 +").is_err());
    }

    #[test]
    fn test_referenced_fields() {
        let mut fields = Vec::new();
        Expr::parse("@a + upper(@b) > 1").unwrap().fields(&mut fields);
        assert_eq!(fields, vec!["a".to_string(), "b".to_string()]);
    }
}
