//! SEARCH and AGGREGATE argument parsing
//!
//! Everything is validated here, before the index is touched, so a bad
//! request never leaves partial state behind.

use std::collections::HashMap;

use bytes::Bytes;

use crate::args::ArgCursor;
use crate::index::geo::{GeoFilter, GeoUnit};
use crate::index::numeric::NumericRange;
use crate::pipeline::reducers::ReducerSpec;
use crate::pipeline::scorer::ScorerKind;
use crate::query::expr::Expr;
use crate::types::{parse_f64, TimeoutPolicy};
use crate::{Error, Result};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_DIALECT: u32 = 4;

/// Options shared by SEARCH and AGGREGATE
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub params: HashMap<String, Bytes>,
    pub timeout_ms: Option<u64>,
    pub dialect: Option<u32>,
    pub on_timeout: Option<TimeoutPolicy>,
    pub verbatim: bool,
    pub no_stopwords: bool,
    pub scorer: Option<ScorerKind>,
    pub language: Option<String>,
    pub slop: Option<u32>,
    pub in_order: bool,
}

impl QueryArgs {
    /// Try to consume one shared option; returns false when `keyword` is not one.
    fn parse_option(&mut self, keyword: &str, args: &mut ArgCursor<'_>) -> Result<bool> {
        match keyword {
            "VERBATIM" => self.verbatim = true,
            "NOSTOPWORDS" => self.no_stopwords = true,
            "INORDER" => self.in_order = true,
            "SLOP" => self.slop = Some(args.next_u64("SLOP")? as u32),
            "LANGUAGE" => {
                let language = args.next_str()?.to_ascii_lowercase();
                crate::analysis::stemmer_for(&language)
                    .ok_or_else(|| Error::bad_argument(format!("No such language {language}")))?;
                self.language = Some(language);
            }
            "SCORER" => self.scorer = Some(ScorerKind::parse(args.next_str()?)?),
            "TIMEOUT" => self.timeout_ms = Some(args.next_u64("TIMEOUT")?),
            "ON_TIMEOUT" => self.on_timeout = Some(TimeoutPolicy::parse(args.next_str()?)?),
            "DIALECT" => {
                let raw = args.next_str()?;
                let dialect = raw
                    .parse::<u32>()
                    .ok()
                    .filter(|d| (1..=MAX_DIALECT).contains(d))
                    .ok_or_else(|| {
                        Error::InvalidDialect(format!("DIALECT requires a value between 1 and {MAX_DIALECT}, got `{raw}`"))
                    })?;
                self.dialect = Some(dialect);
            }
            "PARAMS" => {
                let tokens = args.next_counted("PARAMS")?;
                if tokens.len() % 2 != 0 {
                    return Err(Error::bad_argument("Parameters must be name/value pairs"));
                }
                for pair in tokens.chunks(2) {
                    let name = std::str::from_utf8(pair[0])
                        .map_err(|_| Error::bad_argument("Parameter name is not valid UTF-8"))?;
                    if self.params.insert(name.to_string(), pair[1].clone()).is_some() {
                        return Err(Error::bad_argument(format!("Duplicate parameter `{name}`")));
                    }
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// `RETURN` / `LOAD` entry
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnField {
    /// Attribute name or source path
    pub path: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HighlightOptions {
    pub fields: Option<Vec<String>>,
    pub open: String,
    pub close: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeOptions {
    pub fields: Option<Vec<String>>,
    pub frags: usize,
    pub len: usize,
    pub separator: String,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub args: QueryArgs,
    pub no_content: bool,
    pub with_scores: bool,
    pub with_payloads: bool,
    pub with_sort_keys: bool,
    pub numeric_filters: Vec<(String, NumericRange)>,
    pub geo_filters: Vec<(String, GeoFilter)>,
    pub in_keys: Option<Vec<String>>,
    pub in_fields: Option<Vec<String>>,
    pub return_fields: Option<Vec<ReturnField>>,
    pub summarize: Option<SummarizeOptions>,
    pub highlight: Option<HighlightOptions>,
    pub sort_by: Option<SortKey>,
    pub offset: usize,
    pub limit: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            args: QueryArgs::default(),
            no_content: false,
            with_scores: false,
            with_payloads: false,
            with_sort_keys: false,
            numeric_filters: Vec::new(),
            geo_filters: Vec::new(),
            in_keys: None,
            in_fields: None,
            return_fields: None,
            summarize: None,
            highlight: None,
            sort_by: None,
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }

    /// Parse the arguments following the query string.
    pub fn parse(query: &str, args: &mut ArgCursor<'_>) -> Result<Self> {
        let mut req = SearchRequest::new(query);
        while !args.is_empty() {
            let keyword = args.next_str()?.to_ascii_uppercase();
            if req.args.parse_option(&keyword, args)? {
                continue;
            }
            match keyword.as_str() {
                "NOCONTENT" => req.no_content = true,
                "WITHSCORES" => req.with_scores = true,
                "WITHPAYLOADS" => req.with_payloads = true,
                "WITHSORTKEYS" => req.with_sort_keys = true,
                "FILTER" => {
                    let field = args.next_string()?;
                    let min = parse_bound(args.next_str()?)?;
                    let max = parse_bound(args.next_str()?)?;
                    req.numeric_filters.push((
                        field,
                        NumericRange {
                            min: min.0,
                            min_inclusive: min.1,
                            max: max.0,
                            max_inclusive: max.1,
                        },
                    ));
                }
                "GEOFILTER" => {
                    let field = args.next_string()?;
                    let lon = args.next_f64("GEOFILTER")?;
                    let lat = args.next_f64("GEOFILTER")?;
                    let radius = args.next_f64("GEOFILTER")?;
                    let unit = GeoUnit::parse(args.next_str()?)?;
                    crate::index::geo::validate(lon, lat)?;
                    if radius < 0.0 {
                        return Err(Error::bad_argument("GEOFILTER radius must be non-negative"));
                    }
                    req.geo_filters.push((field, GeoFilter { lon, lat, radius, unit }));
                }
                "INKEYS" => req.in_keys = Some(args.next_counted_strings("INKEYS")?),
                "INFIELDS" => req.in_fields = Some(args.next_counted_strings("INFIELDS")?),
                "RETURN" => {
                    let tokens = args.next_counted_strings("RETURN")?;
                    req.return_fields = Some(parse_return_list(&tokens)?);
                }
                "SUMMARIZE" => req.summarize = Some(parse_summarize(args)?),
                "HIGHLIGHT" => req.highlight = Some(parse_highlight(args)?),
                "SORTBY" => {
                    let field = strip_at(args.next_str()?).to_string();
                    let ascending = if args.eat("DESC") {
                        false
                    } else {
                        args.eat("ASC");
                        true
                    };
                    req.sort_by = Some(SortKey { field, ascending });
                }
                "LIMIT" => {
                    let (offset, limit) = parse_limit(args)?;
                    req.offset = offset;
                    req.limit = limit;
                }
                other => return Err(Error::bad_argument(format!("Unknown argument `{other}`"))),
            }
        }
        Ok(req)
    }
}

/// Ordered stages of an aggregation
#[derive(Debug, Clone)]
pub enum AggregateStep {
    GroupBy {
        keys: Vec<String>,
        reducers: Vec<ReducerSpec>,
    },
    SortBy {
        keys: Vec<SortKey>,
        max: Option<usize>,
    },
    Apply {
        expr: Expr,
        alias: String,
    },
    Filter(Expr),
    Limit {
        offset: usize,
        count: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadSpec {
    Fields(Vec<ReturnField>),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CursorOptions {
    pub count: Option<usize>,
    pub max_idle_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub query: String,
    pub args: QueryArgs,
    pub load: Option<LoadSpec>,
    pub steps: Vec<AggregateStep>,
    pub cursor: Option<CursorOptions>,
    pub add_scores: bool,
}

impl AggregateRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            args: QueryArgs::default(),
            load: None,
            steps: Vec::new(),
            cursor: None,
            add_scores: false,
        }
    }

    pub fn parse(query: &str, args: &mut ArgCursor<'_>) -> Result<Self> {
        let mut req = AggregateRequest::new(query);
        while !args.is_empty() {
            let keyword = args.next_str()?.to_ascii_uppercase();
            if req.args.parse_option(&keyword, args)? {
                continue;
            }
            match keyword.as_str() {
                "LOAD" => {
                    if args.eat("*") {
                        req.load = Some(LoadSpec::All);
                    } else {
                        let tokens = args.next_counted_strings("LOAD")?;
                        let fields = parse_return_list(&tokens)?;
                        match &mut req.load {
                            Some(LoadSpec::Fields(existing)) => existing.extend(fields),
                            Some(LoadSpec::All) => {}
                            None => req.load = Some(LoadSpec::Fields(fields)),
                        }
                    }
                }
                "GROUPBY" => {
                    let keys = args
                        .next_counted_strings("GROUPBY")?
                        .iter()
                        .map(|k| property(k))
                        .collect::<Result<Vec<_>>>()?;
                    let mut reducers = Vec::new();
                    while args.eat("REDUCE") {
                        let name = args.next_string()?;
                        let reducer_args = args.next_counted_strings("REDUCE")?;
                        let alias = if args.eat("AS") {
                            Some(args.next_string()?)
                        } else {
                            None
                        };
                        reducers.push(ReducerSpec::parse(&name, &reducer_args, alias)?);
                    }
                    req.steps.push(AggregateStep::GroupBy { keys, reducers });
                }
                "SORTBY" => {
                    let tokens = args.next_counted_strings("SORTBY")?;
                    let mut keys: Vec<SortKey> = Vec::new();
                    for token in tokens {
                        match token.to_ascii_uppercase().as_str() {
                            "ASC" | "DESC" => {
                                let key = keys.last_mut().ok_or_else(|| {
                                    Error::bad_argument("SORTBY direction without a property")
                                })?;
                                key.ascending = token.eq_ignore_ascii_case("ASC");
                            }
                            _ => keys.push(SortKey {
                                field: property(&token)?,
                                ascending: true,
                            }),
                        }
                    }
                    let max = if args.eat("MAX") {
                        Some(args.next_usize("MAX")?)
                    } else {
                        None
                    };
                    req.steps.push(AggregateStep::SortBy { keys, max });
                }
                "APPLY" => {
                    let expr = Expr::parse(args.next_str()?)?;
                    args.expect("AS")?;
                    let alias = args.next_string()?;
                    req.steps.push(AggregateStep::Apply { expr, alias });
                }
                "FILTER" => req.steps.push(AggregateStep::Filter(Expr::parse(args.next_str()?)?)),
                "LIMIT" => {
                    let (offset, count) = parse_limit(args)?;
                    req.steps.push(AggregateStep::Limit { offset, count });
                }
                "WITHCURSOR" => {
                    let mut options = CursorOptions::default();
                    loop {
                        if args.eat("COUNT") {
                            options.count = Some(args.next_usize("COUNT")?.max(1));
                        } else if args.eat("MAXIDLE") {
                            options.max_idle_ms = Some(args.next_u64("MAXIDLE")?);
                        } else {
                            break;
                        }
                    }
                    req.cursor = Some(options);
                }
                "ADDSCORES" => req.add_scores = true,
                other => return Err(Error::bad_argument(format!("Unknown argument `{other}`"))),
            }
        }
        Ok(req)
    }
}

fn strip_at(s: &str) -> &str {
    s.strip_prefix('@').unwrap_or(s)
}

/// Aggregation properties must be written `@name`.
fn property(s: &str) -> Result<String> {
    s.strip_prefix('@')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::bad_argument(format!("Bad property `{s}`: properties must start with @")))
}

/// `(` prefix marks an exclusive bound.
fn parse_bound(raw: &str) -> Result<(f64, bool)> {
    let (text, inclusive) = match raw.strip_prefix('(') {
        Some(rest) => (rest, false),
        None => (raw, true),
    };
    let value = parse_f64(text)
        .ok_or_else(|| Error::bad_argument(format!("Bad lower range: {raw}")))?;
    Ok((value, inclusive))
}

fn parse_limit(args: &mut ArgCursor<'_>) -> Result<(usize, usize)> {
    let offset = args.next_i64("LIMIT")?;
    let count = args.next_i64("LIMIT")?;
    if offset < 0 || count < 0 {
        return Err(Error::bad_argument("LIMIT offset and count must be non-negative"));
    }
    Ok((offset as usize, count as usize))
}

fn parse_return_list(tokens: &[String]) -> Result<Vec<ReturnField>> {
    let mut fields = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let path = strip_at(&tokens[i]).to_string();
        i += 1;
        let alias = if tokens.get(i).is_some_and(|t| t.eq_ignore_ascii_case("AS")) {
            let alias = tokens
                .get(i + 1)
                .ok_or_else(|| Error::bad_argument("AS requires an alias"))?;
            i += 2;
            alias.clone()
        } else {
            path.clone()
        };
        fields.push(ReturnField { path, alias });
    }
    Ok(fields)
}

fn parse_summarize(args: &mut ArgCursor<'_>) -> Result<SummarizeOptions> {
    let mut options = SummarizeOptions {
        fields: None,
        frags: 3,
        len: 20,
        separator: "... ".to_string(),
    };
    loop {
        if args.eat("FIELDS") {
            options.fields = Some(args.next_counted_strings("SUMMARIZE FIELDS")?);
        } else if args.eat("FRAGS") {
            options.frags = args.next_usize("FRAGS")?.max(1);
        } else if args.eat("LEN") {
            options.len = args.next_usize("LEN")?.max(1);
        } else if args.eat("SEPARATOR") {
            options.separator = args.next_string()?;
        } else {
            return Ok(options);
        }
    }
}

fn parse_highlight(args: &mut ArgCursor<'_>) -> Result<HighlightOptions> {
    let mut options = HighlightOptions {
        fields: None,
        open: "<b>".to_string(),
        close: "</b>".to_string(),
    };
    loop {
        if args.eat("FIELDS") {
            options.fields = Some(args.next_counted_strings("HIGHLIGHT FIELDS")?);
        } else if args.eat("TAGS") {
            options.open = args.next_string()?;
            options.close = args.next_string()?;
        } else {
            return Ok(options);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::to_args;

    fn search(tokens: &[&str]) -> Result<SearchRequest> {
        let args = to_args(tokens);
        SearchRequest::parse("hello", &mut ArgCursor::new(&args))
    }

    fn aggregate(tokens: &[&str]) -> Result<AggregateRequest> {
        let args = to_args(tokens);
        AggregateRequest::parse("*", &mut ArgCursor::new(&args))
    }

    #[test]
    fn test_search_options() {
        let req = search(&[
            "WITHSCORES", "SORTBY", "bar", "DESC", "LIMIT", "5", "20", "RETURN", "3", "title", "AS",
            "t", "FILTER", "price", "(10", "+inf", "DIALECT", "2",
        ])
        .unwrap();
        assert!(req.with_scores);
        assert_eq!(req.sort_by, Some(SortKey { field: "bar".into(), ascending: false }));
        assert_eq!((req.offset, req.limit), (5, 20));
        assert_eq!(
            req.return_fields.unwrap(),
            vec![ReturnField { path: "title".into(), alias: "t".into() }]
        );
        let (field, range) = &req.numeric_filters[0];
        assert_eq!(field, "price");
        assert!(!range.min_inclusive);
        assert_eq!(range.max, f64::INFINITY);
        assert_eq!(req.args.dialect, Some(2));
    }

    #[test]
    fn test_negative_limit_is_bad_argument() {
        let err = search(&["LIMIT", "0", "-1"]).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[test]
    fn test_invalid_dialect() {
        assert!(matches!(search(&["DIALECT", "9"]), Err(Error::InvalidDialect(_))));
    }

    #[test]
    fn test_params_must_pair() {
        assert!(search(&["PARAMS", "3", "a", "1", "b"]).is_err());
        let req = search(&["PARAMS", "2", "q", "xyz"]).unwrap();
        assert_eq!(req.args.params["q"], Bytes::from_static(b"xyz"));
    }

    #[test]
    fn test_aggregate_pipeline_steps() {
        let req = aggregate(&[
            "LOAD", "1", "@price", "GROUPBY", "1", "@brand", "REDUCE", "COUNT", "0", "AS", "n",
            "REDUCE", "AVG", "1", "@price", "SORTBY", "2", "@n", "DESC", "MAX", "5", "APPLY",
            "@n * 2", "AS", "double", "FILTER", "@n > 1", "LIMIT", "0", "3", "WITHCURSOR", "COUNT",
            "2", "MAXIDLE", "1000",
        ])
        .unwrap();
        assert_eq!(
            req.load,
            Some(LoadSpec::Fields(vec![ReturnField { path: "price".into(), alias: "price".into() }]))
        );
        assert_eq!(req.steps.len(), 5);
        let AggregateStep::GroupBy { keys, reducers } = &req.steps[0] else {
            panic!("expected GROUPBY");
        };
        assert_eq!(keys, &vec!["brand".to_string()]);
        assert_eq!(reducers[0].alias, "n");
        assert_eq!(reducers[1].alias, "__generated_aliasavgprice");
        let AggregateStep::SortBy { keys, max } = &req.steps[1] else {
            panic!("expected SORTBY");
        };
        assert!(!keys[0].ascending);
        assert_eq!(*max, Some(5));
        assert_eq!(
            req.cursor,
            Some(CursorOptions { count: Some(2), max_idle_ms: Some(1000) })
        );
    }

    #[test]
    fn test_aggregate_property_requires_at() {
        assert!(aggregate(&["GROUPBY", "1", "brand"]).is_err());
        assert!(aggregate(&["APPLY", "1 +", "AS", "x"]).is_err());
    }
}
