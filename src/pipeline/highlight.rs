//! HIGHLIGHT and SUMMARIZE
//!
//! Matched terms are taken from the row's record, so only terms that
//! actually matched the document are marked. Stem matches count as well.

use std::collections::HashSet;

use crate::analysis::{self, StopWords, Token, STEM_PREFIX};
use crate::pipeline::{BoxedProcessor, ExecContext, ResultProcessor, Row};
use crate::query::request::{HighlightOptions, SummarizeOptions};
use crate::types::Value;
use crate::Result;

pub struct Highlighter {
    upstream: BoxedProcessor,
    highlight: Option<HighlightOptions>,
    summarize: Option<SummarizeOptions>,
    stopwords: StopWords,
}

impl Highlighter {
    pub fn new(
        upstream: BoxedProcessor,
        highlight: Option<HighlightOptions>,
        summarize: Option<SummarizeOptions>,
    ) -> Self {
        Self {
            upstream,
            highlight,
            summarize,
            stopwords: StopWords::none(),
        }
    }

    fn target_fields(&self, ctx: &ExecContext) -> Vec<String> {
        let explicit = self
            .highlight
            .as_ref()
            .and_then(|h| h.fields.clone())
            .into_iter()
            .chain(self.summarize.as_ref().and_then(|s| s.fields.clone()))
            .flatten();
        let mut fields: Vec<String> = explicit.collect();
        let any_default = self.highlight.as_ref().is_some_and(|h| h.fields.is_none())
            || self.summarize.as_ref().is_some_and(|s| s.fields.is_none());
        if any_default {
            fields.extend(ctx.def.schema.text_fields().map(|f| f.name.clone()));
        }
        let mut seen = HashSet::new();
        fields.retain(|f| seen.insert(f.clone()));
        fields
    }

    fn applies(&self, field: &str, explicit: Option<&Vec<String>>) -> bool {
        explicit.map_or(true, |fields| fields.iter().any(|f| f == field))
    }

    fn process(&self, ctx: &ExecContext, row: &mut Row) {
        let Some(record) = &row.record else {
            return;
        };
        let mut hits = Vec::new();
        record.term_hits(&mut hits);
        let terms: HashSet<String> = hits
            .iter()
            .map(|h| h.term.trim_start_matches(STEM_PREFIX).to_string())
            .collect();
        if terms.is_empty() {
            return;
        }
        let language = ctx.def.options.language.clone();
        for field in self.target_fields(ctx) {
            let Some(Value::String(text)) = row.get(&field).cloned() else {
                continue;
            };
            let tokens = analysis::tokenize(&text, &self.stopwords, Some(&language), 0);
            let matched: Vec<bool> = tokens
                .iter()
                .map(|t| {
                    terms.contains(&t.term)
                        || t.stem.as_ref().is_some_and(|s| terms.contains(s))
                })
                .collect();
            let tags = self
                .highlight
                .as_ref()
                .filter(|h| self.applies(&field, h.fields.as_ref()))
                .map(|h| (h.open.as_str(), h.close.as_str()));
            let summary = self
                .summarize
                .as_ref()
                .filter(|s| self.applies(&field, s.fields.as_ref()));
            let rendered = match summary {
                Some(opts) => summarize(&text, &tokens, &matched, opts, tags),
                None => match tags {
                    Some(tags) => mark(&text, &tokens, &matched, 0, tokens.len(), tags),
                    None => continue,
                },
            };
            row.set(&field, Value::String(rendered));
        }
    }
}

/// Render `text` covering tokens `from..to`, wrapping matches in `tags`.
fn mark(text: &str, tokens: &[Token], matched: &[bool], from: usize, to: usize, tags: (&str, &str)) -> String {
    if from >= to {
        return String::new();
    }
    let (start, end) = if from == 0 && to == tokens.len() {
        (0, text.len())
    } else {
        (tokens[from].start, tokens[to - 1].end)
    };
    let mut out = String::with_capacity(end - start + 16);
    let mut cursor = start;
    for i in from..to {
        if !matched[i] {
            continue;
        }
        out.push_str(&text[cursor..tokens[i].start]);
        out.push_str(tags.0);
        out.push_str(&text[tokens[i].start..tokens[i].end]);
        out.push_str(tags.1);
        cursor = tokens[i].end;
    }
    out.push_str(&text[cursor..end]);
    out
}

fn summarize(
    text: &str,
    tokens: &[Token],
    matched: &[bool],
    opts: &SummarizeOptions,
    tags: Option<(&str, &str)>,
) -> String {
    let half = opts.len / 2;
    let mut windows: Vec<(usize, usize)> = Vec::new();
    for (i, _) in matched.iter().enumerate().filter(|(_, m)| **m) {
        let from = i.saturating_sub(half);
        let to = (from + opts.len).min(tokens.len());
        match windows.last_mut() {
            Some(last) if from <= last.1 => last.1 = last.1.max(to),
            _ => windows.push((from, to)),
        }
        if windows.len() > opts.frags {
            windows.pop();
            break;
        }
    }
    if windows.is_empty() {
        windows.push((0, opts.len.min(tokens.len())));
    }
    let mut out = String::new();
    for (from, to) in windows {
        if from >= to {
            continue;
        }
        let fragment = match tags {
            Some(tags) => mark(text, tokens, matched, from, to, tags),
            None => text[tokens[from].start..tokens[to - 1].end].to_string(),
        };
        out.push_str(&fragment);
        out.push_str(&opts.separator);
    }
    out
}

impl ResultProcessor for Highlighter {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        let Some(mut row) = self.upstream.next(ctx)? else {
            return Ok(None);
        };
        self.process(ctx, &mut row);
        Ok(Some(row))
    }

    fn name(&self) -> &'static str {
        "Highlighter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{context, row, source};
    use crate::query::iterators::{Record, TermHit};
    use std::sync::Arc;

    fn hit(term: &str) -> Record {
        Record::Term {
            hit: TermHit {
                term: Arc::from(term),
                idf: 1.0,
                bm25_idf: 1.0,
                freq: 1,
                field_mask: 1,
                offsets: vec![1],
            },
            weight: 1.0,
        }
    }

    fn with_body(text: &str, record: Record) -> Row {
        let mut r = row(1, &[("body", Value::str(text))]);
        r.record = Some(record);
        r
    }

    fn options() -> HighlightOptions {
        HighlightOptions {
            fields: Some(vec!["body".into()]),
            open: "<b>".into(),
            close: "</b>".into(),
        }
    }

    #[test]
    fn test_highlight_wraps_matches() {
        let input = with_body("Hello brave new world", hit("world"));
        let mut stage = Highlighter::new(source(vec![input]), Some(options()), None);
        let out = stage.next(&mut context()).unwrap().unwrap();
        assert_eq!(out.get("body"), Some(&Value::str("Hello brave new <b>world</b>")));
    }

    #[test]
    fn test_stem_matches_are_highlighted() {
        let input = with_body("she was running fast", hit("+run"));
        let mut stage = Highlighter::new(source(vec![input]), Some(options()), None);
        let out = stage.next(&mut context()).unwrap().unwrap();
        assert_eq!(out.get("body"), Some(&Value::str("she was <b>running</b> fast")));
    }

    #[test]
    fn test_summarize_fragments() {
        let text = "a b c d e f g target h i j k l m n o p";
        let input = with_body(text, hit("target"));
        let summarize = SummarizeOptions {
            fields: Some(vec!["body".into()]),
            frags: 3,
            len: 4,
            separator: "... ".into(),
        };
        let mut stage = Highlighter::new(source(vec![input]), None, Some(summarize));
        let out = stage.next(&mut context()).unwrap().unwrap();
        assert_eq!(out.get("body"), Some(&Value::str("f g target h... ")));
    }
}
