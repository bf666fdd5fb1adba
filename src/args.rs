//! Cursor over command arguments

use bytes::Bytes;

use crate::types::parse_f64;
use crate::{Error, Result};

/// Forward-only reader over a command's argument tokens.
///
/// Keywords are matched case-insensitively. Every accessor fails with a
/// `BadArgument` error naming what was expected.
pub struct ArgCursor<'a> {
    args: &'a [Bytes],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(args: &'a [Bytes]) -> Self {
        Self { args, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.args.len()
    }

    pub fn remaining(&self) -> usize {
        self.args.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek_str(&self) -> Option<&'a str> {
        self.args
            .get(self.pos)
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Whether the next token equals `keyword` (ignoring case), without consuming it.
    pub fn peek_is(&self, keyword: &str) -> bool {
        self.peek_str()
            .map(|s| s.eq_ignore_ascii_case(keyword))
            .unwrap_or(false)
    }

    pub fn next_bytes(&mut self) -> Result<&'a Bytes> {
        let arg = self
            .args
            .get(self.pos)
            .ok_or_else(|| Error::bad_argument("Missing argument"))?;
        self.pos += 1;
        Ok(arg)
    }

    pub fn next_str(&mut self) -> Result<&'a str> {
        let bytes = self.next_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|_| Error::bad_argument("Argument is not valid UTF-8"))
    }

    pub fn next_string(&mut self) -> Result<String> {
        self.next_str().map(str::to_string)
    }

    pub fn next_u64(&mut self, what: &str) -> Result<u64> {
        let s = self.next_str()?;
        s.parse::<u64>()
            .map_err(|_| Error::bad_argument(format!("Bad arguments for {what}: expected a non-negative integer, got `{s}`")))
    }

    pub fn next_usize(&mut self, what: &str) -> Result<usize> {
        self.next_u64(what).map(|n| n as usize)
    }

    pub fn next_i64(&mut self, what: &str) -> Result<i64> {
        let s = self.next_str()?;
        s.parse::<i64>()
            .map_err(|_| Error::bad_argument(format!("Bad arguments for {what}: expected an integer, got `{s}`")))
    }

    pub fn next_f64(&mut self, what: &str) -> Result<f64> {
        let s = self.next_str()?;
        parse_f64(s)
            .ok_or_else(|| Error::bad_argument(format!("Bad arguments for {what}: expected a number, got `{s}`")))
    }

    /// Consume the next token if it equals `keyword`.
    pub fn eat(&mut self, keyword: &str) -> bool {
        if self.peek_is(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, keyword: &str) -> Result<()> {
        if self.eat(keyword) {
            Ok(())
        } else {
            Err(Error::bad_argument(format!(
                "Expected `{keyword}`, got `{}`",
                self.peek_str().unwrap_or("<end>")
            )))
        }
    }

    /// Read `n` followed by `n` tokens.
    pub fn next_counted(&mut self, what: &str) -> Result<Vec<&'a Bytes>> {
        let n = self.next_usize(what)?;
        if n > self.remaining() {
            return Err(Error::bad_argument(format!(
                "Bad arguments for {what}: expected {n} arguments, only {} given",
                self.remaining()
            )));
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next_bytes()?);
        }
        Ok(out)
    }

    pub fn next_counted_strings(&mut self, what: &str) -> Result<Vec<String>> {
        self.next_counted(what)?
            .into_iter()
            .map(|b| {
                std::str::from_utf8(b)
                    .map(str::to_string)
                    .map_err(|_| Error::bad_argument("Argument is not valid UTF-8"))
            })
            .collect()
    }
}

/// Build an argument vector from string slices; used by tests and the HTTP surface.
pub fn to_args<S: AsRef<str>>(tokens: &[S]) -> Vec<Bytes> {
    tokens
        .iter()
        .map(|t| Bytes::copy_from_slice(t.as_ref().as_bytes()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_are_case_insensitive() {
        let args = to_args(&["limit", "0", "10"]);
        let mut cursor = ArgCursor::new(&args);
        assert!(cursor.eat("LIMIT"));
        assert_eq!(cursor.next_u64("offset").unwrap(), 0);
        assert_eq!(cursor.next_i64("num").unwrap(), 10);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_counted_list_rejects_short_input() {
        let args = to_args(&["3", "a", "b"]);
        let mut cursor = ArgCursor::new(&args);
        assert!(matches!(
            cursor.next_counted("RETURN"),
            Err(Error::BadArgument(_))
        ));
    }
}
