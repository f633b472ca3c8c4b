//! Recursive-descent parser for the vector selector subset of PromQL.

use crate::{MatchType, Matcher, SelectorError, VectorSelector};

// Bare words that start other PromQL expressions rather than naming a metric.
const KEYWORDS: &[&str] = &[
    "and", "or", "unless", "atan2", "by", "without", "on", "ignoring", "group_left", "group_right",
    "bool", "offset", "sum", "avg", "count", "min", "max", "group", "stddev", "stdvar", "topk",
    "bottomk", "count_values", "quantile", "limitk", "limit_ratio", "inf", "nan",
];

/// Parse `input` as exactly one vector selector. Any other expression shape
/// (function calls, aggregations, range selectors, binary expressions) is
/// rejected.
pub fn parse(input: &str) -> Result<VectorSelector, SelectorError> {
    let mut p = Parser { src: input, pos: 0 };
    p.skip_ws();
    let name = match p.peek() {
        None => return Err(p.syntax("empty selector")),
        Some('{') => None,
        Some(c) if is_metric_start(c) => {
            let name = p.take_while(is_metric_char);
            if KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(name)) {
                return Err(SelectorError::NotVectorSelector(format!("keyword {name:?}")));
            }
            Some(name.to_string())
        }
        Some(_) => return Err(p.not_vector()),
    };
    p.skip_ws();
    let matchers = if p.eat('{') { p.matchers()? } else { Vec::new() };
    p.skip_ws();
    if p.peek().is_some() {
        return Err(p.not_vector());
    }
    VectorSelector::new(name, matchers)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str { &self.src[self.pos..] }
    fn peek(&self) -> Option<char> { self.rest().chars().next() }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) { break; }
            self.pos += c.len_utf8();
        }
        &self.src[start..self.pos]
    }

    /// Whitespace and `#` line comments.
    fn skip_ws(&mut self) {
        loop {
            self.take_while(char::is_whitespace);
            if self.peek() != Some('#') { break; }
            self.take_while(|c| c != '\n');
        }
    }

    fn syntax(&self, msg: impl Into<String>) -> SelectorError {
        SelectorError::Syntax { pos: self.pos, msg: msg.into() }
    }

    fn not_vector(&self) -> SelectorError {
        let rest: String = self.rest().chars().take(32).collect();
        SelectorError::NotVectorSelector(format!("unexpected {rest:?} at position {}", self.pos))
    }

    /// Matcher list after the opening brace, through the closing brace.
    fn matchers(&mut self) -> Result<Vec<Matcher>, SelectorError> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                return Ok(out);
            }
            let name = match self.peek() {
                Some(c) if is_label_start(c) => self.take_while(is_label_char).to_string(),
                Some(c) => return Err(self.syntax(format!("unexpected character {c:?} in label matching, expected label name"))),
                None => return Err(self.syntax("unexpected end of input inside braces")),
            };
            self.skip_ws();
            let kind = self.match_op()?;
            self.skip_ws();
            let value = self.string()?;
            out.push(Matcher::new(kind, name, value)?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(out),
                Some(c) => return Err(self.syntax(format!("unexpected character {c:?}, expected ',' or '}}'"))),
                None => return Err(self.syntax("unexpected end of input inside braces")),
            }
        }
    }

    fn match_op(&mut self) -> Result<MatchType, SelectorError> {
        let rest = self.rest();
        let (kind, len) = if rest.starts_with("=~") {
            (MatchType::Regexp, 2)
        } else if rest.starts_with("!~") {
            (MatchType::NotRegexp, 2)
        } else if rest.starts_with("!=") {
            (MatchType::NotEqual, 2)
        } else if rest.starts_with('=') {
            (MatchType::Equal, 1)
        } else {
            return Err(self.syntax("expected label matching operator"));
        };
        self.pos += len;
        Ok(kind)
    }

    /// Double-quoted, single-quoted or backtick (raw) string literal.
    fn string(&mut self) -> Result<String, SelectorError> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'' | '`')) => q,
            _ => return Err(self.syntax("expected quoted label value")),
        };
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            let c = self.bump().ok_or_else(|| SelectorError::Syntax { pos: start, msg: "unterminated quoted string".into() })?;
            match c {
                c if c == quote => return Ok(out),
                '\\' if quote != '`' => out.push(self.escape(quote)?),
                '\n' if quote != '`' => return Err(SelectorError::Syntax { pos: start, msg: "unterminated quoted string".into() }),
                c => out.push(c),
            }
        }
    }

    fn escape(&mut self, quote: char) -> Result<char, SelectorError> {
        let c = self.bump().ok_or_else(|| self.syntax("unterminated escape sequence"))?;
        let simple = match c {
            'a' => Some('\x07'),
            'b' => Some('\x08'),
            'f' => Some('\x0c'),
            'n' => Some('\n'),
            'r' => Some('\r'),
            't' => Some('\t'),
            'v' => Some('\x0b'),
            '\\' => Some('\\'),
            c if c == quote => Some(c),
            _ => None,
        };
        if let Some(ch) = simple {
            return Ok(ch);
        }
        let (digits, radix) = match c {
            'x' => (2, 16),
            'u' => (4, 16),
            'U' => (8, 16),
            '0'..='7' => {
                self.pos -= 1;
                (3, 8)
            }
            other => return Err(self.syntax(format!("unknown escape sequence \\{other}"))),
        };
        let end = self.pos + digits;
        let raw = self.src.get(self.pos..end).ok_or_else(|| self.syntax("truncated escape sequence"))?;
        if !raw.chars().all(|c| c.is_digit(radix)) {
            return Err(self.syntax(format!("invalid escape sequence {raw:?}")));
        }
        let code = u32::from_str_radix(raw, radix).map_err(|_| self.syntax(format!("invalid escape sequence {raw:?}")))?;
        if radix == 8 && code > 0o377 {
            return Err(self.syntax(format!("octal escape value {code} > 255")));
        }
        self.pos = end;
        char::from_u32(code).ok_or_else(|| self.syntax(format!("escape sequence is an invalid Unicode character: {code:#x}")))
    }
}

fn is_metric_start(c: char) -> bool { c.is_ascii_alphabetic() || c == '_' || c == ':' }
fn is_metric_char(c: char) -> bool { c.is_ascii_alphanumeric() || c == '_' || c == ':' }
fn is_label_start(c: char) -> bool { c.is_ascii_alphabetic() || c == '_' }
fn is_label_char(c: char) -> bool { c.is_ascii_alphanumeric() || c == '_' }
