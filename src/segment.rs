//! Inline expression tokenizer for bubble content.
//!
//! Recognized forms (Plain mode):
//!   `[query]`, `(target)[query]`, `[query](target)`
//! Escapes: `\[`, `\]`, `\(`, `\)`, `\\`. No nesting.
//!
//! In Typst mode only queries written as `[:query]` are expression markers;
//! every other bracket is left for Typst markup, and backslashes are kept so
//! Typst escapes survive.

/// Lexical mode for bubble content.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SegmentMode {
    Plain,
    Typst,
}

/// Raw tokenizer output; resolution to IR segments happens in the compiler.
#[derive(Debug, Clone, PartialEq)]
pub enum InlineSegment {
    Text(String),
    Expr {
        /// Query text between the brackets, escapes unfolded. In Typst mode
        /// this still carries the leading `:`.
        query: String,
        /// Target selector, empty when implicit.
        target: String,
        /// Exact source slice the marker was consumed from.
        raw: String,
    },
}

pub fn parse_inline_segments(content: &str, mode: SegmentMode) -> Vec<InlineSegment> {
    let require_colon = mode == SegmentMode::Typst;
    let mut scanner = Scanner::new(content, mode == SegmentMode::Typst);
    let mut out: Vec<InlineSegment> = Vec::new();
    let mut text = String::new();

    while let Some(ch) = scanner.peek() {
        if ch == '\\' {
            scanner.escape_into(&mut text);
            continue;
        }
        if ch == '[' || ch == '(' {
            if let Some(marker) = scanner.marker() {
                if require_colon && !marker.query.trim_start().starts_with(':') {
                    text.push_str(&marker.raw);
                } else {
                    if !text.is_empty() {
                        out.push(InlineSegment::Text(std::mem::take(&mut text)));
                    }
                    out.push(InlineSegment::Expr {
                        query: marker.query,
                        target: marker.target,
                        raw: marker.raw,
                    });
                }
                continue;
            }
        }
        text.push(ch);
        scanner.bump();
    }

    if !text.is_empty() {
        out.push(InlineSegment::Text(text));
    }
    out
}

/// A complete `[query]` / `(target)[query]` / `[query](target)` marker.
struct RawMarker {
    query: String,
    target: String,
    raw: String,
}

/// Code-point cursor over one content line.
struct Scanner {
    chars: Vec<char>,
    pos: usize,
    keep_backslash: bool,
}

impl Scanner {
    fn new(content: &str, keep_backslash: bool) -> Self {
        Scanner {
            chars: content.chars().collect(),
            pos: 0,
            keep_backslash,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn raw_since(&self, start: usize) -> String {
        self.chars[start..self.pos].iter().collect()
    }

    /// Cursor sits on a backslash. Unfold the escape into `buf`; a trailing
    /// lone backslash stays literal.
    fn escape_into(&mut self, buf: &mut String) {
        self.bump();
        match self.peek() {
            Some(next) => {
                if self.keep_backslash {
                    buf.push('\\');
                }
                buf.push(next);
                self.bump();
            }
            None => buf.push('\\'),
        }
    }

    /// Consume text up to (not including) `close`, unfolding escapes.
    /// `None` when the delimiter never appears; the cursor is left wherever
    /// the scan died, so callers save and restore.
    fn until(&mut self, close: char) -> Option<String> {
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return None,
                Some(c) if c == close => return Some(out),
                Some('\\') => self.escape_into(&mut out),
                Some(c) => {
                    out.push(c);
                    self.bump();
                }
            }
        }
    }

    /// Try to read a whole marker at the cursor. On failure the cursor is
    /// restored so the same characters rescan as plain text.
    fn marker(&mut self) -> Option<RawMarker> {
        let start = self.pos;
        let parsed = self.marker_at(start);
        if parsed.is_none() {
            self.pos = start;
        }
        parsed
    }

    fn marker_at(&mut self, start: usize) -> Option<RawMarker> {
        if self.peek() == Some('(') {
            self.bump();
            let target = self.until(')')?;
            self.bump();
            if self.peek() != Some('[') {
                return None;
            }
            self.bump();
            let query = self.until(']')?;
            self.bump();
            return Some(RawMarker {
                query,
                target,
                raw: self.raw_since(start),
            });
        }

        self.bump(); // '['
        let query = self.until(']')?;
        self.bump();
        let mut target = String::new();
        if self.peek() == Some('(') {
            let mark = self.pos;
            self.bump();
            match self.until(')') {
                Some(t) => {
                    self.bump();
                    target = t;
                }
                // No closing paren, so the '(' is ordinary trailing text.
                None => self.pos = mark,
            }
        }
        Some(RawMarker {
            query,
            target,
            raw: self.raw_since(start),
        })
    }
}

/// `http(s)://`, protocol-relative, and `data:image/` references are passed
/// through to the resolver untouched.
pub fn is_url_like(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() {
        return false;
    }
    s.starts_with("data:image/")
        || s.starts_with("://")
        || s.starts_with("//")
        || s.starts_with("http://")
        || s.starts_with("https://")
}

/// Extract the name from an `asset:<name>` query.
pub fn parse_asset_query(query: &str) -> Option<&str> {
    let q = query.trim();
    let rest = strip_prefix_ignore_case(q, "asset:")?;
    let name = rest.trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// `_`, `_1`, `_2`, … used as an expression target.
pub fn parse_backref_n(target: &str) -> Option<u32> {
    let t = target.trim();
    let rest = t.strip_prefix('_')?;
    if rest.is_empty() {
        return Some(1);
    }
    if rest.chars().all(|c| c.is_ascii_digit()) {
        rest.parse().ok()
    } else {
        None
    }
}
