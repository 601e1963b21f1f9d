//! Line classifier and AST builder.
//!
//! The parser owns all lexical state for multi-line constructs (triple-quote
//! blocks, `@reply`…`@end` blocks, header value blocks) and emits a flat
//! node list. It accumulates diagnostics instead of failing fast; the
//! compiler refuses to run on a parse that reported any error.

use crate::ast::{Block, Marker, Node, Statement, StatementKind};
use crate::diag::{Diagnostic, DiagnosticKind};
use crate::span::{first_non_space_col, line_end_col, Span};

pub fn parse(input: &str) -> (Vec<Node>, Vec<Diagnostic>) {
    Parser::new(input).run()
}

/// In-body directives recognized by exact keyword.
const KNOWN_DIRECTIVES: &[&str] = &[
    "@alias",
    "@tmpalias",
    "@aliasid",
    "@unaliasid",
    "@charid",
    "@uncharid",
    "@avatarid",
    "@unavatarid",
    "@avatar",
    "@usepack",
];

struct Parser<'a> {
    lines: Vec<&'a str>,
    nodes: Vec<Node>,
    diags: Vec<Diagnostic>,
}

struct QuoteBlock {
    content: String,
    next_idx: usize,
    /// Point span at the end of the closing line; node spans are built by
    /// merging it with the opener line.
    end_span: Span,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        let mut lines: Vec<&str> = input.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).collect();
        // `split` leaves a phantom empty line after a trailing newline.
        if lines.last() == Some(&"") {
            lines.pop();
        }
        if let Some(first) = lines.first_mut() {
            *first = first.trim_start_matches('\u{feff}');
        }
        Parser {
            lines,
            nodes: Vec::new(),
            diags: Vec::new(),
        }
    }

    fn error(&mut self, kind: DiagnosticKind, message: impl Into<String>, span: Span) {
        self.diags.push(Diagnostic::new(kind, message, span));
    }

    fn line_span(&self, idx: usize) -> Span {
        let raw = self.lines[idx];
        Span::on_line(idx as u32 + 1, first_non_space_col(raw), line_end_col(raw))
    }

    fn eof_span(&self) -> Span {
        let line = self.lines.len().max(1) as u32;
        let col = self.lines.last().map(|l| line_end_col(l)).unwrap_or(1);
        Span::on_line(line, col, col)
    }

    fn run(mut self) -> (Vec<Node>, Vec<Diagnostic>) {
        let idx = self.header_pass(0);
        self.body_pass(idx);
        (self.nodes, self.diags)
    }

    /// Header region: meta directives, `@typst_global`, and any known
    /// directive. Ends at the first statement-like line.
    fn header_pass(&mut self, mut idx: usize) -> usize {
        while idx < self.lines.len() {
            let raw = self.lines[idx];
            let stripped = raw.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                idx += 1;
                continue;
            }

            let lstripped = raw.trim_start();
            if let Some(token) = known_directive_token(lstripped) {
                let span = self.line_span(idx);
                match parse_known_directive(token, lstripped, span) {
                    Ok(node) => self.nodes.push(node),
                    Err(d) => self.diags.push(d),
                }
                idx += 1;
                continue;
            }

            if match_statement(raw).is_some() {
                break;
            }
            if ["@reply", "@bond", "@pagebreak", "@end"]
                .iter()
                .any(|kw| keyword_rest(stripped, kw).is_some())
            {
                break;
            }

            let Some((key, value)) = match_header_directive(stripped) else {
                break;
            };
            let line_no = idx as u32 + 1;
            let start_col = first_non_space_col(raw);
            match self.parse_header_value(value, idx) {
                Ok((text, next_idx, end_span)) => {
                    let span = Span::on_line(line_no, start_col, line_end_col(raw)).merge(end_span);
                    if key == "typst_global" {
                        self.nodes.push(Node::TypstGlobal { value: text, span });
                    } else {
                        self.nodes.push(Node::MetaKV {
                            key,
                            value: text,
                            span,
                        });
                    }
                    idx = next_idx;
                }
                Err(d) => {
                    self.diags.push(d);
                    idx = self.lines.len();
                }
            }
        }
        idx
    }

    fn body_pass(&mut self, mut idx: usize) {
        let mut has_absorber = false;

        while idx < self.lines.len() {
            let raw = self.lines[idx];
            let line_no = idx as u32 + 1;
            let stripped = raw.trim_start();

            if stripped.trim().is_empty() {
                self.nodes.push(Node::BlankLine {
                    span: Span::on_line(line_no, 1, line_end_col(raw)),
                });
                idx += 1;
                continue;
            }

            let trimmed = stripped.trim_end();
            let start_col = first_non_space_col(raw);

            if let Some(rest) = keyword_rest(trimmed, "@reply") {
                let after = rest.trim_start();
                if let Some(inline) = after.strip_prefix(':') {
                    let items = split_reply_items(inline);
                    if items.is_empty() {
                        self.error(
                            DiagnosticKind::EmptyReply,
                            "@reply requires at least one option",
                            self.line_span(idx),
                        );
                    } else {
                        self.nodes.push(Node::Reply {
                            items,
                            span: Span::on_line(line_no, start_col, line_end_col(raw)),
                        });
                        has_absorber = true;
                    }
                    idx += 1;
                    continue;
                }
                if !rest.is_empty() {
                    self.error(
                        DiagnosticKind::MalformedDirective,
                        "invalid @reply directive (expected: @reply or @reply: ...)",
                        self.line_span(idx),
                    );
                    idx += 1;
                    continue;
                }
                let (items, next_idx, end_span) = self.parse_reply_block(idx);
                if items.is_empty() {
                    self.error(
                        DiagnosticKind::EmptyReply,
                        "@reply block cannot be empty",
                        self.line_span(idx),
                    );
                } else {
                    self.nodes.push(Node::Reply {
                        items,
                        span: Span::on_line(line_no, start_col, line_end_col(raw)).merge(end_span),
                    });
                    has_absorber = true;
                }
                idx = next_idx;
                continue;
            }

            if keyword_rest(trimmed, "@end").is_some() {
                self.error(
                    DiagnosticKind::MalformedDirective,
                    "unexpected @end without @reply",
                    self.line_span(idx),
                );
                idx += 1;
                continue;
            }

            if let Some(rest) = keyword_rest(trimmed, "@bond") {
                let after = rest.trim_start();
                if rest.is_empty() {
                    // A bare @bond may absorb a quote block on the next line.
                    if idx + 1 < self.lines.len() {
                        let next_line = self.lines[idx + 1];
                        match self.try_quote_block(next_line.trim(), idx + 1) {
                            Some(Ok(block)) => {
                                self.nodes.push(Node::Bond {
                                    content: block.content,
                                    span: Span::on_line(line_no, start_col, line_end_col(raw))
                                        .merge(block.end_span),
                                });
                                has_absorber = true;
                                idx = block.next_idx;
                                continue;
                            }
                            Some(Err(d)) => {
                                self.diags.push(d);
                                idx = self.lines.len();
                                continue;
                            }
                            None => {}
                        }
                    }
                    self.nodes.push(Node::Bond {
                        content: String::new(),
                        span: Span::on_line(line_no, start_col, line_end_col(raw)),
                    });
                    has_absorber = true;
                    idx += 1;
                    continue;
                }
                if let Some(content_raw) = after.strip_prefix(':') {
                    match self.parse_header_value(content_raw.trim_start(), idx) {
                        Ok((content, next_idx, end_span)) => {
                            self.nodes.push(Node::Bond {
                                content,
                                span: Span::on_line(line_no, start_col, line_end_col(raw))
                                    .merge(end_span),
                            });
                            has_absorber = true;
                            idx = next_idx;
                        }
                        Err(d) => {
                            self.diags.push(d);
                            idx = self.lines.len();
                        }
                    }
                    continue;
                }
                self.error(
                    DiagnosticKind::MalformedDirective,
                    "invalid @bond directive (expected: @bond or @bond: text)",
                    self.line_span(idx),
                );
                idx += 1;
                continue;
            }

            if let Some(rest) = keyword_rest(trimmed, "@pagebreak") {
                if rest.is_empty() {
                    self.nodes.push(Node::PageBreak {
                        span: Span::on_line(line_no, start_col, line_end_col(raw)),
                    });
                } else {
                    self.error(
                        DiagnosticKind::BadMarkerOnPagebreak,
                        "invalid @pagebreak directive (expected: @pagebreak)",
                        self.line_span(idx),
                    );
                }
                idx += 1;
                continue;
            }

            if stripped.starts_with('@') {
                if let Some(token) = known_directive_token(stripped) {
                    let span = self.line_span(idx);
                    match parse_known_directive(token, stripped, span) {
                        Ok(node) => self.nodes.push(node),
                        Err(d) => self.diags.push(d),
                    }
                    idx += 1;
                    continue;
                }

                if let Some((key, value)) = match_header_directive(trimmed) {
                    match self.parse_header_value(value, idx) {
                        Ok((text, next_idx, end_span)) => {
                            let span =
                                Span::on_line(line_no, start_col, line_end_col(raw)).merge(end_span);
                            if key == "typst_global" {
                                self.nodes.push(Node::TypstGlobal { value: text, span });
                            } else {
                                self.error(
                                    DiagnosticKind::HeaderKeyAfterBody,
                                    format!("header directive @{key} is not allowed after the first statement"),
                                    span,
                                );
                            }
                            idx = next_idx;
                        }
                        Err(d) => {
                            self.diags.push(d);
                            idx = self.lines.len();
                        }
                    }
                    continue;
                }

                let token = stripped.split_whitespace().next().unwrap_or(stripped);
                self.error(
                    DiagnosticKind::UnknownDirective,
                    format!("unknown directive: {token}"),
                    self.line_span(idx),
                );
                idx += 1;
                continue;
            }

            if let Some((kind, payload, kind_col, payload_col)) = match_statement(raw) {
                let (marker, head) = match kind {
                    StatementKind::Narration => (None, payload.trim_end().to_string()),
                    _ => parse_payload(payload, line_no, payload_col),
                };
                match self.try_quote_block(&head, idx) {
                    Some(Ok(block)) => {
                        self.nodes.push(Node::Block(Block {
                            kind,
                            marker,
                            content: block.content,
                            span: Span::on_line(line_no, kind_col, line_end_col(raw))
                                .merge(block.end_span),
                        }));
                        has_absorber = true;
                        idx = block.next_idx;
                    }
                    Some(Err(d)) => {
                        self.diags.push(d);
                        idx = self.lines.len();
                    }
                    None => {
                        self.nodes.push(Node::Statement(Statement {
                            kind,
                            marker,
                            content: head,
                            span: Span::on_line(line_no, kind_col, line_end_col(raw)),
                        }));
                        has_absorber = true;
                        idx += 1;
                    }
                }
                continue;
            }

            // Continuation line.
            if !has_absorber {
                self.error(
                    DiagnosticKind::ContinuationBeforeStatement,
                    "continuation before any statement",
                    self.line_span(idx),
                );
            } else {
                self.nodes.push(Node::Continuation {
                    text: trimmed.to_string(),
                    span: Span::on_line(line_no, start_col, line_end_col(raw)),
                });
            }
            idx += 1;
        }
    }

    /// Parse a header directive value, which may be an inline value or a
    /// triple-quoted block. Returns the text, the next line index, and the
    /// end position.
    fn parse_header_value(
        &self,
        value: &str,
        idx: usize,
    ) -> Result<(String, usize, Span), Diagnostic> {
        match self.try_quote_block(value, idx) {
            Some(Ok(block)) => Ok((block.content, block.next_idx, block.end_span)),
            Some(Err(d)) => Err(d),
            None => {
                let raw = self.lines[idx];
                let end_col = line_end_col(raw);
                Ok((
                    value.trim().to_string(),
                    idx + 1,
                    Span::on_line(idx as u32 + 1, end_col, end_col),
                ))
            }
        }
    }

    /// Detect and consume a triple-quoted block whose opener is `head` on
    /// line `idx`. Trailing text on the opener line becomes the first
    /// content line; the closer must sit on its own line and be a run of at
    /// least as many quotes.
    fn try_quote_block(&self, head: &str, idx: usize) -> Option<Result<QuoteBlock, Diagnostic>> {
        let lstripped = head.trim_start();
        let quote_len = lstripped.chars().take_while(|c| *c == '"').count();
        if quote_len < 3 {
            return None;
        }
        let after = &lstripped[quote_len..];

        let mut content_lines: Vec<String> = Vec::new();
        if !after.is_empty() {
            content_lines.push(after.to_string());
        }

        let mut j = idx + 1;
        while j < self.lines.len() {
            let line = self.lines[j];
            let t = line.trim();
            if !t.is_empty() && t.chars().all(|c| c == '"') && t.chars().count() >= quote_len {
                let end_col = line_end_col(line);
                return Some(Ok(QuoteBlock {
                    content: content_lines.join("\n"),
                    next_idx: j + 1,
                    end_span: Span::on_line(j as u32 + 1, end_col, end_col),
                }));
            }
            content_lines.push(line.to_string());
            j += 1;
        }

        let opener = self.line_span(idx);
        Some(Err(Diagnostic::new(
            DiagnosticKind::UnclosedBlock,
            format!(
                "unterminated quote block (missing {} line)",
                "\"".repeat(quote_len)
            ),
            opener,
        )
        .with_note("reached end of input while inside this block", self.eof_span())))
    }

    /// `@reply` … `@end` block. Items are one per line, optionally written
    /// as `- item` or as quote blocks. Directives other than `@end` are not
    /// allowed inside.
    fn parse_reply_block(&mut self, start_idx: usize) -> (Vec<String>, usize, Span) {
        let mut items = Vec::new();
        let mut j = start_idx + 1;
        while j < self.lines.len() {
            let raw = self.lines[j];
            let stripped = raw.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                j += 1;
                continue;
            }
            if let Some(rest) = keyword_rest(stripped, "@end") {
                if !rest.is_empty() {
                    self.error(
                        DiagnosticKind::MalformedDirective,
                        "invalid @end directive (expected: @end)",
                        self.line_span(j),
                    );
                }
                let end_col = line_end_col(raw);
                return (items, j + 1, Span::on_line(j as u32 + 1, end_col, end_col));
            }
            if stripped.starts_with('@') {
                self.error(
                    DiagnosticKind::NestedDirective,
                    "unexpected directive inside @reply block (use @end to close)",
                    self.line_span(j),
                );
                j += 1;
                continue;
            }

            let item = stripped.strip_prefix("- ").map(str::trim).unwrap_or(stripped);
            match self.try_quote_block(item, j) {
                Some(Ok(block)) => {
                    if !block.content.trim().is_empty() {
                        items.push(block.content);
                    }
                    j = block.next_idx;
                    continue;
                }
                Some(Err(d)) => {
                    self.diags.push(d);
                    return (items, self.lines.len(), self.eof_span());
                }
                None => {}
            }
            if !item.is_empty() {
                items.push(item.to_string());
            }
            j += 1;
        }

        let opener = self.line_span(start_idx);
        self.diags.push(
            Diagnostic::new(
                DiagnosticKind::UnclosedBlock,
                "unterminated @reply block (missing @end)",
                opener,
            )
            .with_note("reached end of input while inside this block", self.eof_span()),
        );
        (items, self.lines.len(), self.eof_span())
    }
}

/// Case-insensitive keyword match with a word boundary: the keyword must be
/// followed by nothing, whitespace, or `:`. Returns the remainder.
fn keyword_rest<'s>(line: &'s str, kw: &str) -> Option<&'s str> {
    let prefix = line.get(..kw.len())?;
    if !prefix.eq_ignore_ascii_case(kw) {
        return None;
    }
    let rest = &line[kw.len()..];
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() || c == ':' => Some(rest),
        Some(_) => None,
    }
}

fn known_directive_token(line: &str) -> Option<&'static str> {
    let token = line.split_whitespace().next()?;
    let lower = token.to_lowercase();
    KNOWN_DIRECTIVES.iter().copied().find(|kw| **kw == *lower)
}

/// `@key: value` with a dotted key allowed (`@asset.hero: ...`).
fn match_header_directive(stripped: &str) -> Option<(String, &str)> {
    let rest = stripped.strip_prefix('@')?;
    let mut key_end = 0;
    for (i, c) in rest.char_indices() {
        let ok = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
        };
        if !ok {
            break;
        }
        key_end = i + c.len_utf8();
    }
    if key_end == 0 {
        return None;
    }
    let key = rest[..key_end].to_lowercase();
    let after = rest[key_end..].trim_start();
    let value = after.strip_prefix(':')?;
    Some((key, value.trim_start()))
}

/// `^(\s*)([-<>])(\s+)(.*)$` — returns (kind, payload, kind col, payload col).
fn match_statement(raw: &str) -> Option<(StatementKind, &str, u32, u32)> {
    let lstripped = raw.trim_start();
    let indent_chars = raw.chars().count() - lstripped.chars().count();
    let kind = match lstripped.chars().next()? {
        '-' => StatementKind::Narration,
        '>' => StatementKind::Left,
        '<' => StatementKind::Right,
        _ => return None,
    };
    let rest = &lstripped[1..];
    if !rest.chars().next()?.is_whitespace() {
        return None;
    }
    let ws_chars = rest.chars().take_while(|c| c.is_whitespace()).count();
    let ws_bytes: usize = rest
        .chars()
        .take_while(|c| c.is_whitespace())
        .map(char::len_utf8)
        .sum();
    let kind_col = indent_chars as u32 + 1;
    Some((
        kind,
        &rest[ws_bytes..],
        kind_col,
        kind_col + 1 + ws_chars as u32,
    ))
}

/// Split a `>`/`<` payload into an optional speaker marker and the content.
///
/// The marker is everything before the first unescaped top-level colon, and
/// only when it looks like a selector; otherwise the whole payload is
/// content (so `> 早上好` needs no escaping).
fn parse_payload(payload: &str, line_no: u32, col_base: u32) -> (Option<Marker>, String) {
    let payload = payload.trim_end();
    let Some(colon_idx) = split_top_level_colon(payload) else {
        return (None, payload.to_string());
    };

    let head_raw = &payload[..colon_idx];
    let tail = payload[colon_idx + 1..].trim_start();
    let head = head_raw.trim();
    if head.is_empty() {
        return (None, payload.to_string());
    }

    let lead_ws = head_raw.chars().count() - head_raw.trim_start().chars().count();
    let start_col = col_base + lead_ws as u32;
    let span = Span::on_line(line_no, start_col, start_col + head.chars().count() as u32);

    if let Some(digits) = head.strip_prefix('_') {
        if digits.chars().all(|c| c.is_ascii_digit()) {
            let n = if digits.is_empty() {
                1
            } else {
                digits.parse().unwrap_or(0)
            };
            return (Some(Marker::Backref { n, span }), tail.to_string());
        }
    }
    if let Some(digits) = head.strip_prefix('~') {
        if digits.chars().all(|c| c.is_ascii_digit()) {
            let n = if digits.is_empty() {
                1
            } else {
                digits.parse().unwrap_or(0)
            };
            return (Some(Marker::Index { n, span }), tail.to_string());
        }
    }
    if is_permissible_selector(head) {
        return (
            Some(Marker::Explicit {
                selector: head.to_string(),
                span,
            }),
            tail.to_string(),
        );
    }
    (None, payload.to_string())
}

fn is_permissible_selector(head: &str) -> bool {
    head.chars().all(|c| {
        c.is_alphanumeric() || c == '_' || c == '.' || c == '(' || c == ')' || (c as u32) >= 0x80
    })
}

fn split_top_level_colon(s: &str) -> Option<usize> {
    let mut depth_sq = 0u32;
    let mut depth_par = 0u32;
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '[' => depth_sq += 1,
            ']' if depth_sq > 0 => depth_sq -= 1,
            '(' => depth_par += 1,
            ')' if depth_par > 0 => depth_par -= 1,
            ':' if depth_sq == 0 && depth_par == 0 => return Some(idx),
            _ => {}
        }
    }
    None
}

fn split_reply_items(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn directive_payload<'s>(line: &'s str, kw: &str) -> &'s str {
    debug_assert!(line.len() >= kw.len());
    line[kw.len()..].trim()
}

fn parse_known_directive(token: &'static str, line: &str, span: Span) -> Result<Node, Diagnostic> {
    let malformed = |msg: String| Err(Diagnostic::new(DiagnosticKind::MalformedDirective, msg, span));
    let payload = directive_payload(line, token);

    match token {
        "@usepack" => {
            let parts: Vec<&str> = payload.split_whitespace().collect();
            if parts.len() == 3 && parts[1].eq_ignore_ascii_case("as") {
                let pack_id = parts[0];
                let alias = parts[2];
                let ok = |s: &str| {
                    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                };
                if ok(pack_id) && ok(alias) {
                    return Ok(Node::UsePack {
                        pack_id: pack_id.to_string(),
                        alias: alias.to_string(),
                        span,
                    });
                }
            }
            malformed("invalid @usepack directive (expected: @usepack <pack_id> as <alias>)".into())
        }
        "@alias" | "@tmpalias" => {
            let Some((name, display)) = payload.split_once('=') else {
                return malformed(format!("invalid {token} directive (missing '=')"));
            };
            let name = name.trim().to_string();
            let display = display.trim().to_string();
            if name.is_empty() {
                return malformed(format!("invalid {token} directive (empty name)"));
            }
            Ok(if token == "@alias" {
                Node::Alias { name, display, span }
            } else {
                Node::TmpAlias { name, display, span }
            })
        }
        "@aliasid" => {
            let mut parts = payload.splitn(2, char::is_whitespace);
            match (parts.next(), parts.next()) {
                (Some(id), Some(name)) if !id.is_empty() && !name.trim().is_empty() => {
                    Ok(Node::AliasId {
                        short_id: id.to_string(),
                        name: name.trim().to_string(),
                        span,
                    })
                }
                _ => malformed("invalid @aliasid directive (expected: @aliasid <id> <name>)".into()),
            }
        }
        "@unaliasid" => {
            if payload.is_empty() || payload.contains(char::is_whitespace) {
                return malformed("invalid @unaliasid directive (expected: @unaliasid <id>)".into());
            }
            Ok(Node::UnaliasId {
                short_id: payload.to_string(),
                span,
            })
        }
        "@charid" => {
            let mut parts = payload.splitn(2, char::is_whitespace);
            match (parts.next(), parts.next()) {
                (Some(id), Some(display)) if !display.trim().is_empty() => Ok(Node::CharId {
                    short_id: Some(id.to_string()),
                    display: display.trim().to_string(),
                    span,
                }),
                // Single argument: display only, id derived from it.
                (Some(display), None) if !display.is_empty() => Ok(Node::CharId {
                    short_id: None,
                    display: display.to_string(),
                    span,
                }),
                _ => malformed("invalid @charid directive (expected: @charid <id> <display>)".into()),
            }
        }
        "@uncharid" => {
            if payload.is_empty() || payload.contains(char::is_whitespace) {
                return malformed("invalid @uncharid directive (expected: @uncharid <id>)".into());
            }
            Ok(Node::UncharId {
                short_id: payload.to_string(),
                span,
            })
        }
        "@avatarid" => {
            let mut parts = payload.splitn(2, char::is_whitespace);
            match (parts.next(), parts.next()) {
                (Some(id), Some(asset)) if !id.is_empty() && !asset.trim().is_empty() => {
                    Ok(Node::AvatarId {
                        short_id: id.to_string(),
                        asset: asset.trim().to_string(),
                        span,
                    })
                }
                _ => malformed(
                    "invalid @avatarid directive (expected: @avatarid <id> <asset_name>)".into(),
                ),
            }
        }
        "@unavatarid" => {
            if payload.is_empty() || payload.contains(char::is_whitespace) {
                return malformed(
                    "invalid @unavatarid directive (expected: @unavatarid <id>)".into(),
                );
            }
            Ok(Node::UnavatarId {
                short_id: payload.to_string(),
                span,
            })
        }
        "@avatar" => {
            let Some((name, asset)) = payload.split_once('=') else {
                return malformed("invalid @avatar directive (missing '=')".into());
            };
            let name = name.trim().to_string();
            if name.is_empty() {
                return malformed("invalid @avatar directive (empty character name)".into());
            }
            Ok(Node::AvatarOverride {
                name,
                asset: asset.trim().to_string(),
                span,
            })
        }
        _ => malformed(format!("unsupported directive token: {token}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &str) -> Vec<Node> {
        let (nodes, diags) = parse(input);
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        nodes
    }

    fn only_errors(input: &str) -> Vec<Diagnostic> {
        parse(input).1
    }

    #[test]
    fn empty_input_parses_to_nothing() {
        let (nodes, diags) = parse("");
        assert!(nodes.is_empty());
        assert!(diags.is_empty());
    }

    #[test]
    fn header_meta_and_typst_global() {
        let nodes = parse_ok("@title: 测试\n@typst: on\n@typst_global: #let x = 1\n");
        assert_eq!(nodes.len(), 3);
        assert!(
            matches!(&nodes[0], Node::MetaKV { key, value, .. } if key == "title" && value == "测试")
        );
        assert!(matches!(&nodes[2], Node::TypstGlobal { value, .. } if value == "#let x = 1"));
    }

    #[test]
    fn header_keys_are_lowercased_and_dotted() {
        let nodes = parse_ok("@Asset.Hero: https://x/y.png\n");
        assert!(
            matches!(&nodes[0], Node::MetaKV { key, .. } if key == "asset.hero")
        );
    }

    #[test]
    fn bom_is_tolerated() {
        let nodes = parse_ok("\u{feff}@title: x\n");
        assert!(matches!(&nodes[0], Node::MetaKV { key, .. } if key == "title"));
    }

    #[test]
    fn statement_kinds_and_markers() {
        let nodes = parse_ok("- 旁白\n> 星野: 早上好\n< 回答\n");
        assert_eq!(nodes.len(), 3);
        let Node::Statement(narr) = &nodes[0] else {
            panic!("expected statement");
        };
        assert_eq!(narr.kind, StatementKind::Narration);
        assert_eq!(narr.content, "旁白");

        let Node::Statement(left) = &nodes[1] else {
            panic!("expected statement");
        };
        assert_eq!(left.kind, StatementKind::Left);
        assert!(
            matches!(&left.marker, Some(Marker::Explicit { selector, .. }) if selector == "星野")
        );
        assert_eq!(left.content, "早上好");

        let Node::Statement(right) = &nodes[2] else {
            panic!("expected statement");
        };
        assert_eq!(right.kind, StatementKind::Right);
        assert!(right.marker.is_none());
        assert_eq!(right.content, "回答");
    }

    #[test]
    fn backref_and_index_markers() {
        let nodes = parse_ok("> _: 继续\n> _2: 再来\n> ~1: 回到最初\n");
        let markers: Vec<_> = nodes
            .iter()
            .map(|n| match n {
                Node::Statement(s) => s.marker.clone(),
                _ => panic!("expected statement"),
            })
            .collect();
        assert!(matches!(markers[0], Some(Marker::Backref { n: 1, .. })));
        assert!(matches!(markers[1], Some(Marker::Backref { n: 2, .. })));
        assert!(matches!(markers[2], Some(Marker::Index { n: 1, .. })));
    }

    #[test]
    fn colon_inside_brackets_is_not_a_marker() {
        let nodes = parse_ok("> 星野: 看[asset:pic]这个\n");
        let Node::Statement(s) = &nodes[0] else {
            panic!("expected statement");
        };
        assert!(matches!(&s.marker, Some(Marker::Explicit { selector, .. }) if selector == "星野"));
        assert_eq!(s.content, "看[asset:pic]这个");
    }

    #[test]
    fn non_selector_head_is_content() {
        // "早上 好" contains a space, so the colon does not start a marker.
        let nodes = parse_ok("> 星野: x\n> 早上 好: 吗\n");
        let Node::Statement(s) = &nodes[1] else {
            panic!("expected statement");
        };
        assert!(s.marker.is_none());
        assert_eq!(s.content, "早上 好: 吗");
    }

    #[test]
    fn escaped_colon_is_content() {
        let nodes = parse_ok("> 星野\\: 早\n");
        let Node::Statement(s) = &nodes[0] else {
            panic!("expected statement");
        };
        assert!(s.marker.is_none());
    }

    #[test]
    fn statement_spans_cover_the_line() {
        let nodes = parse_ok("> 星野: 早\n");
        let Node::Statement(s) = &nodes[0] else {
            panic!("expected statement");
        };
        assert_eq!(s.span, Span::on_line(1, 1, 8));
        let Some(Marker::Explicit { span, .. }) = &s.marker else {
            panic!("expected explicit marker");
        };
        assert_eq!(*span, Span::on_line(1, 3, 5));
    }

    #[test]
    fn continuation_attaches_after_statement() {
        let nodes = parse_ok("> 星野: 第一行\n第二行\n");
        assert!(matches!(&nodes[1], Node::Continuation { text, .. } if text == "第二行"));
    }

    #[test]
    fn leading_continuation_is_an_error() {
        let diags = only_errors("没有语句的行\n");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::ContinuationBeforeStatement);
        assert_eq!(diags[0].span.start_line, 1);
    }

    #[test]
    fn quote_block_with_inline_head() {
        let nodes = parse_ok("> 星野: \"\"\"第一行\n第二行\n\"\"\"\n");
        let Node::Block(b) = &nodes[0] else {
            panic!("expected block");
        };
        assert_eq!(b.content, "第一行\n第二行");
        assert_eq!(b.span.start_line, 1);
        assert_eq!(b.span.end_line, 3);
    }

    #[test]
    fn longer_quote_runs_match_their_own_closer() {
        let nodes = parse_ok("- \"\"\"\"\ncontains \"\"\" inside\n\"\"\"\"\n");
        let Node::Block(b) = &nodes[0] else {
            panic!("expected block");
        };
        assert_eq!(b.content, "contains \"\"\" inside");
    }

    #[test]
    fn unclosed_block_reports_opener_and_eof() {
        let diags = only_errors("> 星野: \"\"\"\n还没结束\n");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::UnclosedBlock);
        assert_eq!(diags[0].span.start_line, 1);
        assert_eq!(diags[0].notes.len(), 1);
    }

    #[test]
    fn reply_inline_and_block_forms() {
        let nodes = parse_ok("- 出题\n@reply: 是 | 否 | 跳过\n@reply\n- 选项A\n选项B\n@end\n");
        let Node::Reply { items, .. } = &nodes[1] else {
            panic!("expected reply");
        };
        assert_eq!(items, &["是", "否", "跳过"]);
        let Node::Reply { items, span } = &nodes[2] else {
            panic!("expected reply");
        };
        assert_eq!(items, &["选项A", "选项B"]);
        assert_eq!(span.start_line, 3);
        assert_eq!(span.end_line, 6);
    }

    #[test]
    fn nested_directive_inside_reply() {
        let diags = only_errors("- 出题\n@reply\n@reply\n@end\n");
        assert!(diags
            .iter()
            .any(|d| d.kind == DiagnosticKind::NestedDirective));
    }

    #[test]
    fn empty_reply_is_an_error() {
        let diags = only_errors("- 出题\n@reply: |\n");
        assert_eq!(diags[0].kind, DiagnosticKind::EmptyReply);
        let diags = only_errors("- 出题\n@reply\n@end\n");
        assert_eq!(diags[0].kind, DiagnosticKind::EmptyReply);
    }

    #[test]
    fn reply_without_end_is_unclosed() {
        let diags = only_errors("- 出题\n@reply\n选项\n");
        assert_eq!(diags[0].kind, DiagnosticKind::UnclosedBlock);
    }

    #[test]
    fn stray_end_is_an_error() {
        let diags = only_errors("- x\n@end\n");
        assert_eq!(diags[0].kind, DiagnosticKind::MalformedDirective);
    }

    #[test]
    fn bond_forms() {
        let nodes = parse_ok("> 日富美: 继续\n@bond\n@bond: 自定义文本\n");
        assert!(matches!(&nodes[1], Node::Bond { content, .. } if content.is_empty()));
        assert!(matches!(&nodes[2], Node::Bond { content, .. } if content == "自定义文本"));
    }

    #[test]
    fn bond_absorbs_following_quote_block() {
        let nodes = parse_ok("> 日富美: 继续\n@bond\n\"\"\"\n多行\n文本\n\"\"\"\n");
        assert!(matches!(&nodes[1], Node::Bond { content, .. } if content == "多行\n文本"));
    }

    #[test]
    fn pagebreak_must_be_bare() {
        let nodes = parse_ok("- x\n@pagebreak\n");
        assert!(matches!(&nodes[1], Node::PageBreak { .. }));
        let diags = only_errors("- x\n@pagebreak abc\n");
        assert_eq!(diags[0].kind, DiagnosticKind::BadMarkerOnPagebreak);
    }

    #[test]
    fn header_key_after_body_is_rejected() {
        let diags = only_errors("- x\n@title: 新标题\n");
        assert_eq!(diags[0].kind, DiagnosticKind::HeaderKeyAfterBody);
    }

    #[test]
    fn typst_global_is_allowed_in_body() {
        let nodes = parse_ok("- x\n@typst_global: #let y = 2\n");
        assert!(matches!(&nodes[1], Node::TypstGlobal { value, .. } if value == "#let y = 2"));
    }

    #[test]
    fn unknown_directive_is_reported() {
        let diags = only_errors("- x\n@frobnicate now\n");
        assert_eq!(diags[0].kind, DiagnosticKind::UnknownDirective);
    }

    #[test]
    fn known_directives_parse_in_header_and_body() {
        let nodes = parse_ok(
            "@usepack fanart as fa\n@charid yz 柚子\n- x\n@alias 星野=星野(一年级)\n@aliasid hs 星野\n",
        );
        assert!(
            matches!(&nodes[0], Node::UsePack { pack_id, alias, .. } if pack_id == "fanart" && alias == "fa")
        );
        assert!(
            matches!(&nodes[1], Node::CharId { short_id: Some(id), display, .. } if id == "yz" && display == "柚子")
        );
        assert!(
            matches!(&nodes[3], Node::Alias { name, display, .. } if name == "星野" && display == "星野(一年级)")
        );
        assert!(
            matches!(&nodes[4], Node::AliasId { short_id, name, .. } if short_id == "hs" && name == "星野")
        );
    }

    #[test]
    fn malformed_directives_are_reported() {
        let diags = only_errors("- x\n@alias 星野\n");
        assert_eq!(diags[0].kind, DiagnosticKind::MalformedDirective);
        let diags = only_errors("@usepack broken\n");
        assert_eq!(diags[0].kind, DiagnosticKind::MalformedDirective);
    }

    #[test]
    fn comment_lines_skip_in_header_only() {
        let nodes = parse_ok("# 注释\n@title: x\n- y\n# 正文里是续行\n");
        assert!(matches!(&nodes[0], Node::MetaKV { .. }));
        assert!(matches!(&nodes[2], Node::Continuation { text, .. } if text == "# 正文里是续行"));
    }

    #[test]
    fn crlf_line_endings() {
        let nodes = parse_ok("@title: x\r\n> 星野: 早\r\n");
        assert_eq!(nodes.len(), 2);
        let Node::Statement(s) = &nodes[1] else {
            panic!("expected statement");
        };
        assert_eq!(s.content, "早");
    }

    #[test]
    fn node_spans_reclassify_to_the_same_kind() {
        let src = "@title: x\n> 星野: 早\n- 旁白\n@pagebreak\n";
        let nodes = parse_ok(src);
        let lines: Vec<&str> = src.lines().collect();
        for node in &nodes {
            let span = node.span();
            let snippet = lines[node.line_no() as usize - 1];
            let (reparsed, diags) = parse(snippet);
            assert!(diags.is_empty());
            assert_eq!(reparsed.len(), 1, "snippet {snippet:?}");
            assert_eq!(
                std::mem::discriminant(&reparsed[0]),
                std::mem::discriminant(node),
                "snippet {snippet:?}"
            );
            assert_eq!(span.start_line, node.line_no());
        }
    }

    #[test]
    fn parser_recovers_and_accumulates_errors() {
        let (nodes, diags) = parse("- x\n@pagebreak abc\n@frobnicate\n> 星野: 好\n");
        assert_eq!(diags.len(), 2);
        // The good statement after the errors is still in the AST.
        assert!(nodes
            .iter()
            .any(|n| matches!(n, Node::Statement(s) if s.content == "好")));
    }
}
