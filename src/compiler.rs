//! Semantic compiler: folds the node list into the IR while tracking speaker
//! state, aliases, and avatar overrides.
//!
//! Compilation is a strict forward pass. Directives that only mutate state do
//! not appear in `chat`, but their effects are visible from that point on —
//! never retroactively. The first error aborts the compile; warnings ride on
//! the success value.

use std::collections::{HashMap, HashSet};
use std::mem;

use indexmap::IndexMap;
use serde_json::Value;

use crate::ast::{Marker, Node, StatementKind};
use crate::diag::{Diagnostic, DiagnosticKind};
use crate::pack::PackRegistry;
use crate::resolve::{
    base_name, custom_hash_id, is_reserved_short_id, is_valid_id_token, resolve_selector,
    CustomChar, ResolveCtx, Resolved,
};
use crate::segment::{
    is_url_like, parse_asset_query, parse_backref_n, parse_inline_segments, InlineSegment,
    SegmentMode,
};
use crate::span::Span;
use crate::types::{ChatLine, ReplyItem, ScriptIr, Segment};

#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// Bubble content is Typst markup; only `[:…]` markers are expressions
    /// and blank lines are paragraph breaks.
    pub typst_mode: bool,
    /// Join continuation lines with `\n` (canonical) or a space.
    pub join_with_newline: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            typst_mode: false,
            join_with_newline: true,
        }
    }
}

#[derive(Debug)]
pub struct CompileOutput {
    pub ir: ScriptIr,
    pub warnings: Vec<Diagnostic>,
    /// EULA / version notices passed through from the pack registry.
    pub notices: Vec<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn idx(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

const SENSEI: &str = "__Sensei";
const REPLY_LABEL: &str = "回复";

pub struct Compiler<'a> {
    registry: &'a dyn PackRegistry,
    options: CompileOptions,
    warnings: Vec<Diagnostic>,

    meta: IndexMap<String, Value>,
    typst_global: String,
    chat: Vec<ChatLine>,

    /// `@usepack` alias -> pack_id, declaration order.
    pack_aliases: IndexMap<String, String>,
    /// Persistent display overrides, char_id -> name.
    aliases: HashMap<String, String>,
    /// Temp aliases waiting for their character to speak, per side.
    pending_tmp: [HashMap<String, String>; 2],
    /// The single active temp alias per side.
    active_tmp: [Option<(String, String)>; 2],
    /// `@aliasid` short id -> character name.
    short_ids: HashMap<String, String>,
    /// `@charid` declarations, insertion order.
    custom_chars: IndexMap<String, CustomChar>,
    avatar_overrides: HashMap<String, String>,
    /// First author-visible spelling per char_id.
    display_names: HashMap<String, String>,

    side_current: [Option<String>; 2],
    /// Distinct char_ids per side, most recent first.
    side_history: [Vec<String>; 2],
    /// Distinct char_ids in order of first appearance, both sides.
    global_order: Vec<String>,
    /// Most recent TEXT speaker, used for bond synthesis.
    last_speaker: Option<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a dyn PackRegistry, options: CompileOptions) -> Self {
        Compiler {
            registry,
            options,
            warnings: Vec::new(),
            meta: IndexMap::new(),
            typst_global: String::new(),
            chat: Vec::new(),
            pack_aliases: IndexMap::new(),
            aliases: HashMap::new(),
            pending_tmp: [HashMap::new(), HashMap::new()],
            active_tmp: [None, None],
            short_ids: HashMap::new(),
            custom_chars: IndexMap::new(),
            avatar_overrides: HashMap::new(),
            display_names: HashMap::new(),
            side_current: [None, None],
            side_history: [Vec::new(), Vec::new()],
            global_order: Vec::new(),
            last_speaker: None,
        }
    }

    pub fn compile(mut self, nodes: Vec<Node>) -> Result<CompileOutput, Diagnostic> {
        let notices = self.registry.notices();

        for node in nodes {
            self.handle_node(node)?;
        }

        self.attach_segments()?;
        let custom_chars = self.build_custom_chars();

        Ok(CompileOutput {
            ir: ScriptIr {
                meta: self.meta,
                typst_global: self.typst_global,
                typst_assets_global: String::new(),
                custom_chars,
                chat: self.chat,
            },
            warnings: self.warnings,
            notices,
        })
    }

    fn handle_node(&mut self, node: Node) -> Result<(), Diagnostic> {
        match node {
            Node::MetaKV { key, value, .. } => {
                self.set_meta(key, value);
                Ok(())
            }
            Node::TypstGlobal { value, .. } => {
                if !self.typst_global.is_empty() {
                    self.typst_global.push('\n');
                }
                self.typst_global.push_str(&value);
                Ok(())
            }
            Node::UsePack {
                pack_id,
                alias,
                span,
            } => self.handle_usepack(pack_id, alias, span),
            Node::Alias {
                name,
                display,
                span,
            } => {
                match self.resolve(&name, span) {
                    Ok(r) => {
                        if display.is_empty() {
                            self.aliases.remove(&r.char_id);
                        } else {
                            self.aliases.insert(r.char_id, display);
                        }
                    }
                    // Unresolvable alias targets are dropped, not fatal.
                    Err(d) => self.warnings.push(d),
                }
                Ok(())
            }
            Node::TmpAlias {
                name,
                display,
                span,
            } => {
                match self.resolve(&name, span) {
                    Ok(r) => {
                        if display.is_empty() {
                            for pending in &mut self.pending_tmp {
                                pending.remove(&r.char_id);
                            }
                        } else {
                            for pending in &mut self.pending_tmp {
                                pending.insert(r.char_id.clone(), display.clone());
                            }
                        }
                    }
                    Err(d) => self.warnings.push(d),
                }
                Ok(())
            }
            Node::AliasId {
                short_id,
                name,
                span,
            } => {
                if self.reserved(&short_id) {
                    return Err(Diagnostic::new(
                        DiagnosticKind::DuplicateAlias,
                        format!("@aliasid cannot override reserved/original id: {short_id}"),
                        span,
                    ));
                }
                if let Err(d) = self.resolve(&name, span) {
                    self.warnings.push(d);
                }
                self.short_ids.insert(short_id, name);
                Ok(())
            }
            Node::UnaliasId { short_id, span } => {
                if self.reserved(&short_id) {
                    return Err(Diagnostic::new(
                        DiagnosticKind::DuplicateAlias,
                        format!("@unaliasid cannot target reserved/original id: {short_id}"),
                        span,
                    ));
                }
                if self.short_ids.remove(&short_id).is_none() {
                    return Err(Diagnostic::new(
                        DiagnosticKind::UnknownShortId,
                        format!("@unaliasid id not found: {short_id}"),
                        span,
                    ));
                }
                Ok(())
            }
            Node::CharId {
                short_id,
                display,
                span,
            } => self.handle_charid(short_id, display, span),
            Node::UncharId { short_id, span } => {
                if self.custom_chars.shift_remove(&short_id).is_none() {
                    return Err(Diagnostic::new(
                        DiagnosticKind::UnknownShortId,
                        format!("@uncharid id not found: {short_id}"),
                        span,
                    ));
                }
                self.avatar_overrides.remove(&short_id);
                Ok(())
            }
            Node::AvatarId {
                short_id,
                asset,
                span,
            } => {
                if !self.custom_chars.contains_key(&short_id) {
                    return Err(Diagnostic::new(
                        DiagnosticKind::UnknownShortId,
                        format!("@avatarid requires existing @charid for id: {short_id}"),
                        span,
                    ));
                }
                let asset_ref = self.resolve_avatar_ref(&asset, span)?;
                self.avatar_overrides
                    .insert(short_id.clone(), asset_ref.clone());
                if let Some(custom) = self.custom_chars.get_mut(&short_id) {
                    custom.avatar = Some(asset_ref);
                }
                Ok(())
            }
            Node::UnavatarId { short_id, span } => {
                if self.avatar_overrides.remove(&short_id).is_none() {
                    return Err(Diagnostic::new(
                        DiagnosticKind::UnknownShortId,
                        format!("@unavatarid id not found: {short_id}"),
                        span,
                    ));
                }
                if let Some(custom) = self.custom_chars.get_mut(&short_id) {
                    custom.avatar = None;
                }
                Ok(())
            }
            Node::AvatarOverride { name, asset, span } => {
                let resolved = self.resolve(&name, span)?;
                if resolved.char_id == SENSEI {
                    return Err(Diagnostic::new(
                        DiagnosticKind::MalformedDirective,
                        "@avatar cannot target Sensei",
                        span,
                    ));
                }
                if asset.is_empty() {
                    self.avatar_overrides.remove(&resolved.char_id);
                } else {
                    let asset_ref = self.resolve_avatar_ref(&asset, span)?;
                    self.avatar_overrides.insert(resolved.char_id, asset_ref);
                }
                Ok(())
            }
            Node::PageBreak { span } => {
                self.chat.push(ChatLine::new("PAGEBREAK", span.start_line));
                Ok(())
            }
            Node::Reply { items, span } => {
                let mut line = ChatLine::new("REPLY", span.start_line);
                line.items = Some(
                    items
                        .into_iter()
                        .map(|text| ReplyItem {
                            text,
                            segments: Vec::new(),
                        })
                        .collect(),
                );
                line.label = Some(REPLY_LABEL.to_string());
                self.chat.push(line);
                Ok(())
            }
            Node::Bond { content, span } => {
                let content = if content.trim().is_empty() {
                    match &self.last_speaker {
                        Some(id) => format!("进入{}的羁绊剧情", base_name(&self.display_for(id))),
                        None => "进入羁绊剧情".to_string(),
                    }
                } else {
                    content
                };
                let mut line = ChatLine::new("BOND", span.start_line);
                line.content = Some(content);
                self.chat.push(line);
                Ok(())
            }
            Node::Statement(s) => self.handle_statement(s.kind, s.marker, s.content, s.span, false),
            Node::Block(b) => self.handle_statement(b.kind, b.marker, b.content, b.span, true),
            Node::BlankLine { .. } => {
                if self.typst_mode() {
                    let sep = self.join_sep();
                    self.absorb_continuation("", sep);
                }
                Ok(())
            }
            Node::Continuation { text, .. } => {
                let sep = self.join_sep();
                self.absorb_continuation(&text, sep);
                Ok(())
            }
        }
    }

    fn set_meta(&mut self, key: String, value: String) {
        let v = if key == "typst" {
            match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Value::Bool(true),
                "0" | "false" | "no" | "off" => Value::Bool(false),
                _ => Value::String(value.trim().to_string()),
            }
        } else {
            Value::String(value)
        };
        self.meta.insert(key, v);
    }

    fn handle_usepack(&mut self, pack_id: String, alias: String, span: Span) -> Result<(), Diagnostic> {
        if !self.registry.known_packs().iter().any(|p| *p == pack_id) {
            return Err(Diagnostic::new(
                DiagnosticKind::UnknownPack,
                format!("unknown pack: {pack_id}"),
                span,
            ));
        }
        let taken = self.pack_aliases.contains_key(&alias)
            || self
                .registry
                .default_namespaces()
                .iter()
                .any(|ns| *ns == alias);
        if taken {
            return Err(Diagnostic::new(
                DiagnosticKind::DuplicateAlias,
                format!("pack alias already registered: {alias}"),
                span,
            ));
        }
        self.pack_aliases.insert(alias, pack_id);
        Ok(())
    }

    fn handle_charid(
        &mut self,
        short_id: Option<String>,
        display: String,
        span: Span,
    ) -> Result<(), Diagnostic> {
        let id = match short_id {
            Some(id) => {
                if !is_valid_id_token(&id) {
                    return Err(Diagnostic::new(
                        DiagnosticKind::MalformedDirective,
                        format!("invalid @charid id: {id}"),
                        span,
                    ));
                }
                if self.reserved(&id) {
                    return Err(Diagnostic::new(
                        DiagnosticKind::DuplicateAlias,
                        format!("@charid cannot use reserved/original id: {id}"),
                        span,
                    ));
                }
                id
            }
            None => custom_hash_id(&display),
        };
        self.custom_chars.insert(
            id,
            CustomChar {
                display,
                avatar: None,
            },
        );
        Ok(())
    }

    fn handle_statement(
        &mut self,
        kind: StatementKind,
        marker: Option<Marker>,
        content: String,
        span: Span,
        no_inline: bool,
    ) -> Result<(), Diagnostic> {
        let line_no = span.start_line;

        if kind == StatementKind::Narration {
            let mut line = ChatLine::new("NARRATION", line_no);
            line.content = Some(content);
            line.no_inline = no_inline;
            self.chat.push(line);
            return Ok(());
        }

        let side = match kind {
            StatementKind::Left => Side::Left,
            StatementKind::Right => Side::Right,
            StatementKind::Narration => unreachable!(),
        };

        let mut update_state = true;
        let (char_id, display_guess) = match &marker {
            None => match &self.side_current[side.idx()] {
                Some(id) => (id.clone(), None),
                None if side == Side::Right => {
                    // The right side belongs to Sensei until someone else
                    // takes it explicitly.
                    update_state = false;
                    (SENSEI.to_string(), None)
                }
                None => {
                    return Err(Diagnostic::new(
                        DiagnosticKind::NoCurrentSpeaker,
                        "missing speaker for '>'",
                        span,
                    ));
                }
            },
            Some(Marker::Backref { n, span }) => {
                let hist = &self.side_history[side.idx()];
                if *n == 0 {
                    return Err(Diagnostic::new(
                        DiagnosticKind::BackrefOutOfRange,
                        "backref n must be a positive integer",
                        *span,
                    ));
                }
                match hist.get(*n as usize) {
                    Some(id) => (id.clone(), None),
                    None => {
                        return Err(Diagnostic::new(
                            DiagnosticKind::BackrefOutOfRange,
                            format!("not enough speaker history for _{n}:"),
                            *span,
                        ));
                    }
                }
            }
            Some(Marker::Index { n, span }) => {
                if *n == 0 {
                    return Err(Diagnostic::new(
                        DiagnosticKind::IndexOutOfRange,
                        "index n must be a positive integer",
                        *span,
                    ));
                }
                match self.global_order.get(*n as usize - 1) {
                    Some(id) => (id.clone(), None),
                    None => {
                        return Err(Diagnostic::new(
                            DiagnosticKind::IndexOutOfRange,
                            format!("not enough distinct speakers for ~{n}:"),
                            *span,
                        ));
                    }
                }
            }
            Some(Marker::Explicit { selector, span }) => {
                let resolved = self.resolve(selector, *span)?;
                let display = resolved.display.clone();
                (resolved.char_id, Some(display))
            }
        };

        if update_state {
            self.side_current[side.idx()] = Some(char_id.clone());
            move_to_front(&mut self.side_history[side.idx()], &char_id);
            if !self.global_order.contains(&char_id) {
                self.global_order.push(char_id.clone());
            }
        }

        if let Some(display) = display_guess {
            if !display.is_empty() {
                self.display_names.entry(char_id.clone()).or_insert(display);
            }
        }

        let name_override = if char_id == SENSEI {
            None
        } else {
            let expired = matches!(
                &self.active_tmp[side.idx()],
                Some((active_id, _)) if *active_id != char_id
            );
            if expired {
                self.active_tmp[side.idx()] = None;
            }
            if let Some(v) = self.pending_tmp[side.idx()].remove(&char_id) {
                self.active_tmp[side.idx()] = Some((char_id.clone(), v));
            }
            match &self.active_tmp[side.idx()] {
                Some((active_id, v)) if *active_id == char_id => Some(v.clone()),
                _ => self.aliases.get(&char_id).cloned(),
            }
        };

        let mut line = ChatLine::new("TEXT", line_no);
        line.yuzutalk.name_override = name_override;
        line.char_id = Some(char_id.clone());
        line.side = Some(side.name().to_string());
        line.content = Some(content);
        line.avatar_override = self.avatar_overrides.get(&char_id).cloned();
        line.no_inline = no_inline;
        self.chat.push(line);
        self.last_speaker = Some(char_id);
        Ok(())
    }

    fn absorb_continuation(&mut self, text: &str, sep: &'static str) {
        let Some(last) = self.chat.last_mut() else {
            return;
        };
        if let Some(items) = &mut last.items {
            if let Some(item) = items.last_mut() {
                item.text.push_str(sep);
                item.text.push_str(text);
            }
            return;
        }
        if let Some(content) = &mut last.content {
            content.push_str(sep);
            content.push_str(text);
        }
    }

    fn join_sep(&self) -> &'static str {
        if self.options.join_with_newline {
            "\n"
        } else {
            " "
        }
    }

    fn typst_mode(&self) -> bool {
        self.options.typst_mode
            || self
                .meta
                .get("typst")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    fn resolve(&self, selector: &str, span: Span) -> Result<Resolved, Diagnostic> {
        let ctx = ResolveCtx {
            registry: self.registry,
            pack_aliases: &self.pack_aliases,
            short_ids: &self.short_ids,
            custom_chars: &self.custom_chars,
        };
        resolve_selector(&ctx, selector, span)
    }

    fn reserved(&self, id: &str) -> bool {
        let ctx = ResolveCtx {
            registry: self.registry,
            pack_aliases: &self.pack_aliases,
            short_ids: &self.short_ids,
            custom_chars: &self.custom_chars,
        };
        is_reserved_short_id(&ctx, id)
    }

    fn pack_id_for_namespace(&self, ns: &str) -> Option<String> {
        if let Some(pack_id) = self.pack_aliases.get(ns) {
            return Some(pack_id.clone());
        }
        if self.registry.known_packs().iter().any(|p| p == ns) {
            return Some(ns.to_string());
        }
        None
    }

    /// Turn an `@avatar` / `@avatarid` asset token into a concrete ref.
    /// Accepted, in order: a literal `avatar/…` path, a URL, another
    /// character's selector (borrow their default avatar), and an
    /// `asset:<name>` / bare name into the `@asset.*` table.
    fn resolve_avatar_ref(&self, token: &str, span: Span) -> Result<String, Diagnostic> {
        let s = token.trim();
        if s.starts_with("avatar/") {
            return Ok(s.to_string());
        }
        if is_url_like(s) {
            return Ok(s.to_string());
        }

        let is_asset_prefixed = s
            .get(..6)
            .is_some_and(|p| p.eq_ignore_ascii_case("asset:"));
        if !is_asset_prefixed {
            if let Ok(resolved) = self.resolve(s, span) {
                if let Some(sid) = resolved.char_id.strip_prefix("kivo-") {
                    return Ok(format!("avatar/{sid}.png"));
                }
                if let Some((ns, cid)) = resolved.char_id.split_once('.') {
                    if let Some(pack_id) = self.pack_id_for_namespace(ns) {
                        if let Some(path) = self.registry.default_avatar_path(&pack_id, cid) {
                            return Ok(path);
                        }
                    }
                }
                if let Some(custom) = self.custom_chars.get(&resolved.char_id) {
                    if let Some(avatar) = &custom.avatar {
                        return Ok(avatar.clone());
                    }
                }
            }
        }

        let name = if is_asset_prefixed { s[6..].trim() } else { s };
        let key = format!("asset.{name}");
        match self.meta.get(&key).and_then(Value::as_str) {
            Some(value) => {
                let value = value.trim();
                if !is_url_like(value) && !crate::pack::is_safe_relpath(value) {
                    return Err(Diagnostic::new(
                        DiagnosticKind::InvalidAssetPath,
                        format!("invalid asset path for {name}: {value}"),
                        span,
                    ));
                }
                Ok(value.to_string())
            }
            None => Err(Diagnostic::new(
                DiagnosticKind::UnknownAsset,
                format!("unknown asset: {name}"),
                span,
            )),
        }
    }

    /// Second pass: parse inline segments against the running speaker
    /// context, exactly in chat order.
    fn attach_segments(&mut self) -> Result<(), Diagnostic> {
        let mode = if self.typst_mode() {
            SegmentMode::Typst
        } else {
            SegmentMode::Plain
        };

        let mut chat = mem::take(&mut self.chat);
        let mut current: Option<String> = None;
        let mut text_history: Vec<String> = Vec::new();

        let result = (|| {
            for line in chat.iter_mut() {
                match line.yuzutalk.r#type.as_str() {
                    "PAGEBREAK" => continue,
                    "TEXT" => {
                        if let Some(id) = &line.char_id {
                            current = Some(id.clone());
                            text_history.push(id.clone());
                        }
                    }
                    _ => {}
                }

                if line.no_inline {
                    if let Some(content) = &line.content {
                        line.segments = vec![Segment::text(content.clone())];
                    }
                    continue;
                }

                let line_no = line.line_no;
                if let Some(items) = &mut line.items {
                    for item in items.iter_mut() {
                        item.segments = self.build_segments(
                            &item.text,
                            current.as_deref(),
                            &text_history,
                            line_no,
                            mode,
                        )?;
                    }
                    continue;
                }
                if let Some(content) = &line.content {
                    line.segments = self.build_segments(
                        content,
                        current.as_deref(),
                        &text_history,
                        line_no,
                        mode,
                    )?;
                }
            }
            Ok(())
        })();

        self.chat = chat;
        result
    }

    fn build_segments(
        &self,
        content: &str,
        current_char: Option<&str>,
        text_history: &[String],
        line_no: u32,
        mode: SegmentMode,
    ) -> Result<Vec<Segment>, Diagnostic> {
        let span = Span::on_line(line_no, 1, 1);
        let parsed = parse_inline_segments(content, mode);
        if parsed.is_empty() {
            return Ok(vec![Segment::text(content)]);
        }

        let mut out: Vec<Segment> = Vec::new();
        for seg in parsed {
            match seg {
                InlineSegment::Text(text) => {
                    if !text.is_empty() {
                        out.push(Segment::Text { text });
                    }
                }
                InlineSegment::Expr { query, target, raw } => {
                    let mut q = query.trim().to_string();
                    if let Some(rest) = q.strip_prefix(':') {
                        q = rest.trim_start().to_string();
                    }
                    if q.is_empty() {
                        out.push(Segment::text(raw));
                        continue;
                    }
                    let target = target.trim();

                    if target.is_empty() {
                        // `[{...}]` placeholders stay literal.
                        if q.starts_with('{') && q.ends_with('}') {
                            out.push(Segment::text(raw));
                            continue;
                        }
                        let target_char_id = if is_url_like(&q)
                            || parse_asset_query(&q).is_some()
                            || q.starts_with('#')
                        {
                            None
                        } else {
                            current_char.filter(|c| *c != SENSEI).map(str::to_string)
                        };
                        out.push(Segment::Expr {
                            text: raw,
                            query: q,
                            target_char_id,
                            line_no: Some(line_no),
                        });
                        continue;
                    }

                    let char_id = if let Some(n) = parse_backref_n(target) {
                        if n == 0 {
                            return Err(Diagnostic::new(
                                DiagnosticKind::BackrefOutOfRange,
                                format!("invalid backref target: {target}"),
                                span,
                            ));
                        }
                        let needed = n as usize + 1;
                        if text_history.len() < needed {
                            return Err(Diagnostic::new(
                                DiagnosticKind::BackrefOutOfRange,
                                format!("not enough global speaker history for {target}"),
                                span,
                            ));
                        }
                        text_history[text_history.len() - needed].clone()
                    } else {
                        self.resolve(target, span)?.char_id
                    };
                    if char_id == SENSEI {
                        return Err(Diagnostic::new(
                            DiagnosticKind::UnknownCharacter,
                            "expression target cannot be Sensei",
                            span,
                        ));
                    }
                    out.push(Segment::Expr {
                        text: raw,
                        query: q,
                        target_char_id: Some(char_id),
                        line_no: Some(line_no),
                    });
                }
            }
        }

        if out.is_empty() {
            out.push(Segment::text(content));
        }
        Ok(out)
    }

    fn display_for(&self, char_id: &str) -> String {
        if let Some(display) = self.display_names.get(char_id) {
            return display.clone();
        }
        if let Some(custom) = self.custom_chars.get(char_id) {
            return custom.display.clone();
        }
        if char_id == SENSEI {
            return "Sensei".to_string();
        }
        if let Some(sid) = char_id.strip_prefix("kivo-") {
            return sid.to_string();
        }
        if let Some(rest) = char_id.strip_prefix("custom-") {
            return rest.to_string();
        }
        if let Some((_, cid)) = char_id.split_once('.') {
            return base_name(cid);
        }
        char_id.to_string()
    }

    /// One `[char_id, avatar_ref, display_name]` triple per distinct
    /// non-Sensei speaker, in order of first appearance in `chat`.
    fn build_custom_chars(&self) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for line in &self.chat {
            let Some(char_id) = &line.char_id else {
                continue;
            };
            if char_id == SENSEI || !seen.insert(char_id.as_str()) {
                continue;
            }

            if let Some(custom) = self.custom_chars.get(char_id) {
                out.push((
                    char_id.clone(),
                    custom.avatar.clone().unwrap_or_else(|| "uploaded".to_string()),
                    custom.display.clone(),
                ));
                continue;
            }
            if char_id.starts_with("custom-") || char_id.starts_with("kivo-") {
                let avatar = self
                    .avatar_overrides
                    .get(char_id)
                    .cloned()
                    .unwrap_or_else(|| "uploaded".to_string());
                out.push((char_id.clone(), avatar, base_name(&self.display_for(char_id))));
                continue;
            }
            if let Some((ns, cid)) = char_id.split_once('.') {
                let avatar = self
                    .pack_id_for_namespace(ns)
                    .and_then(|pack_id| self.registry.default_avatar_path(&pack_id, cid))
                    .unwrap_or_else(|| "uploaded".to_string());
                out.push((char_id.clone(), avatar, base_name(&self.display_for(char_id))));
                continue;
            }
            out.push((
                char_id.clone(),
                "uploaded".to_string(),
                self.display_for(char_id),
            ));
        }
        out
    }
}

fn move_to_front(history: &mut Vec<String>, char_id: &str) {
    if let Some(pos) = history.iter().position(|id| id == char_id) {
        if pos == 0 {
            return;
        }
        let id = history.remove(pos);
        history.insert(0, id);
    } else {
        history.insert(0, char_id.to_string());
    }
}
