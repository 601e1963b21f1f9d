//! Selector -> canonical char_id resolution.
//!
//! A selector is whatever the author wrote before a `:` or inside a
//! directive: `星野`, `ba.星野`, `custom.yz`, `kivo-288`, `__Sensei`, a skin
//! variant like `星野(一年级)`, or a short id registered via `@aliasid`.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::diag::{Diagnostic, DiagnosticKind};
use crate::pack::PackRegistry;
use crate::span::Span;

/// A custom (non-pack) character declared with `@charid`.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomChar {
    pub display: String,
    pub avatar: Option<String>,
}

/// Borrowed view of the compiler tables that resolution needs.
pub struct ResolveCtx<'a> {
    pub registry: &'a dyn PackRegistry,
    /// `@usepack` alias -> pack_id, in declaration order.
    pub pack_aliases: &'a IndexMap<String, String>,
    /// `@aliasid` short id -> character name.
    pub short_ids: &'a HashMap<String, String>,
    /// `@charid` id -> declared character.
    pub custom_chars: &'a IndexMap<String, CustomChar>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub char_id: String,
    /// Author-facing name guess, used for `custom_chars` and bond text.
    pub display: String,
}

impl<'a> ResolveCtx<'a> {
    /// Map a namespace token to the pack it addresses, if any.
    fn pack_for_namespace(&self, ns: &str) -> Option<String> {
        if let Some(pack_id) = self.pack_aliases.get(ns) {
            return Some(pack_id.clone());
        }
        if self.registry.known_packs().iter().any(|p| p == ns) {
            return Some(ns.to_string());
        }
        None
    }

    /// Namespaces tried for unqualified selectors: registry defaults first,
    /// then `@usepack` aliases in declaration order.
    fn namespace_order(&self) -> Vec<String> {
        let mut order = self.registry.default_namespaces();
        for alias in self.pack_aliases.keys() {
            if !order.iter().any(|ns| ns == alias) {
                order.push(alias.clone());
            }
        }
        order
    }
}

pub fn resolve_selector(
    ctx: &ResolveCtx<'_>,
    selector: &str,
    span: Span,
) -> Result<Resolved, Diagnostic> {
    let mut s = selector.trim();
    if s.is_empty() {
        return Err(Diagnostic::new(
            DiagnosticKind::UnknownCharacter,
            "empty selector",
            span,
        ));
    }

    // Short-id substitution, one level only.
    if let Some(name) = ctx.short_ids.get(s) {
        s = name.as_str();
    }

    if s == "__Sensei" {
        return Ok(Resolved {
            char_id: "__Sensei".to_string(),
            display: "Sensei".to_string(),
        });
    }
    if let Some(rest) = s.strip_prefix("kivo-") {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Resolved {
                char_id: s.to_string(),
                display: rest.to_string(),
            });
        }
    }
    if let Some(rest) = s.strip_prefix("custom-") {
        if !rest.is_empty() {
            let display = ctx
                .custom_chars
                .get(s)
                .map(|c| c.display.clone())
                .unwrap_or_else(|| rest.to_string());
            return Ok(Resolved {
                char_id: s.to_string(),
                display,
            });
        }
    }

    if let Some((ns, rest)) = split_namespace(s) {
        if ns == "custom" {
            if let Some(resolved) = lookup_custom(ctx, rest) {
                return Ok(resolved);
            }
            return Err(Diagnostic::new(
                DiagnosticKind::UnknownCharacter,
                format!("unknown custom character: {rest}"),
                span,
            ));
        }
        if let Some(pack_id) = ctx.pack_for_namespace(ns) {
            if let Some(cid) = ctx.registry.lookup_by_name(&pack_id, rest) {
                return Ok(Resolved {
                    char_id: format!("{ns}.{cid}"),
                    display: base_name(&cid),
                });
            }
            return Err(Diagnostic::new(
                DiagnosticKind::UnknownCharacter,
                format!("unknown {ns} character: {rest}"),
                span,
            ));
        }
        return Err(Diagnostic::new(
            DiagnosticKind::UnknownCharacter,
            format!("unknown namespace: {ns}"),
            span,
        ));
    }

    for ns in ctx.namespace_order() {
        if ns == "custom" {
            if let Some(resolved) = lookup_custom(ctx, s) {
                return Ok(resolved);
            }
            continue;
        }
        let Some(pack_id) = ctx.pack_for_namespace(&ns) else {
            continue;
        };
        if let Some(cid) = ctx.registry.lookup_by_name(&pack_id, s) {
            return Ok(Resolved {
                char_id: format!("{ns}.{cid}"),
                display: base_name(&cid),
            });
        }
    }

    Err(Diagnostic::new(
        DiagnosticKind::UnknownCharacter,
        format!("unknown speaker: {s}"),
        span,
    ))
}

/// Custom characters are addressed by declared id, or by display name when
/// the id was derived by hash. First declaration wins.
fn lookup_custom(ctx: &ResolveCtx<'_>, token: &str) -> Option<Resolved> {
    if let Some(custom) = ctx.custom_chars.get(token) {
        return Some(Resolved {
            char_id: token.to_string(),
            display: custom.display.clone(),
        });
    }
    for (id, custom) in ctx.custom_chars.iter() {
        if custom.display == token {
            return Some(Resolved {
                char_id: id.clone(),
                display: custom.display.clone(),
            });
        }
    }
    None
}

/// `@aliasid` / `@charid` must not shadow a name that is already meaningful.
pub fn is_reserved_short_id(ctx: &ResolveCtx<'_>, id: &str) -> bool {
    let s = id.trim();
    if s.is_empty() || s == "__Sensei" {
        return true;
    }
    if s.starts_with("kivo-") || s.starts_with("custom-") {
        return true;
    }
    // Namespaced tokens are original ids, not overridable.
    if s.contains('.') {
        return true;
    }
    if ctx.custom_chars.contains_key(s) {
        return true;
    }
    for ns in ctx.namespace_order() {
        if ns == "custom" {
            continue;
        }
        if let Some(pack_id) = ctx.pack_for_namespace(&ns) {
            if ctx.registry.lookup_by_name(&pack_id, s).is_some() {
                return true;
            }
        }
    }
    false
}

/// Split `ns.rest` at the first dot. Returns `None` when either half is
/// empty, in which case the selector is treated as unqualified.
pub fn split_namespace(s: &str) -> Option<(&str, &str)> {
    let (ns, rest) = s.split_once('.')?;
    let ns = ns.trim();
    let rest = rest.trim();
    if ns.is_empty() || rest.is_empty() {
        return None;
    }
    Some((ns, rest))
}

/// Strip a skin suffix: `星野(一年级)` -> `星野`. Handles both ASCII and
/// full-width parentheses.
pub fn base_name(name: &str) -> String {
    let name = name.trim();
    for sep in ['(', '（'] {
        if let Some(idx) = name.find(sep) {
            return name[..idx].trim().to_string();
        }
    }
    name.to_string()
}

/// Identifier shape for `@charid` / `@aliasid` ids: word char, then word
/// chars or dashes. Unicode letters count as word chars.
pub fn is_valid_id_token(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Deterministic id for custom characters declared without an explicit
/// short id. FNV-1a over the UTF-8 display name, hex-encoded.
pub fn custom_hash_id(display: &str) -> String {
    format!("custom-{:016x}", fnv1a64(display.as_bytes()))
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackStore;

    fn store() -> PackStore {
        let mut store = PackStore::new();
        store
            .insert_pack_from_json(
                "ba",
                "/pack-v2/ba",
                r#"{"星野": "星野", "星野(一年级)": "星野(一年级)"}"#,
                r#"{
                    "星野": {"avatar": "avatar/a.png", "expressions_dir": "e/a"},
                    "星野(一年级)": {"avatar": "avatar/b.png", "expressions_dir": "e/b"}
                }"#,
            )
            .unwrap();
        store
    }

    fn resolve_with(
        store: &PackStore,
        custom: &IndexMap<String, CustomChar>,
        selector: &str,
    ) -> Result<Resolved, Diagnostic> {
        let pack_aliases = IndexMap::new();
        let short_ids = HashMap::new();
        let ctx = ResolveCtx {
            registry: store,
            pack_aliases: &pack_aliases,
            short_ids: &short_ids,
            custom_chars: custom,
        };
        resolve_selector(&ctx, selector, Span::on_line(1, 1, 2))
    }

    #[test]
    fn bare_name_resolves_through_default_pack() {
        let store = store();
        let r = resolve_with(&store, &IndexMap::new(), "星野").unwrap();
        assert_eq!(r.char_id, "ba.星野");
        assert_eq!(r.display, "星野");
    }

    #[test]
    fn skin_variant_is_a_distinct_char_id() {
        let store = store();
        let r = resolve_with(&store, &IndexMap::new(), "星野(一年级)").unwrap();
        assert_eq!(r.char_id, "ba.星野(一年级)");
        assert_eq!(r.display, "星野");
    }

    #[test]
    fn custom_wins_only_after_packs() {
        let store = store();
        let mut custom = IndexMap::new();
        custom.insert(
            "星野".to_string(),
            CustomChar {
                display: "假星野".to_string(),
                avatar: None,
            },
        );
        // Pack-first order: the pack hit shadows the custom declaration.
        let r = resolve_with(&store, &custom, "星野").unwrap();
        assert_eq!(r.char_id, "ba.星野");
        // The explicit namespace still reaches the custom character.
        let r = resolve_with(&store, &custom, "custom.星野").unwrap();
        assert_eq!(r.char_id, "星野");
        assert_eq!(r.display, "假星野");
    }

    #[test]
    fn passthrough_ids() {
        let store = store();
        assert_eq!(
            resolve_with(&store, &IndexMap::new(), "kivo-288")
                .unwrap()
                .char_id,
            "kivo-288"
        );
        assert_eq!(
            resolve_with(&store, &IndexMap::new(), "__Sensei")
                .unwrap()
                .display,
            "Sensei"
        );
    }

    #[test]
    fn unknown_is_an_error() {
        let store = store();
        let err = resolve_with(&store, &IndexMap::new(), "不存在").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::UnknownCharacter);
        let err = resolve_with(&store, &IndexMap::new(), "nope.星野").unwrap_err();
        assert_eq!(err.kind, DiagnosticKind::UnknownCharacter);
    }

    #[test]
    fn hash_id_is_stable() {
        assert_eq!(custom_hash_id("柚子"), custom_hash_id("柚子"));
        assert_ne!(custom_hash_id("柚子"), custom_hash_id("柚子2"));
        assert!(custom_hash_id("柚子").starts_with("custom-"));
        assert_eq!(custom_hash_id("柚子").len(), "custom-".len() + 16);
    }

    #[test]
    fn id_token_shape() {
        assert!(is_valid_id_token("yz"));
        assert!(is_valid_id_token("柚子"));
        assert!(is_valid_id_token("a-b_c"));
        assert!(!is_valid_id_token("-a"));
        assert!(!is_valid_id_token("a b"));
        assert!(!is_valid_id_token(""));
    }

    #[test]
    fn base_name_strips_both_paren_kinds() {
        assert_eq!(base_name("星野(一年级)"), "星野");
        assert_eq!(base_name("星野（临战）"), "星野");
        assert_eq!(base_name(" 星野 "), "星野");
    }
}
