//! Character pack registry.
//!
//! The compiler only ever sees the read-only [`PackRegistry`] view; loading
//! and validating the on-disk pack layout (`manifest.json`, `char_id.json`,
//! `asset_mapping.json`) is the adapter's job and happens before any compile
//! starts. A loaded [`PackStore`] is immutable, so sharing one snapshot
//! across concurrent compilations is safe.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::Value;

/// Read-only lookup interface required by the compiler.
pub trait PackRegistry {
    fn known_packs(&self) -> Vec<String>;

    /// Namespaces tried, in order, for unqualified selectors. The built-in
    /// pack(s) come first, then `custom`.
    fn default_namespaces(&self) -> Vec<String>;

    /// External alias or canonical id -> canonical char id.
    fn lookup_by_name(&self, pack_id: &str, name: &str) -> Option<String>;

    fn default_avatar_path(&self, pack_id: &str, char_id: &str) -> Option<String>;

    fn expressions_dir(&self, pack_id: &str, char_id: &str) -> Option<String>;

    fn tags_file(&self, pack_id: &str, char_id: &str) -> Option<String>;

    /// EULA / version notices to surface as compile warnings. The core
    /// passes them through; it does not enforce acceptance.
    fn notices(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("missing pack file: {0}")]
    MissingFile(PathBuf),

    #[error("invalid pack data: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackType {
    Base,
    Extension,
}

#[derive(Debug, Clone)]
pub struct PackManifest {
    pub pack_id: String,
    pub name: String,
    pub version: String,
    pub pack_type: PackType,
    pub requires: Vec<String>,
    pub eula_required: bool,
    pub eula_title: String,
    pub eula_url: String,
}

impl PackManifest {
    /// Minimal manifest for packs registered from raw JSON tables.
    pub fn base(pack_id: &str) -> Self {
        PackManifest {
            pack_id: pack_id.to_string(),
            name: String::new(),
            version: String::new(),
            pack_type: PackType::Base,
            requires: Vec::new(),
            eula_required: false,
            eula_title: String::new(),
            eula_url: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CharacterAssets {
    pub avatar: String,
    pub expressions_dir: String,
    pub tags: String,
}

#[derive(Debug, Clone)]
struct PackData {
    manifest: PackManifest,
    /// Mount prefix prepended to asset relpaths, e.g. `/pack-v2/ba`.
    mount: String,
    aliases_to_id: IndexMap<String, String>,
    id_to_assets: IndexMap<String, CharacterAssets>,
}

/// Immutable collection of loaded packs.
#[derive(Debug, Clone, Default)]
pub struct PackStore {
    packs: IndexMap<String, PackData>,
    defaults: Vec<String>,
}

impl PackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the unqualified-selector namespace order. `custom` is
    /// appended automatically when absent.
    pub fn set_default_namespaces(&mut self, namespaces: Vec<String>) {
        self.defaults = namespaces;
    }

    /// Register a pack from its raw JSON tables, without touching the
    /// filesystem. `mount` is the path prefix avatar refs are emitted under.
    pub fn insert_pack_from_json(
        &mut self,
        pack_id: &str,
        mount: &str,
        char_id_json: &str,
        asset_mapping_json: &str,
    ) -> Result<(), PackError> {
        if !is_valid_pack_id(pack_id) {
            return Err(PackError::Invalid(format!("invalid pack_id: {pack_id}")));
        }
        let manifest = PackManifest::base(pack_id);
        let aliases = parse_char_id_json(char_id_json)?;
        let assets = parse_asset_mapping_json(asset_mapping_json, &manifest)?;
        self.insert_pack(manifest, mount.trim_end_matches('/').to_string(), aliases, assets);
        Ok(())
    }

    /// Load a pack directory (`<root>/manifest.json` etc.). `base_root` is
    /// the directory asset refs are made relative to.
    pub fn load_pack_dir(&mut self, pack_root: &Path, base_root: &Path) -> Result<(), PackError> {
        let pack_id = pack_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if !is_valid_pack_id(&pack_id) {
            return Err(PackError::Invalid(format!(
                "invalid pack_id dir name: {pack_id}"
            )));
        }

        let manifest_path = pack_root.join("manifest.json");
        let char_id_path = pack_root.join("char_id.json");
        let mapping_path = pack_root.join("asset_mapping.json");
        for p in [&manifest_path, &char_id_path, &mapping_path] {
            if !p.exists() {
                return Err(PackError::MissingFile(p.clone()));
            }
        }

        let manifest = parse_manifest_json(&fs::read_to_string(&manifest_path)?, &pack_id)?;
        let aliases = parse_char_id_json(&fs::read_to_string(&char_id_path)?)?;
        let assets = parse_asset_mapping_json(&fs::read_to_string(&mapping_path)?, &manifest)?;

        let mount = match pack_root.strip_prefix(base_root) {
            Ok(rel) => format!("/{}", rel.to_string_lossy().replace('\\', "/")),
            Err(_) => format!("/{}", pack_id),
        };
        self.insert_pack(manifest, mount, aliases, assets);
        Ok(())
    }

    fn insert_pack(
        &mut self,
        manifest: PackManifest,
        mount: String,
        mut aliases_to_id: IndexMap<String, String>,
        id_to_assets: IndexMap<String, CharacterAssets>,
    ) {
        // Canonical ids resolve to themselves even without an alias entry.
        for id in id_to_assets.keys() {
            aliases_to_id.entry(id.clone()).or_insert_with(|| id.clone());
        }
        let pack_id = manifest.pack_id.clone();
        let is_base = manifest.pack_type == PackType::Base;
        self.packs.insert(
            pack_id.clone(),
            PackData {
                manifest,
                mount,
                aliases_to_id,
                id_to_assets,
            },
        );
        if is_base && !self.defaults.contains(&pack_id) {
            self.defaults.push(pack_id);
        }
    }

    pub fn manifest(&self, pack_id: &str) -> Option<&PackManifest> {
        self.packs.get(pack_id).map(|p| &p.manifest)
    }
}

impl PackRegistry for PackStore {
    fn known_packs(&self) -> Vec<String> {
        self.packs.keys().cloned().collect()
    }

    fn default_namespaces(&self) -> Vec<String> {
        let mut out = self.defaults.clone();
        if !out.iter().any(|ns| ns == "custom") {
            out.push("custom".to_string());
        }
        out
    }

    fn lookup_by_name(&self, pack_id: &str, name: &str) -> Option<String> {
        let pack = self.packs.get(pack_id)?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        pack.aliases_to_id.get(name).cloned()
    }

    fn default_avatar_path(&self, pack_id: &str, char_id: &str) -> Option<String> {
        let pack = self.packs.get(pack_id)?;
        let assets = pack.id_to_assets.get(char_id)?;
        if assets.avatar.is_empty() {
            return None;
        }
        Some(format!("{}/{}", pack.mount, assets.avatar))
    }

    fn expressions_dir(&self, pack_id: &str, char_id: &str) -> Option<String> {
        let pack = self.packs.get(pack_id)?;
        let assets = pack.id_to_assets.get(char_id)?;
        if assets.expressions_dir.is_empty() {
            return None;
        }
        Some(format!("{}/{}", pack.mount, assets.expressions_dir))
    }

    fn tags_file(&self, pack_id: &str, char_id: &str) -> Option<String> {
        let pack = self.packs.get(pack_id)?;
        let assets = pack.id_to_assets.get(char_id)?;
        if assets.expressions_dir.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            pack.mount, assets.expressions_dir, assets.tags
        ))
    }

    fn notices(&self) -> Vec<String> {
        let mut out = Vec::new();
        for pack in self.packs.values() {
            if pack.manifest.eula_required {
                let title = if pack.manifest.eula_title.is_empty() {
                    pack.manifest.pack_id.clone()
                } else {
                    pack.manifest.eula_title.clone()
                };
                out.push(format!(
                    "pack {} requires EULA acceptance: {}",
                    pack.manifest.pack_id, title
                ));
            }
        }
        out
    }
}

fn is_valid_pack_id(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reject anything that could escape the pack root.
pub fn is_safe_relpath(s: &str) -> bool {
    let ss = s.trim().replace('\\', "/");
    if ss.is_empty() || ss.contains("://") || ss.starts_with("//") {
        return false;
    }
    let mut bytes = ss.bytes();
    if let (Some(first), Some(b':')) = (bytes.next(), bytes.next()) {
        if first.is_ascii_alphabetic() {
            return false;
        }
    }
    let parts: Vec<&str> = ss.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    !parts.is_empty() && !parts.iter().any(|p| *p == "..")
}

fn parse_manifest_json(text: &str, pack_id: &str) -> Result<PackManifest, PackError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value
        .as_object()
        .ok_or_else(|| PackError::Invalid("manifest.json must be an object".to_string()))?;

    let declared = obj.get("pack_id").and_then(|v| v.as_str()).unwrap_or("");
    if !declared.is_empty() && declared != pack_id {
        return Err(PackError::Invalid(format!(
            "manifest.pack_id mismatch: {declared} != {pack_id}"
        )));
    }

    let pack_type = match obj.get("type").and_then(|v| v.as_str()).unwrap_or("base") {
        "extension" => PackType::Extension,
        _ => PackType::Base,
    };
    let requires = obj
        .get("requires")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    let eula = obj.get("eula").and_then(|v| v.as_object());

    Ok(PackManifest {
        pack_id: pack_id.to_string(),
        name: obj
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string(),
        version: obj
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string(),
        pack_type,
        requires,
        eula_required: eula
            .and_then(|e| e.get("required"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        eula_title: eula
            .and_then(|e| e.get("title"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string(),
        eula_url: eula
            .and_then(|e| e.get("url"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string(),
    })
}

fn parse_char_id_json(text: &str) -> Result<IndexMap<String, String>, PackError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value
        .as_object()
        .ok_or_else(|| PackError::Invalid("char_id.json must be an object".to_string()))?;
    let mut out = IndexMap::new();
    for (k, v) in obj {
        if let Some(id) = v.as_str() {
            let kk = k.trim();
            let vv = id.trim();
            if !kk.is_empty() && !vv.is_empty() {
                out.insert(kk.to_string(), vv.to_string());
            }
        }
    }
    Ok(out)
}

fn parse_asset_mapping_json(
    text: &str,
    manifest: &PackManifest,
) -> Result<IndexMap<String, CharacterAssets>, PackError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value
        .as_object()
        .ok_or_else(|| PackError::Invalid("asset_mapping.json must be an object".to_string()))?;

    let mut out = IndexMap::new();
    for (char_id, entry) in obj {
        let cid = char_id.trim();
        let Some(map) = entry.as_object() else {
            continue;
        };
        if cid.is_empty() {
            continue;
        }
        let avatar = map
            .get("avatar")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let expr_dir = map
            .get("expressions_dir")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let tags = map
            .get("tags")
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("tags.json")
            .to_string();

        if avatar.is_empty() {
            // Extension packs may inherit avatars from their base pack.
            if manifest.pack_type != PackType::Extension {
                return Err(PackError::Invalid(format!(
                    "missing avatar path for {cid} in base pack"
                )));
            }
        } else if !is_safe_relpath(&avatar) {
            return Err(PackError::Invalid(format!(
                "invalid avatar path for {cid}: {avatar}"
            )));
        }
        if !expr_dir.is_empty() && !is_safe_relpath(&expr_dir) {
            return Err(PackError::Invalid(format!(
                "invalid expressions_dir for {cid}: {expr_dir}"
            )));
        }
        if tags.contains('/') || tags.contains('\\') || tags.contains("..") {
            return Err(PackError::Invalid(format!(
                "invalid tags file name for {cid}: {tags}"
            )));
        }
        out.insert(
            cid.to_string(),
            CharacterAssets {
                avatar,
                expressions_dir: expr_dir,
                tags,
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> PackStore {
        let mut store = PackStore::new();
        store
            .insert_pack_from_json(
                "ba",
                "/pack-v2/ba",
                r#"{"星野": "星野", "白子": "白子", "小白": "白子"}"#,
                r#"{
                    "星野": {"avatar": "avatar/hoshino.png", "expressions_dir": "expr/hoshino"},
                    "白子": {"avatar": "avatar/shiroko.png", "expressions_dir": "expr/shiroko"}
                }"#,
            )
            .unwrap();
        store
    }

    #[test]
    fn lookup_resolves_aliases_and_self_ids() {
        let store = sample_store();
        assert_eq!(
            store.lookup_by_name("ba", "小白"),
            Some("白子".to_string())
        );
        assert_eq!(
            store.lookup_by_name("ba", "星野"),
            Some("星野".to_string())
        );
        assert_eq!(store.lookup_by_name("ba", "未知"), None);
        assert_eq!(store.lookup_by_name("nope", "星野"), None);
    }

    #[test]
    fn asset_paths_use_mount_prefix() {
        let store = sample_store();
        assert_eq!(
            store.default_avatar_path("ba", "星野").as_deref(),
            Some("/pack-v2/ba/avatar/hoshino.png")
        );
        assert_eq!(
            store.tags_file("ba", "白子").as_deref(),
            Some("/pack-v2/ba/expr/shiroko/tags.json")
        );
    }

    #[test]
    fn default_namespaces_end_with_custom() {
        let store = sample_store();
        assert_eq!(store.default_namespaces(), vec!["ba", "custom"]);
    }

    #[test]
    fn unsafe_relpaths_rejected() {
        assert!(is_safe_relpath("avatar/a.png"));
        assert!(!is_safe_relpath("../escape.png"));
        assert!(!is_safe_relpath("a/../../b.png"));
        assert!(!is_safe_relpath("https://x/y.png"));
        assert!(!is_safe_relpath("C:stuff/y.png"));
        assert!(!is_safe_relpath(""));

        let mut store = PackStore::new();
        let err = store
            .insert_pack_from_json(
                "ba",
                "/p",
                "{}",
                r#"{"x": {"avatar": "../up.png", "expressions_dir": "e"}}"#,
            )
            .unwrap_err();
        assert!(matches!(err, PackError::Invalid(_)));
    }

    #[test]
    fn base_pack_requires_avatar() {
        let mut store = PackStore::new();
        let err = store
            .insert_pack_from_json("ba", "/p", "{}", r#"{"x": {"expressions_dir": "e"}}"#)
            .unwrap_err();
        assert!(matches!(err, PackError::Invalid(_)));
    }
}
