//! Filesystem pack loading: manifest validation, EULA pass-through, and
//! extension packs layered over a base pack.

use std::fs;
use std::path::{Path, PathBuf};

use momoscript::pack::{PackError, PackType};
use momoscript::{compile_text, CompileOptions, PackRegistry, PackStore};

fn write_pack(root: &Path, manifest: &str, char_id: &str, asset_mapping: &str) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join("manifest.json"), manifest).unwrap();
    fs::write(root.join("char_id.json"), char_id).unwrap();
    fs::write(root.join("asset_mapping.json"), asset_mapping).unwrap();
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("momoscript-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn load_sample_packs(base: &Path) -> PackStore {
    write_pack(
        &base.join("ba"),
        r#"{
            "pack_id": "ba",
            "name": "基础角色包",
            "version": "2.1.0",
            "type": "base",
            "eula": {"required": true, "title": "角色包使用协议", "url": "https://example/eula"}
        }"#,
        r#"{"星野": "星野", "小星": "星野"}"#,
        r#"{"星野": {"avatar": "avatar/hoshino.png", "expressions_dir": "e/hoshino"}}"#,
    );
    write_pack(
        &base.join("fanart"),
        r#"{
            "pack_id": "fanart",
            "version": "0.3.0",
            "type": "extension",
            "requires": ["ba"]
        }"#,
        r#"{"星野": "星野改"}"#,
        r#"{"星野改": {"avatar": "", "expressions_dir": "e/hoshino-alt"}}"#,
    );

    let mut store = PackStore::new();
    store.load_pack_dir(&base.join("ba"), base).unwrap();
    store.load_pack_dir(&base.join("fanart"), base).unwrap();
    store
}

#[test]
fn loads_pack_directories() {
    let base = scratch_dir("packs");
    let store = load_sample_packs(&base);

    assert_eq!(store.known_packs(), vec!["ba", "fanart"]);

    let ba = store.manifest("ba").unwrap();
    assert_eq!(ba.name, "基础角色包");
    assert_eq!(ba.version, "2.1.0");
    assert!(ba.eula_required);
    assert_eq!(ba.eula_url, "https://example/eula");

    let fanart = store.manifest("fanart").unwrap();
    assert_eq!(fanart.pack_type, PackType::Extension);
    assert_eq!(fanart.requires, vec!["ba"]);

    // Only base packs join the default namespace order as they load.
    assert_eq!(store.default_namespaces(), vec!["ba", "custom"]);

    // Asset paths mount under the pack's directory relative to the base root.
    assert_eq!(
        store.default_avatar_path("ba", "星野").as_deref(),
        Some("/ba/avatar/hoshino.png")
    );
    assert_eq!(
        store.tags_file("ba", "星野").as_deref(),
        Some("/ba/e/hoshino/tags.json")
    );

    // The extension pack resolves its characters but inherits the avatar
    // from its base pack, so it reports none of its own.
    assert_eq!(
        store.lookup_by_name("fanart", "星野"),
        Some("星野改".to_string())
    );
    assert_eq!(store.default_avatar_path("fanart", "星野改"), None);

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn eula_notices_pass_through_compilation() {
    let base = scratch_dir("eula");
    let store = load_sample_packs(&base);

    let out = compile_text("> 小星: 早\n", &store, CompileOptions::default()).unwrap();
    assert_eq!(out.notices.len(), 1);
    assert!(out.notices[0].contains("角色包使用协议"));

    // char_id.json aliases resolve through the dir-loaded tables.
    assert_eq!(out.ir.chat[0].char_id.as_deref(), Some("ba.星野"));
    assert_eq!(
        out.ir.custom_chars,
        vec![(
            "ba.星野".to_string(),
            "/ba/avatar/hoshino.png".to_string(),
            "星野".to_string()
        )]
    );

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn default_namespace_order_can_be_rearranged() {
    let base = scratch_dir("defaults");
    let mut store = load_sample_packs(&base);

    store.set_default_namespaces(vec!["fanart".to_string(), "ba".to_string()]);
    assert_eq!(store.default_namespaces(), vec!["fanart", "ba", "custom"]);

    // Both packs know 星野; the reordered defaults make the extension win
    // bare-name resolution, and its inherited avatar falls back to
    // "uploaded" in the character table.
    let out = compile_text("> 星野: 嗨\n", &store, CompileOptions::default()).unwrap();
    assert_eq!(out.ir.chat[0].char_id.as_deref(), Some("fanart.星野改"));
    assert_eq!(
        out.ir.custom_chars,
        vec![(
            "fanart.星野改".to_string(),
            "uploaded".to_string(),
            "星野改".to_string()
        )]
    );

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn manifest_pack_id_mismatch_is_rejected() {
    let base = scratch_dir("mismatch");
    write_pack(
        &base.join("ba"),
        r#"{"pack_id": "other", "type": "base"}"#,
        "{}",
        "{}",
    );

    let mut store = PackStore::new();
    let err = store.load_pack_dir(&base.join("ba"), &base).unwrap_err();
    assert!(matches!(err, PackError::Invalid(_)));

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn missing_pack_files_are_reported() {
    let base = scratch_dir("missing");
    let root = base.join("ba");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("manifest.json"), r#"{"pack_id": "ba"}"#).unwrap();

    let mut store = PackStore::new();
    let err = store.load_pack_dir(&root, &base).unwrap_err();
    assert!(matches!(err, PackError::MissingFile(_)));

    let _ = fs::remove_dir_all(&base);
}
