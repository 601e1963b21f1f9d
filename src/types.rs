use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compiled output consumed by the typesetting template.
///
/// Field order is part of the contract: `meta`, `typst_global`,
/// `typst_assets_global`, `custom_chars`, `chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptIr {
    pub meta: IndexMap<String, Value>,
    pub typst_global: String,
    /// Filled by the asset-materializing post-pass; the front end always
    /// emits it empty.
    pub typst_assets_global: String,
    /// `[char_id, avatar_ref, display_name]` for every non-Sensei speaker,
    /// in order of first appearance.
    pub custom_chars: Vec<(String, String, String)>,
    pub chat: Vec<ChatLine>,
}

/// One entry of `chat`. The discriminator lives in `yuzutalk.type`; the
/// other fields are populated per type and omitted otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatLine {
    pub yuzutalk: YuzuTalk,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ReplyItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_override: Option<String>,
    pub line_no: u32,
    /// Quote-block content is kept verbatim; inline expressions are not
    /// recognized inside it.
    #[serde(skip)]
    pub(crate) no_inline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YuzuTalk {
    #[serde(rename = "avatarState")]
    pub avatar_state: String,
    #[serde(rename = "nameOverride")]
    pub name_override: Option<String>,
    pub r#type: String,
}

impl ChatLine {
    pub(crate) fn new(kind: &str, line_no: u32) -> Self {
        ChatLine {
            yuzutalk: YuzuTalk {
                avatar_state: "AUTO".to_string(),
                name_override: None,
                r#type: kind.to_string(),
            },
            char_id: None,
            side: None,
            content: None,
            items: None,
            label: None,
            segments: Vec::new(),
            avatar_override: None,
            line_no,
            no_inline: false,
        }
    }
}

/// One option of a reply menu.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyItem {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub segments: Vec<Segment>,
}

/// A run of parsed bubble content. `expr` segments are placeholders for the
/// expression resolver, which may rewrite them to `image` segments but must
/// not reorder the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Segment {
    Text {
        text: String,
    },
    Expr {
        /// Raw source slice, escapes unfolded.
        text: String,
        query: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_char_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line_no: Option<u32>,
    },
    Image {
        #[serde(rename = "ref")]
        ref_: String,
        alt: String,
    },
}

impl Segment {
    pub fn text(t: impl Into<String>) -> Self {
        Segment::Text { text: t.into() }
    }
}
