use std::fmt;

use serde::Serialize;

use crate::span::Span;

/// The closed set of diagnostic kinds the front end can report.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum DiagnosticKind {
    // Syntax
    ContinuationBeforeStatement,
    UnclosedBlock,
    MalformedDirective,
    EmptyReply,
    NestedDirective,
    BadMarkerOnPagebreak,
    HeaderKeyAfterBody,
    UnknownDirective,
    // Names
    UnknownPack,
    DuplicateAlias,
    UnknownCharacter,
    UnknownShortId,
    BackrefOutOfRange,
    IndexOutOfRange,
    NoCurrentSpeaker,
    // Assets
    UnknownAsset,
    InvalidAssetPath,
    // Must never fire on valid input.
    Invariant,
}

/// Coarse grouping used when rendering diagnostics for users.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Category {
    Syntax,
    Name,
    Asset,
    Invariant,
}

impl DiagnosticKind {
    pub fn category(self) -> Category {
        use DiagnosticKind::*;
        match self {
            ContinuationBeforeStatement | UnclosedBlock | MalformedDirective | EmptyReply
            | NestedDirective | BadMarkerOnPagebreak | HeaderKeyAfterBody | UnknownDirective => {
                Category::Syntax
            }
            UnknownPack | DuplicateAlias | UnknownCharacter | UnknownShortId
            | BackrefOutOfRange | IndexOutOfRange | NoCurrentSpeaker => Category::Name,
            UnknownAsset | InvalidAssetPath => Category::Asset,
            Invariant => Category::Invariant,
        }
    }
}

/// Secondary location attached to a diagnostic, e.g. the opener of an
/// unclosed block.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct Note {
    pub message: String,
    pub span: Span,
}

/// An authoring error or warning. Diagnostics are plain data; the core never
/// formats terminal output or writes to stderr.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Span,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, message: impl Into<String>, span: Span) -> Self {
        self.notes.push(Note {
            message: message.into(),
            span,
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}:{}: {}",
            self.span.start_line, self.span.start_col, self.message
        )
    }
}
