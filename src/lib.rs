//! MomoScript front end.
//!
//! Two-stage pipeline: [`parser::parse`] classifies the line-oriented source
//! into a span-annotated node list, and [`compiler::Compiler`] folds that
//! list into the JSON-shaped IR consumed by the typesetting template.
//! Inline `expr` segments are emitted unresolved; a downstream pass maps
//! them to concrete images.

#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod ast;
pub mod compiler;
pub mod diag;
pub mod pack;
pub mod parser;
pub mod resolve;
pub mod segment;
pub mod span;
pub mod types;

pub use compiler::{CompileOptions, CompileOutput, Compiler};
pub use diag::{Diagnostic, DiagnosticKind};
pub use pack::{PackRegistry, PackStore};
pub use span::Span;
pub use types::ScriptIr;

/// Parse and compile in one call.
///
/// The compiler refuses to run on a parse that reported any error; the parse
/// diagnostics come back verbatim in that case. A fatal compile error is
/// returned as a single-element list.
pub fn compile_text(
    source: &str,
    registry: &dyn PackRegistry,
    options: CompileOptions,
) -> Result<CompileOutput, Vec<Diagnostic>> {
    let (nodes, diags) = parser::parse(source);
    if !diags.is_empty() {
        return Err(diags);
    }
    Compiler::new(registry, options)
        .compile(nodes)
        .map_err(|d| vec![d])
}

#[cfg(any(feature = "python", target_arch = "wasm32"))]
fn compile_to_json(
    source: &str,
    registry: &dyn PackRegistry,
    options: CompileOptions,
) -> Result<String, String> {
    match compile_text(source, registry, options) {
        Ok(output) => serde_json::to_string_pretty(&output.ir).map_err(|e| e.to_string()),
        Err(diags) => Err(diags
            .iter()
            .map(Diagnostic::to_string)
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

#[cfg(feature = "python")]
#[pyfunction]
#[pyo3(name = "compile_text")]
fn compile_text_py(text: String) -> PyResult<String> {
    let store = PackStore::new();
    compile_to_json(&text, &store, CompileOptions::default())
        .map_err(PyErr::new::<pyo3::exceptions::PyRuntimeError, _>)
}

#[cfg(feature = "python")]
#[pymodule]
fn momoscript(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compile_text_py, m)?)?;
    Ok(())
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn compile_text_wasm(text: &str) -> Result<String, JsValue> {
    let store = PackStore::new();
    compile_to_json(text, &store, CompileOptions::default())
        .map_err(|e| JsValue::from_str(&e))
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn compile_text_with_options_wasm(
    text: &str,
    typst_mode: bool,
    join_with_newline: bool,
) -> Result<String, JsValue> {
    let store = PackStore::new();
    let options = CompileOptions {
        typst_mode,
        join_with_newline,
    };
    compile_to_json(text, &store, options).map_err(|e| JsValue::from_str(&e))
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn compile_text_with_pack_wasm(
    text: &str,
    pack_id: &str,
    mount: &str,
    char_id_json: &str,
    asset_mapping_json: &str,
) -> Result<String, JsValue> {
    let mut store = PackStore::new();
    store
        .insert_pack_from_json(pack_id, mount, char_id_json, asset_mapping_json)
        .map_err(|e| JsValue::from_str(&e.to_string()))?;
    compile_to_json(text, &store, CompileOptions::default())
        .map_err(|e| JsValue::from_str(&e))
}
