//! Request handler registry.
//!
//! [`dispatch`] maps a method name to its admission policy (see the request
//! table) and a handler body. Handler bodies run on the worker against an
//! immutable document snapshot; they return a result value or an
//! [`RpcError`], never touch the store, and never block.

use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use qed_core::{Document, OutlineKind, Position, PpFormat, Prover};

use crate::protocol::RpcError;
use crate::requests::Scope;

/// Everything a handler body may look at.
pub struct HandlerCx<'a, P: Prover> {
    pub prover: &'a P,
    pub doc: &'a Document<P>,
    pub params: &'a Value,
}

pub type HandlerFn<P> = fn(&HandlerCx<'_, P>) -> Result<Value, RpcError>;

/// What the registry decided for one request.
pub enum Dispatch<P: Prover> {
    /// Answer at once, without consulting the request table.
    Immediate(Result<Value, RpcError>),
    /// Hand to the request table for admission.
    Data(Descriptor<P>),
}

/// A request bound for the request table.
pub struct Descriptor<P: Prover> {
    pub uri: Url,
    pub scope: Scope,
    pub handler: HandlerFn<P>,
    pub params: Value,
}

#[derive(Debug, Deserialize)]
struct TextDocumentId {
    uri: Url,
    version: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionParams {
    text_document: TextDocumentId,
    position: Position,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentParams {
    text_document: TextDocumentId,
}

#[derive(Debug, Deserialize)]
struct GoalsExtra {
    #[serde(default)]
    pp_format: PpFormat,
}

/// The method → handler mapping for every request the server implements.
/// `initialize` and `shutdown` are lifecycle, handled by the message loop
/// before the registry is consulted.
pub fn dispatch<P: Prover>(method: &str, params: &Value) -> Dispatch<P> {
    match method {
        "textDocument/hover" => position_request(params, false, hover),
        "textDocument/completion" => position_request(params, true, completion),
        "textDocument/definition" => position_request(params, true, definition),
        "proof/goals" => position_request(params, true, goals),
        "textDocument/documentSymbol" => document_request(params, document_symbol),
        "textDocument/codeLens" => document_request(params, code_lens),
        "coq/getDocument" => document_request(params, get_document),
        "coq/saveVo" => document_request(params, save_vo),
        other => Dispatch::Immediate(Err(RpcError::method_not_found(other))),
    }
}

fn position_request<P: Prover>(
    params: &Value,
    postpone: bool,
    handler: HandlerFn<P>,
) -> Dispatch<P> {
    let parsed: PositionParams = match serde_json::from_value(params.clone()) {
        Ok(parsed) => parsed,
        Err(err) => {
            return Dispatch::Immediate(Err(RpcError::invalid_params(format!(
                "position request: {err}"
            ))))
        }
    };
    Dispatch::Data(Descriptor {
        uri: parsed.text_document.uri,
        scope: Scope::Position {
            point: parsed.position,
            version: parsed.text_document.version,
            postpone,
        },
        handler,
        params: params.clone(),
    })
}

fn document_request<P: Prover>(params: &Value, handler: HandlerFn<P>) -> Dispatch<P> {
    let parsed: DocumentParams = match serde_json::from_value(params.clone()) {
        Ok(parsed) => parsed,
        Err(err) => {
            return Dispatch::Immediate(Err(RpcError::invalid_params(format!(
                "document request: {err}"
            ))))
        }
    };
    Dispatch::Data(Descriptor {
        uri: parsed.text_document.uri,
        scope: Scope::Document,
        handler,
        params: params.clone(),
    })
}

fn point_offset<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<usize, RpcError> {
    let parsed: PositionParams = serde_json::from_value(cx.params.clone())
        .map_err(|err| RpcError::invalid_params(err.to_string()))?;
    Ok(cx.doc.position_to_offset(parsed.position))
}

fn hover<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    let offset = point_offset(cx)?;
    let Some(node) = cx.doc.node_at(offset) else {
        return Ok(Value::Null);
    };
    let sentence = &cx.doc.text()[node.span.start..node.span.end];
    let mut value = format!("```\n{sentence}\n```");
    if let Some(goals) = cx.prover.goals(&node.state, PpFormat::Str) {
        value.push_str("\n\ngoals: ");
        value.push_str(&goals);
    }
    Ok(json!({
        "contents": { "kind": "markdown", "value": value },
        "range": cx.doc.range_of(node.span),
    }))
}

fn completion<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    let offset = point_offset(cx)?;
    let items: Vec<Value> = cx
        .prover
        .names(cx.doc.state_at(offset))
        .into_iter()
        .map(|label| json!({ "label": label }))
        .collect();
    Ok(json!({ "isIncomplete": false, "items": items }))
}

fn definition<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    let offset = point_offset(cx)?;
    let Some(word) = word_at(cx.doc.text(), offset) else {
        return Ok(Value::Null);
    };
    for node in cx.doc.nodes() {
        if let Some(entry) = cx.prover.outline(&node.ast) {
            if entry.name == word {
                return Ok(json!({
                    "uri": cx.doc.uri(),
                    "range": cx.doc.range_of(node.span),
                }));
            }
        }
    }
    Ok(Value::Null)
}

fn goals<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    let parsed: PositionParams = serde_json::from_value(cx.params.clone())
        .map_err(|err| RpcError::invalid_params(err.to_string()))?;
    let extra: GoalsExtra = serde_json::from_value(cx.params.clone()).unwrap_or(GoalsExtra {
        pp_format: PpFormat::Pp,
    });
    let offset = cx.doc.position_to_offset(parsed.position);
    let rendered = cx.prover.goals(cx.doc.state_at(offset), extra.pp_format);
    Ok(json!({
        "textDocument": { "uri": cx.doc.uri(), "version": cx.doc.version() },
        "position": parsed.position,
        "goals": rendered,
    }))
}

fn document_symbol<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    let symbols: Vec<Value> = cx
        .doc
        .nodes()
        .iter()
        .filter_map(|node| {
            let entry = cx.prover.outline(&node.ast)?;
            let range = cx.doc.range_of(node.span);
            Some(json!({
                "name": entry.name,
                "detail": entry.detail,
                "kind": symbol_kind(entry.kind),
                "range": range,
                "selectionRange": range,
            }))
        })
        .collect();
    Ok(json!(symbols))
}

/// LSP `SymbolKind` numbering.
fn symbol_kind(kind: OutlineKind) -> u8 {
    match kind {
        OutlineKind::Theorem => 12,    // Function
        OutlineKind::Definition => 14, // Constant
    }
}

fn code_lens<P: Prover>(_cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    Ok(json!([]))
}

fn get_document<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    let spans: Vec<Value> = cx
        .doc
        .nodes()
        .iter()
        .map(|node| {
            json!({
                "range": cx.doc.range_of(node.span),
                "name": cx.prover.outline(&node.ast).map(|entry| entry.name),
            })
        })
        .collect();
    let completed = match cx.doc.completion() {
        qed_core::Completion::Yet { offset } => json!({ "status": "yet", "offset": offset }),
        qed_core::Completion::Stopped { offset, reason } => {
            json!({ "status": "stopped", "offset": offset, "reason": reason })
        }
        qed_core::Completion::Done => json!({ "status": "done" }),
    };
    Ok(json!({
        "version": cx.doc.version(),
        "spans": spans,
        "completed": completed,
    }))
}

fn save_vo<P: Prover>(cx: &HandlerCx<'_, P>) -> Result<Value, RpcError> {
    cx.prover
        .save_artifact(cx.doc.uri(), cx.doc.current_state())
        .map_err(|err| RpcError::internal(err.to_string()))?;
    Ok(Value::Null)
}

/// The identifier containing or immediately preceding `offset`.
fn word_at(text: &str, offset: usize) -> Option<String> {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '\'';
    let offset = offset.min(text.len());
    let start = text[..offset]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_ident(*c))
        .last()
        .map_or(offset, |(i, _)| i);
    let end = offset
        + text[offset..]
            .char_indices()
            .take_while(|(_, c)| is_ident(*c))
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
    if start == end {
        return None;
    }
    Some(text[start..end].to_string())
}
