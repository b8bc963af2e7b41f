//! Frame dispatch for a single resource: decode, resolve a handler,
//! validate the payload, and fall back on anything that does not fit.
//!
//! Decode and validation failures never reach the caller; they are
//! absorbed into the resource's `on_unhandled`. Handler errors do
//! propagate, so the session can close the socket and re-raise.

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use manifold_core::codec::{decode_envelope, to_snake_case, DecodeError};
use manifold_core::error::BoxError;
use manifold_core::transport::WsConn;

use crate::resource::{HandlerEntry, Invocation, Resource, ResourceCell, ResourceTable};

pub(crate) async fn dispatch_cell<R: Resource>(
    cell: &mut ResourceCell<R>,
    ws: &dyn WsConn,
    raw: &Bytes,
) -> Result<(), BoxError> {
    let table = std::sync::Arc::clone(&cell.table);
    match table.schema_tag {
        Some(field) => dispatch_schema(cell, &table, ws, raw, field).await,
        None => dispatch_envelope(cell, &table, ws, raw).await,
    }
}

async fn dispatch_envelope<R: Resource>(
    cell: &mut ResourceCell<R>,
    table: &ResourceTable<R>,
    ws: &dyn WsConn,
    raw: &Bytes,
) -> Result<(), BoxError> {
    let envelope = match decode_envelope(raw) {
        Ok(envelope) => envelope,
        Err(err) => return fallback(cell, ws, raw, &err).await,
    };
    let Some(entry) = lookup(table, &envelope.message_type) else {
        debug!(
            message_type = %envelope.message_type,
            "no handler for message type"
        );
        cell.resource.on_unhandled(ws, raw).await;
        return Ok(());
    };
    invoke_entry(cell, entry, ws, raw, envelope.payload, None).await
}

async fn dispatch_schema<R: Resource>(
    cell: &mut ResourceCell<R>,
    table: &ResourceTable<R>,
    ws: &dyn WsConn,
    raw: &Bytes,
    field: &'static str,
) -> Result<(), BoxError> {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => return fallback(cell, ws, raw, &DecodeError::Syntax(err)).await,
    };
    let tag = {
        let Some(map) = value.as_object() else {
            return fallback(cell, ws, raw, &DecodeError::NotAnObject).await;
        };
        match map.get(field) {
            Some(Value::String(tag)) => tag.clone(),
            Some(_) => return fallback(cell, ws, raw, &DecodeError::NonStringTag(field)).await,
            None => return fallback(cell, ws, raw, &DecodeError::MissingTag(field)).await,
        }
    };
    let Some(entry) = lookup(table, &tag) else {
        debug!(tag = %tag, "no handler for schema tag");
        cell.resource.on_unhandled(ws, raw).await;
        return Ok(());
    };
    // The whole object is the payload; the discriminator field is exempt
    // from the strict unknown-field check.
    invoke_entry(cell, entry, ws, raw, Some(value), Some(field)).await
}

/// Exact tag match first, then the conventional `on_{snake}` method table.
fn lookup<'t, R>(table: &'t ResourceTable<R>, tag: &str) -> Option<&'t HandlerEntry<R>> {
    table.handlers.get(tag).or_else(|| {
        let conventional = format!("on_{}", to_snake_case(tag));
        table.methods.get(&conventional)
    })
}

async fn invoke_entry<R: Resource>(
    cell: &mut ResourceCell<R>,
    entry: &HandlerEntry<R>,
    ws: &dyn WsConn,
    raw: &Bytes,
    payload: Option<Value>,
    tag_field: Option<&'static str>,
) -> Result<(), BoxError> {
    // Strict mode: a mapping payload may not carry fields the target type
    // does not declare. Runs before conversion, and only when the target's
    // field list is known (struct-like payload types).
    if entry.strict {
        if let (Some(fields), Some(Value::Object(map))) = (entry.fields, payload.as_ref()) {
            let extra: Vec<String> = map
                .keys()
                .filter(|key| {
                    !fields.contains(&key.as_str()) && tag_field != Some(key.as_str())
                })
                .cloned()
                .collect();
            if !extra.is_empty() {
                return fallback(cell, ws, raw, &DecodeError::UnknownFields(extra)).await;
            }
        }
    }

    match (entry.invoke)(&mut cell.resource, ws, payload.unwrap_or(Value::Null)).await? {
        Invocation::Completed => Ok(()),
        Invocation::Rejected(err) => fallback(cell, ws, raw, &err).await,
    }
}

async fn fallback<R: Resource>(
    cell: &mut ResourceCell<R>,
    ws: &dyn WsConn,
    raw: &Bytes,
    err: &DecodeError,
) -> Result<(), BoxError> {
    debug!(error = %err, kind = err.kind(), "frame routed to fallback");
    cell.resource.on_unhandled(ws, raw).await;
    Ok(())
}
