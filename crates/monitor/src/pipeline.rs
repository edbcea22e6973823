//! Raw ledger event → caller envelope.

use metrics::counter;
use serde_json::{Map, Value};
use thiserror::Error;

use ledger_watch_domain::{
    error::WatchError, EventPayload, NormalizedEvent, PayloadShape, RawLedgerEvent, RawPayload,
    SubscriptionOptions,
};

/// Why a single event could not be normalized. Never terminal for a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("json payload must be an object, got {0}")]
    NotAnObject(&'static str),
    #[error("`header` member must be an object")]
    HeaderNotAnObject,
    #[error("binary payload is empty")]
    EmptyBinary,
}

impl From<NormalizeError> for WatchError {
    fn from(value: NormalizeError) -> Self {
        WatchError::TransientEvent(value.to_string())
    }
}

/// Applies the subscriber's payload shape and field rendering to one event.
pub fn normalize(
    raw: &RawLedgerEvent,
    options: &SubscriptionOptions,
) -> Result<NormalizedEvent, NormalizeError> {
    let payload = match &raw.payload {
        RawPayload::Json(value) => {
            let object = value
                .as_object()
                .ok_or_else(|| NormalizeError::NotAnObject(json_kind(value)))?;
            let mut shaped = shape_object(object, options.shape())?;
            if options.stringify_fields() {
                stringify_numbers(&mut shaped);
            }
            EventPayload::Json(Value::Object(shaped))
        }
        RawPayload::Binary(bytes) => {
            if bytes.is_empty() {
                return Err(NormalizeError::EmptyBinary);
            }
            EventPayload::Binary(bytes.clone())
        }
    };

    Ok(NormalizedEvent::next(raw.sequence, payload))
}

/// Same as [`normalize`] but records the outcome in metrics.
pub fn normalize_counted(
    raw: &RawLedgerEvent,
    options: &SubscriptionOptions,
) -> Result<NormalizedEvent, NormalizeError> {
    let result = normalize(raw, options);
    if result.is_err() {
        counter!("watch_events_dropped_total", "reason" => "malformed").increment(1);
    }
    result
}

fn shape_object(
    object: &Map<String, Value>,
    shape: PayloadShape,
) -> Result<Map<String, Value>, NormalizeError> {
    match shape {
        PayloadShape::FullBlock => Ok(object.clone()),
        PayloadShape::HeadersOnly => match object.get("header") {
            Some(Value::Object(header)) => Ok(header.clone()),
            Some(_) => Err(NormalizeError::HeaderNotAnObject),
            None => {
                let mut header = object.clone();
                header.remove("transactions");
                Ok(header)
            }
        },
    }
}

// One level deep only; nested arrays and objects are left as they are.
fn stringify_numbers(object: &mut Map<String, Value>) {
    for value in object.values_mut() {
        if let Value::Number(number) = value {
            *value = Value::String(number.to_string());
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
