//! Frame decoding for the default envelope format plus the payload
//! validation helpers used by the dispatcher.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The default wire format used when a resource declares no schema: a JSON
/// object with a required string `type` and an optional `payload`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Decode failures are a distinct error kind so the dispatcher can route
/// them to a resource's fallback instead of tearing down the connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    #[error("frame does not match the message envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("schema frame is not a JSON object")]
    NotAnObject,
    #[error("schema frame is missing discriminator field {0:?}")]
    MissingTag(&'static str),
    #[error("schema frame discriminator {0:?} is not a string")]
    NonStringTag(&'static str),
    #[error("unknown fields in payload: {0:?}")]
    UnknownFields(Vec<String>),
    #[error("payload conversion failed: {0}")]
    Conversion(#[source] serde_json::Error),
}

impl DecodeError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Syntax(_) => "syntax",
            Self::Envelope(_) => "envelope",
            Self::NotAnObject => "not_an_object",
            Self::MissingTag(_) => "missing_tag",
            Self::NonStringTag(_) => "non_string_tag",
            Self::UnknownFields(_) => "unknown_fields",
            Self::Conversion(_) => "conversion",
        }
    }
}

/// Decode `raw` as the default [`Envelope`]. A frame whose `type` field is
/// absent or not a string is a decode failure, never a panic.
pub fn decode_envelope(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(raw).map_err(DecodeError::Syntax)?;
    serde_json::from_value(value).map_err(DecodeError::Envelope)
}

/// Internal error used by the field probe to smuggle the field list out of
/// a `Deserialize` impl.
#[derive(Debug)]
struct FieldListProbe(Option<&'static [&'static str]>);

impl fmt::Display for FieldListProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("field list probe")
    }
}

impl std::error::Error for FieldListProbe {}

impl serde::de::Error for FieldListProbe {
    fn custom<T: fmt::Display>(_msg: T) -> Self {
        FieldListProbe(None)
    }
}

struct FieldProbe;

impl<'de> serde::Deserializer<'de> for FieldProbe {
    type Error = FieldListProbe;

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(FieldListProbe(Some(fields)))
    }

    fn deserialize_any<V>(self, _visitor: V) -> Result<V::Value, Self::Error>
    where
        V: serde::de::Visitor<'de>,
    {
        Err(FieldListProbe(None))
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}

/// Return the serde-declared field names of `T` when `T` deserializes as a
/// struct with named fields.
///
/// Types that deserialize as anything else (maps, enums, primitives,
/// `Value`) yield `None` and are exempt from strict unknown-field checking.
/// The probe never touches real data; it only observes the field list serde
/// hands to the deserializer.
pub fn struct_fields<T: DeserializeOwned>() -> Option<&'static [&'static str]> {
    match T::deserialize(FieldProbe) {
        Err(FieldListProbe(fields)) => fields,
        Ok(_) => None,
    }
}

/// Best-effort conversion of `name` to snake_case.
///
/// Runs of non-alphanumeric characters collapse to a single underscore and
/// consecutive uppercase letters split before a trailing lowercase letter
/// (`HTTPRequest` → `http_request`). This mapping feeds the conventional
/// handler lookup (`on_{snake}`); the exact rule is deliberately simple and
/// covered by tests rather than promised as a stable contract.
pub fn to_snake_case(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            cleaned.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            cleaned.push('_');
            last_was_sep = true;
        }
    }

    let chars: Vec<char> = cleaned.chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars
                .get(i + 1)
                .is_some_and(|c| c.is_ascii_lowercase());
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower);
            if boundary {
                out.push('_');
            }
        }
        out.push(ch.to_ascii_lowercase());
    }
    out
}
