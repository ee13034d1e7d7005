//! Topic views.
//!
//! A view maps every value of a source topic onto a read-only target topic,
//! optionally narrowed to one member with a JSON pointer:
//!
//! ```text
//! map redis/bitcoin to views/usd as /bpi/USD
//! ```

use crate::core::payload::Payload;
use crate::errors::TopicError;
use crate::secondary::{validate_path, ValueType};

/// A parsed view definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicView {
    /// Name the view was created under.
    pub name: String,
    /// Topic whose updates drive the view.
    pub source: String,
    /// Read-only topic the view writes.
    pub target: String,
    /// JSON pointer selecting part of each source value.
    pub projection: Option<String>,
}

impl TopicView {
    /// Parses `map <source> to <target> [as <json-pointer>]`.
    pub fn parse(name: &str, spec: &str) -> Result<Self, TopicError> {
        let invalid = |why: &str| TopicError::InvalidView(format!("{}: {} in '{}'", name, why, spec));
        let tokens: Vec<&str> = spec.split_whitespace().collect();

        let (source, target, projection) = match tokens.as_slice() {
            ["map", source, "to", target] => (*source, *target, None),
            ["map", source, "to", target, "as", pointer] => (*source, *target, Some(*pointer)),
            _ => return Err(invalid("expected 'map <source> to <target> [as <pointer>]'")),
        };

        validate_path(source)?;
        validate_path(target)?;
        if source == target {
            return Err(invalid("source and target are the same topic"));
        }
        if let Some(pointer) = projection {
            if !pointer.starts_with('/') {
                return Err(invalid("projection must be a JSON pointer starting with '/'"));
            }
        }

        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            projection: projection.map(str::to_string),
        })
    }

    /// Value type of the target topic, given the source's.
    pub fn target_type(&self, source_type: ValueType) -> ValueType {
        match self.projection {
            Some(_) => ValueType::Json,
            None => source_type,
        }
    }

    /// The target value for one source value. Without a projection the bytes
    /// pass through untouched. `None` when the pointer selects nothing or the
    /// source value is not JSON.
    pub fn project(&self, value: &Payload) -> Option<Payload> {
        let Some(pointer) = &self.projection else {
            return Some(value.clone());
        };
        let document = value.to_value().ok()?;
        let selected = document.pointer(pointer)?;
        Payload::from_json(selected).ok()
    }
}
