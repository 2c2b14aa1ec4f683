//! Execution context with `{{ path }}` template resolution.
//!
//! `ExecutionContext` is the mutable data bag that flows through an instance.
//! Clones share the same data store, so parallel branches and actions observe
//! each other's writes. Provenance fields (user, session, trigger, metadata)
//! are fixed at construction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// TriggerOrigin
// ---------------------------------------------------------------------------

/// Which trigger and event launched an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOrigin {
    pub trigger: String,
    pub event: String,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Per-instance data bag plus immutable provenance.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    data: Arc<RwLock<Map<String, Value>>>,
    user: Option<String>,
    session: Option<String>,
    trigger: Option<TriggerOrigin>,
    metadata: Map<String, Value>,
}

impl ExecutionContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with the given data.
    pub fn from_data(data: Map<String, Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            ..Self::default()
        }
    }

    /// Context seeded from an arbitrary JSON value.
    ///
    /// Objects become the data map; anything else lands under `payload`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_data(map),
            Value::Null => Self::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                Self::from_data(map)
            }
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerOrigin) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn trigger(&self) -> Option<&TriggerOrigin> {
        self.trigger.as_ref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Same provenance, fresh data store holding `data`.
    pub fn fork(&self, data: Map<String, Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            user: self.user.clone(),
            session: self.session.clone(),
            trigger: self.trigger.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Look up a dotted path (`user.address.city`).
    pub async fn get(&self, path: &str) -> Option<Value> {
        let data = self.data.read().await;
        lookup_path(&data, path).cloned()
    }

    /// Write a top-level key.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.data.write().await.insert(key.into(), value);
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.data.write().await.remove(key)
    }

    /// Copy of the whole data map.
    pub async fn snapshot(&self) -> Map<String, Value> {
        self.data.read().await.clone()
    }

    /// Resolve a parameter template against the current data.
    pub async fn resolve(&self, template: &Value) -> Value {
        let data = self.data.read().await;
        resolve_params(template, &data)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Walk a dotted path through objects (and arrays, by numeric segment).
///
/// Returns `None` when any segment is missing.
pub fn lookup_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.').map(str::trim);
    let first = segments.next().filter(|s| !s.is_empty())?;
    let mut current = data.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a single template string.
///
/// - A string that is exactly one `{{ path }}` resolves to the referenced
///   value with its type intact, or `None` when the path is absent.
/// - Any other string has each `{{ path }}` interpolated as text; absent
///   paths become empty strings.
/// - A string without templates is returned unchanged.
pub fn resolve_template(template: &str, data: &Map<String, Value>) -> Option<Value> {
    if let Some(path) = whole_template_path(template) {
        return lookup_path(data, path).cloned();
    }
    if !template.contains("{{") {
        return Some(Value::String(template.to_string()));
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        if let Some(value) = lookup_path(data, path) {
            out.push_str(&value_to_string(value));
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Some(Value::String(out))
}

/// Resolve every template in a parameter tree into a fresh value.
///
/// Absent values are dropped from objects and become `null` elsewhere. The
/// input template is never mutated.
pub fn resolve_params(params: &Value, data: &Map<String, Value>) -> Value {
    match params {
        Value::String(s) => resolve_template(s, data).unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_params(item, data))
                .collect(),
        ),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, value) in map {
                let value = match value {
                    Value::String(s) => match resolve_template(s, data) {
                        Some(v) => v,
                        None => continue,
                    },
                    other => resolve_params(other, data),
                };
                resolved.insert(key.clone(), value);
            }
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// If `template` is exactly `{{ path }}`, return the trimmed path.
fn whole_template_path(template: &str) -> Option<&str> {
    let inner = template
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Convert a JSON value to a display string for interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
