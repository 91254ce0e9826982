//! Deep merge and state restore
//!
//! Opening a report has to produce a complete state from three partial
//! sources: the default skeleton, the document stored on the server, and the
//! snapshot the client cached locally. [`restore`] combines them with
//! [`merge_deep`].
//!
//! There is no timestamp reconciliation under [`ConflictPolicy::LocalWins`]:
//! a stale local snapshot replaces newer server data and is written back on
//! the next save.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::data::ReportData;
use crate::error::CoreError;

/// Merge `source` into a copy of `target`.
///
/// - `target` not an object: `source` is returned
/// - `source` not an object: `target` is returned
/// - otherwise, per key of `source`: arrays are copied wholesale, objects are
///   merged recursively (a non-object on the target side counts as `{}`), and
///   scalars, `null` included, overwrite
pub fn merge_deep(target: &Value, source: &Value) -> Value {
    let (base, overlay) = match (target, source) {
        (Value::Object(base), Value::Object(overlay)) => (base, overlay),
        (Value::Object(_), _) => return target.clone(),
        _ => return source.clone(),
    };

    let mut output = base.clone();
    for (key, value) in overlay {
        let merged = match value {
            Value::Array(items) => Value::Array(items.clone()),
            Value::Object(_) => match base.get(key) {
                Some(existing @ Value::Object(_)) => merge_deep(existing, value),
                _ => merge_deep(&Value::Object(Map::new()), value),
            },
            scalar => scalar.clone(),
        };
        output.insert(key.clone(), merged);
    }
    Value::Object(output)
}

/// What to do when both the server and the local cache hold a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The local snapshot always replaces server data
    #[default]
    LocalWins,
    /// The local snapshot is used only when it is newer than the server copy.
    /// A snapshot without a timestamp loses; a server copy without one loses.
    NewestWins,
}

/// Report state as returned by the server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub dados: Value,
    #[serde(default)]
    pub areas: Vec<Value>,
    #[serde(default)]
    pub comparativos: Vec<Value>,
    /// SQLite `CURRENT_TIMESTAMP`, UTC
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
}

/// A locally cached copy of a report's editable state.
///
/// List fields are kept raw: the cache may predate the current client and
/// hold anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalSnapshot {
    #[serde(default)]
    pub dados: Value,
    #[serde(default)]
    pub areas: Value,
    #[serde(default)]
    pub comparativos: Value,
    #[serde(rename = "atualizadoEm", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LocalSnapshot {
    pub fn new(dados: Value, areas: Vec<Value>, comparativos: Vec<Value>) -> Self {
        Self {
            dados,
            areas: Value::Array(areas),
            comparativos: Value::Array(comparativos),
            updated_at: Some(Utc::now()),
        }
    }

    /// Parse cached text; a corrupt cache entry is logged and ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Ignoring unreadable local snapshot: {}", e);
                None
            }
        }
    }

    fn is_newer_than(&self, server: &ServerState) -> bool {
        match (self.updated_at, server.updated_at) {
            (Some(local), Some(remote)) => local.naive_utc() > remote,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Where the restored free-text data came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    Server,
    LocalCache,
}

/// Complete client state after [`restore`]
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub data: Value,
    pub areas: Vec<Value>,
    pub comparativos: Vec<Value>,
    pub source: RestoreSource,
}

impl Restored {
    /// Decode the restored data into the typed document
    pub fn report_data(&self) -> Result<ReportData, CoreError> {
        ReportData::from_value(self.data.clone())
    }
}

/// Rebuild client state for an opened report.
///
/// 1. `defaults ← server.dados`; areas and comparables from the server.
/// 2. If a local snapshot exists and `policy` selects it, `defaults ←
///    local.dados` replaces step 1's data, and each list is replaced when the
///    cached value is a genuine array.
pub fn restore(
    defaults: &Value,
    server: &ServerState,
    local: Option<&LocalSnapshot>,
    policy: ConflictPolicy,
) -> Restored {
    let mut restored = Restored {
        data: merge_deep(defaults, &object_or_empty(&server.dados)),
        areas: server.areas.clone(),
        comparativos: server.comparativos.clone(),
        source: RestoreSource::Server,
    };

    let Some(local) = local else {
        return restored;
    };

    let use_local = match policy {
        ConflictPolicy::LocalWins => true,
        ConflictPolicy::NewestWins => local.is_newer_than(server),
    };
    if !use_local {
        debug!("Local snapshot is older than the server copy; keeping server data");
        return restored;
    }

    restored.data = merge_deep(defaults, &object_or_empty(&local.dados));
    if let Value::Array(areas) = &local.areas {
        restored.areas = areas.clone();
    }
    if let Value::Array(comparativos) = &local.comparativos {
        restored.comparativos = comparativos.clone();
    }
    restored.source = RestoreSource::LocalCache;
    restored
}

/// Falsy documents (`null`, `""`, `0`, `false`) are treated as `{}`
fn object_or_empty(value: &Value) -> Value {
    let falsy = match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    };
    if falsy {
        Value::Object(Map::new())
    } else {
        value.clone()
    }
}
