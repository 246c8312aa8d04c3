//! Server definitions and their key-value exchange representation

use crate::error::{Result, ServeError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Type identifier attached to clipboard/drag payloads carrying a definition
pub const SERVER_PAYLOAD_TYPE: &str = "io.serve.server";

/// Characters the Caddyfile grammar cannot carry inside a quoted root
const FORBIDDEN_ROOT_CHARS: [char; 6] = ['{', '}', '"', '\\', '\n', '\r'];

/// Declarative description of one managed server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    /// Stable identifier, also the name of the server's directory
    pub id: String,
    /// Directory the server serves content from
    pub root: PathBuf,
    /// TCP port the server listens on
    pub port: u16,
}

impl ServerDefinition {
    /// Create a definition with a freshly generated id
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), root, port)
    }

    /// Create a definition with an explicit id
    pub fn with_id(id: impl Into<String>, root: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            port,
        }
    }

    /// Root as a string, if it is representable in a Caddyfile
    pub fn root_str(&self) -> Option<&str> {
        self.root.to_str()
    }

    /// Check that the definition can be persisted and rendered
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;

        if self.port == 0 {
            return Err(ServeError::InvalidDefinition(format!(
                "server '{}': port must be greater than 0",
                self.id
            )));
        }

        validate_root(&self.root)
    }

    /// Key-value representation with `id`, `root` and `port` keys
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert(
            "root".to_string(),
            Value::String(self.root.to_string_lossy().into_owned()),
        );
        map.insert("port".to_string(), Value::from(self.port));
        map
    }

    /// Rebuild a definition from its key-value representation
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_key("id"))?;
        let root = map
            .get("root")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_key("root"))?;
        let port = map
            .get("port")
            .and_then(Value::as_u64)
            .ok_or_else(|| missing_key("port"))?;

        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                ServeError::InvalidDefinition(format!("port {} is out of range", port))
            })?;

        Ok(Self::with_id(id, root, port))
    }

    /// Serialized payload for clipboard/drag exchange, tagged [`SERVER_PAYLOAD_TYPE`]
    pub fn to_payload(&self) -> Vec<u8> {
        Value::Object(self.to_map()).to_string().into_bytes()
    }

    /// Parse a payload produced by [`to_payload`](Self::to_payload)
    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            ServeError::InvalidDefinition(format!("payload is not valid JSON: {}", e))
        })?;
        match value {
            Value::Object(map) => Self::from_map(&map),
            _ => Err(ServeError::InvalidDefinition(
                "payload is not a key-value object".to_string(),
            )),
        }
    }
}

fn missing_key(key: &str) -> ServeError {
    ServeError::InvalidDefinition(format!("missing or mistyped '{}' entry", key))
}

/// Ids name directories, so they must be a single plain path component
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ServeError::InvalidDefinition("id must not be empty".to_string()));
    }
    if id == "." || id == ".." {
        return Err(ServeError::InvalidDefinition(format!("id '{}' is reserved", id)));
    }
    if id
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
    {
        return Err(ServeError::InvalidDefinition(format!(
            "id '{}' contains a path separator, whitespace or control character",
            id.escape_debug()
        )));
    }
    Ok(())
}

fn validate_root(root: &Path) -> Result<()> {
    let Some(text) = root.to_str() else {
        return Err(ServeError::InvalidDefinition(format!(
            "root {:?} is not valid UTF-8",
            root
        )));
    };

    if !root.is_absolute() {
        return Err(ServeError::InvalidDefinition(format!(
            "root '{}' must be an absolute path",
            text
        )));
    }

    if let Some(c) = text.chars().find(|c| FORBIDDEN_ROOT_CHARS.contains(c)) {
        return Err(ServeError::InvalidDefinition(format!(
            "root '{}' contains unsupported character {:?}",
            text.escape_debug(),
            c
        )));
    }

    Ok(())
}
