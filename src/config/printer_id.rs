use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

/// Stable handle for one configured printer.
///
/// Cheap to clone, used as the key of the printer registry and as a tracing field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrinterId(Arc<String>);

impl PrinterId {
    pub fn from_id(id: &str) -> Self {
        Self(Arc::new(id.to_string()))
    }

    pub fn generate() -> Self {
        Self(Arc::new(nanoid::nanoid!()))
    }

    /// Placeholder used by serde when a config entry has no id yet.
    pub fn empty() -> Self {
        Self(Arc::new(String::new()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for PrinterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PrinterId {
    fn from(s: String) -> Self {
        PrinterId(Arc::new(s))
    }
}

impl From<&str> for PrinterId {
    fn from(s: &str) -> Self {
        Self::from_id(s)
    }
}

impl Serialize for PrinterId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PrinterId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(PrinterId(Arc::new(s)))
    }
}
