use std::fmt;

use serde::{Deserialize, Serialize};

/// Where an uploaded file lands.
///
/// Serialized as `{"kind": "project", "id": "..."}`. The engine treats it as
/// an opaque routing key; only the endpoint path depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Destination {
    Project(String),
    Folder(String),
}

impl Destination {
    /// Returns the routing identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::Project(id) | Self::Folder(id) => id,
        }
    }

    /// Path of the file collection for this destination, e.g. `/projects/p1/files`.
    pub fn files_path(&self) -> String {
        match self {
            Self::Project(id) => format!("/projects/{id}/files"),
            Self::Folder(id) => format!("/folders/{id}/files"),
        }
    }

    /// Path of a chunked endpoint under this destination, e.g.
    /// `/folders/f1/files/chunked/init`.
    pub fn endpoint(&self, suffix: &str) -> String {
        format!("{}/{}", self.files_path(), suffix.trim_start_matches('/'))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project(id) => write!(f, "project:{id}"),
            Self::Folder(id) => write!(f, "folder:{id}"),
        }
    }
}
