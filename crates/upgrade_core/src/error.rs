//! Item-level failures and the ordered aggregate returned by batch operations.

use std::fmt;
use std::path::{Path, PathBuf};

/// One failure against one independent item (directory or directory pair).
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// Safety check failed: the path is not a managed data directory.
    #[error("{} is not a valid data directory: missing {marker}", path.display())]
    InvalidDataDirectory { path: PathBuf, marker: String },

    /// Filesystem call failed for this item.
    #[error("{op} {}: {error}", path.display())]
    Io {
        op: String,
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// A copy to another host exited unsuccessfully.
    #[error("rsync {from} -> {to}: {detail}")]
    Rsync {
        from: String,
        to: String,
        detail: String,
    },

    /// A fault injection point fired for this item.
    #[error("injected failure at {point} for {}", path.display())]
    Injected { point: String, path: PathBuf },

    /// The task running this item panicked or was cancelled.
    #[error("task failed: {detail}")]
    Task { detail: String },
}

impl ItemError {
    pub fn io(op: impl Into<String>, path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::Io {
            op: op.into(),
            path: path.into(),
            error,
        }
    }

    pub fn invalid(path: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self::InvalidDataDirectory {
            path: path.into(),
            marker: marker.into(),
        }
    }

    /// Stable kind tag used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidDataDirectory { .. } => "invalid_data_directory",
            Self::Io { .. } => "io",
            Self::Rsync { .. } => "rsync",
            Self::Injected { .. } => "injected",
            Self::Task { .. } => "task",
        }
    }

    /// Path the failure is about, when there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::InvalidDataDirectory { path, .. }
            | Self::Io { path, .. }
            | Self::Injected { path, .. } => Some(path),
            Self::Rsync { .. } | Self::Task { .. } => None,
        }
    }

    pub fn is_invalid_data_directory(&self) -> bool {
        matches!(self, Self::InvalidDataDirectory { .. })
    }

    /// Flatten into `(kind, path, detail, message)` for transport.
    pub fn to_parts(&self) -> WireParts {
        match self {
            Self::InvalidDataDirectory { path, marker } => WireParts {
                kind: self.kind().to_string(),
                path: path.display().to_string(),
                detail: marker.clone(),
                message: self.to_string(),
            },
            Self::Io { op, path, error } => WireParts {
                kind: self.kind().to_string(),
                path: path.display().to_string(),
                detail: op.clone(),
                message: error.to_string(),
            },
            Self::Rsync { from, to, detail } => WireParts {
                kind: self.kind().to_string(),
                path: from.clone(),
                detail: to.clone(),
                message: detail.clone(),
            },
            Self::Injected { point, path } => WireParts {
                kind: self.kind().to_string(),
                path: path.display().to_string(),
                detail: point.clone(),
                message: self.to_string(),
            },
            Self::Task { detail } => WireParts {
                kind: self.kind().to_string(),
                path: String::new(),
                detail: String::new(),
                message: detail.clone(),
            },
        }
    }

    /// Rebuild a typed error from its transport form.
    ///
    /// Unknown kinds decode as `Task` so nothing reported by a newer agent is dropped.
    pub fn from_parts(parts: WireParts) -> Self {
        let WireParts {
            kind,
            path,
            detail,
            message,
        } = parts;
        match kind.as_str() {
            "invalid_data_directory" => Self::InvalidDataDirectory {
                path: PathBuf::from(path),
                marker: detail,
            },
            "io" => Self::Io {
                op: detail,
                path: PathBuf::from(path),
                error: std::io::Error::other(message),
            },
            "rsync" => Self::Rsync {
                from: path,
                to: detail,
                detail: message,
            },
            "injected" => Self::Injected {
                point: detail,
                path: PathBuf::from(path),
            },
            "task" => Self::Task { detail: message },
            other => Self::Task {
                detail: format!("{other}: {message}"),
            },
        }
    }
}

/// Transport-neutral fields of an [`ItemError`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireParts {
    pub kind: String,
    pub path: String,
    pub detail: String,
    pub message: String,
}

/// Ordered collection of every item failure from one batch.
///
/// An empty aggregate means the batch succeeded.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<ItemError>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ItemError) {
        self.errors.push(err);
    }

    /// Append every error from `other`, preserving its order.
    pub fn append(&mut self, other: AggregateError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ItemError] {
        &self.errors
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ItemError> {
        self.errors.iter()
    }

    pub fn into_errors(self) -> Vec<ItemError> {
        self.errors
    }

    /// `Ok(())` when empty, otherwise the aggregate itself.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                write!(f, "{n} errors occurred:")?;
                for err in &self.errors {
                    write!(f, "\n  * {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AggregateError {}

impl From<ItemError> for AggregateError {
    fn from(err: ItemError) -> Self {
        Self { errors: vec![err] }
    }
}

impl From<Vec<ItemError>> for AggregateError {
    fn from(errors: Vec<ItemError>) -> Self {
        Self { errors }
    }
}

impl FromIterator<ItemError> for AggregateError {
    fn from_iter<T: IntoIterator<Item = ItemError>>(iter: T) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl Extend<ItemError> for AggregateError {
    fn extend<T: IntoIterator<Item = ItemError>>(&mut self, iter: T) {
        self.errors.extend(iter);
    }
}

impl IntoIterator for AggregateError {
    type Item = ItemError;
    type IntoIter = std::vec::IntoIter<ItemError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a AggregateError {
    type Item = &'a ItemError;
    type IntoIter = std::slice::Iter<'a, ItemError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_every_error_in_order() {
        let mut agg = AggregateError::new();
        agg.push(ItemError::invalid("/a", "PG_VERSION"));
        agg.push(ItemError::invalid("/b", "postgresql.conf"));
        let text = agg.to_string();
        assert!(text.starts_with("2 errors occurred:"));
        let a = text.find("/a").expect("first error");
        let b = text.find("/b").expect("second error");
        assert!(a < b);
    }

    #[test]
    fn empty_aggregate_is_success() {
        assert!(AggregateError::new().into_result().is_ok());
        let err = AggregateError::from(ItemError::Task {
            detail: "boom".into(),
        });
        assert_eq!(err.into_result().unwrap_err().len(), 1);
    }

    #[test]
    fn wire_parts_keep_typed_fields() {
        let original = ItemError::invalid("/data/seg0", "PG_VERSION");
        let decoded = ItemError::from_parts(original.to_parts());
        match decoded {
            ItemError::InvalidDataDirectory { path, marker } => {
                assert_eq!(path, PathBuf::from("/data/seg0"));
                assert_eq!(marker, "PG_VERSION");
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let io = ItemError::io(
            "remove",
            "/data/seg1",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        let decoded = ItemError::from_parts(io.to_parts());
        assert_eq!(decoded.kind(), "io");
        assert_eq!(decoded.path(), Some(Path::new("/data/seg1")));
    }

    #[test]
    fn unknown_wire_kind_is_not_dropped() {
        let decoded = ItemError::from_parts(WireParts {
            kind: "future_kind".into(),
            message: "something new".into(),
            ..WireParts::default()
        });
        assert!(decoded.to_string().contains("future_kind"));
    }
}
