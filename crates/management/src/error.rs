use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagementError {
    /// The user dismissed or declined a trust prompt. Never an unexpected
    /// failure; callers must not surface this as an error notification.
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Cannot install the '{extension}' extension{}", .target.as_ref().map(|t| format!(" on the {t} target")).unwrap_or_default())]
    Unsupported {
        extension: String,
        target: Option<String>,
    },

    #[error("Cannot uninstall '{extension}' because {dependents} depend(s) on it")]
    DependentsExist {
        extension: String,
        dependents: String,
    },

    #[error("Cannot find the manifest for the '{0}' extension")]
    ManifestUnavailable(String),

    #[error("The {0} extension management target is not configured")]
    TargetNotConfigured(String),

    #[error("Invalid extension location '{0}'")]
    InvalidLocation(url::Url),

    #[error("Extension '{0}' not found")]
    ExtensionNotFound(String),

    #[error("Invalid manifest at '{location}': {reason}")]
    InvalidManifest { location: url::Url, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{}", .0.join("\n"))]
    Multiple(Vec<String>),
}

pub type Result<T> = std::result::Result<T, ManagementError>;

impl ManagementError {
    /// A user-initiated abort rather than a failure. UI layers must not
    /// render these as "something went wrong".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ManagementError::Cancelled)
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ManagementError::NetworkError(_) | ManagementError::ManifestUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_names_single_target() {
        let err = ManagementError::Unsupported {
            extension: "Test Extension".to_string(),
            target: Some("web".to_string()),
        };
        let message = err.to_string();
        assert!(message.contains("Test Extension"));
        assert!(message.contains("web"));
    }

    #[test]
    fn unsupported_without_target() {
        let err = ManagementError::Unsupported {
            extension: "Test Extension".to_string(),
            target: None,
        };
        assert_eq!(
            err.to_string(),
            "Cannot install the 'Test Extension' extension"
        );
    }

    #[test]
    fn cancellation_is_not_recoverable_error() {
        assert!(ManagementError::Cancelled.is_cancellation());
        assert!(!ManagementError::Cancelled.is_recoverable());
        assert!(!ManagementError::NetworkError("down".to_string()).is_cancellation());
    }
}
