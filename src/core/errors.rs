use thiserror::Error;

/// Unified error type for the entire Kiln library
#[derive(Debug, Error)]
pub enum KilnError {
    /// A sub-pipeline or dependency lookup referenced a stage name that is
    /// not part of the pipeline.
    #[error("Unknown stage: '{stage}'")]
    UnknownStage { stage: String },

    /// A stage was scheduled before one of its dependencies, meaning the
    /// pipeline's declared order is not a valid topological order.
    #[error("Unresolved dependency: stage '{stage}' depends on '{dependency}', which is not scheduled yet")]
    UnresolvedDependency { stage: String, dependency: String },

    /// A dispatched stage's work failed. Surfaced by the completion
    /// barrier, never at dispatch time.
    #[error("Stage execution failed: {stage} - {message}")]
    StageExecution { stage: String, message: String },

    /// The execution substrate could not be reached or initialized.
    #[error("Execution substrate unavailable: {reason}")]
    SubstrateUnavailable { reason: String },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Network/IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// Pipeline description parsing errors
    #[error("Pipeline description parsing failed")]
    Yaml(#[from] serde_yaml::Error),
}

impl KilnError {
    /// Create an unknown stage error
    pub fn unknown_stage<S: Into<String>>(stage: S) -> Self {
        Self::UnknownStage {
            stage: stage.into(),
        }
    }

    /// Create an unresolved dependency error
    pub fn unresolved_dependency<S: Into<String>>(stage: S, dependency: S) -> Self {
        Self::UnresolvedDependency {
            stage: stage.into(),
            dependency: dependency.into(),
        }
    }

    /// Create a stage execution error
    pub fn stage_execution<S: Into<String>>(stage: S, message: S) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a substrate unavailable error
    pub fn substrate_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::SubstrateUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an IO error with operation context
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Get error category for logging and reporting
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownStage { .. } => "unknown_stage",
            Self::UnresolvedDependency { .. } => "unresolved_dependency",
            Self::StageExecution { .. } => "stage_execution",
            Self::SubstrateUnavailable { .. } => "substrate_unavailable",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::Yaml(_) => "yaml",
        }
    }

    /// Whether the error aborts the run before the completion barrier.
    ///
    /// Everything except a stage's own execution failure is raised
    /// synchronously during pipeline construction or the dispatch loop.
    pub fn is_dispatch_error(&self) -> bool {
        !matches!(self, Self::StageExecution { .. })
    }
}

/// Result type alias using KilnError
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_stage_names() {
        let err = KilnError::unresolved_dependency("x", "y");
        let msg = err.to_string();
        assert!(msg.contains("'x'"));
        assert!(msg.contains("'y'"));
        assert_eq!(err.category(), "unresolved_dependency");
    }

    #[test]
    fn stage_execution_is_not_a_dispatch_error() {
        assert!(!KilnError::stage_execution("f", "boom").is_dispatch_error());
        assert!(KilnError::unknown_stage("f").is_dispatch_error());
    }
}
