//! Error types for code generation.

use depot_schema::SchemaError;

/// Errors that stop code generation.
///
/// Every variant identifies the offending declaration. Generation never emits
/// code for a unit that produced an error.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The schema built from the declarations is invalid.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// A `:name` token in a statement has no matching method parameter.
    #[error("{method}: bind parameter ':{parameter}' does not match any method parameter")]
    UnresolvedBindParameter {
        /// `Dao::method`.
        method: String,
        /// The unmatched bind name.
        parameter: String,
    },

    /// A method parameter is not referenced by the statement.
    #[error("{method}: parameter '{parameter}' is not used by the statement")]
    UnusedParameter {
        /// `Dao::method`.
        method: String,
        /// The unused parameter.
        parameter: String,
    },

    /// A statement mixes `?` and `:name` placeholders.
    #[error("{method}: statement mixes positional and named bind parameters")]
    MixedBinding {
        /// `Dao::method`.
        method: String,
    },

    /// The same logical key is declared twice.
    #[error("Duplicate {kind} '{key}'")]
    DuplicateDeclaration {
        /// Kind of declaration (entity, DAO, method, ...).
        kind: &'static str,
        /// The duplicated key.
        key: String,
    },

    /// A declaration is malformed or misuses an intent.
    #[error("{location}: {message}")]
    InvalidDeclaration {
        /// Where the problem is.
        location: String,
        /// What is wrong.
        message: String,
    },

    /// A type name that is neither a supported scalar, a converted type nor
    /// an entity.
    #[error("{location}: unknown type '{type_name}'")]
    UnknownType {
        /// Where the type appears.
        location: String,
        /// The unresolved type.
        type_name: String,
    },

    /// IO error while reading declarations or writing output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Declaration file could not be parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Multiple errors occurred.
    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<CompileError>),
}

impl CompileError {
    pub(crate) fn invalid(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDeclaration {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Collapses a list of errors into a single error.
    #[must_use]
    pub fn collect(mut errors: Vec<Self>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Flattens nested `Multiple` errors.
    #[must_use]
    pub fn into_list(self) -> Vec<Self> {
        match self {
            Self::Multiple(errors) => errors.into_iter().flat_map(Self::into_list).collect(),
            other => vec![other],
        }
    }
}

/// A non-fatal finding reported during generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Where the finding applies.
    pub location: String,
    /// Description.
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Result type for code generation.
pub type Result<T> = std::result::Result<T, CompileError>;
