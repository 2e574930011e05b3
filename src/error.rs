//! Error taxonomy shared by the ontology, label, geometry and export layers.

use crate::ontology::MlTask;

pub type Result<T> = std::result::Result<T, KiliError>;

#[derive(Debug, thiserror::Error)]
pub enum KiliError {
    /// Malformed or inconsistent interface definition.
    #[error("Invalid ontology: {0}")]
    InvalidOntology(String),

    /// A task-specific accessor was called on a response of another task.
    #[error("Wrong task: expected a {expected} response, found {found}")]
    WrongTask { expected: &'static str, found: MlTask },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The requested format / layout combination is not available.
    #[error("Unsupported option: {0}")]
    UnsupportedOption(String),

    /// Payload does not conform to the ontology.
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("Asset {external_id} has no pixel dimensions, required by {format}")]
    MissingDimensions {
        external_id: String,
        format: &'static str,
    },

    #[error("Invalid {format} input: {message}")]
    InvalidImport {
        format: &'static str,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl KiliError {
    pub(crate) fn label(message: impl Into<String>) -> Self {
        Self::InvalidLabel(message.into())
    }

    pub(crate) fn geometry(message: impl Into<String>) -> Self {
        Self::InvalidGeometry(message.into())
    }

    pub(crate) fn ontology(message: impl Into<String>) -> Self {
        Self::InvalidOntology(message.into())
    }
}
