use thiserror::Error;

/// The first required field found missing in a check definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("check {id} ({check_type}) is missing required field {field}")]
pub struct ValidationError {
    pub id: String,
    pub check_type: String,
    pub field: String,
}

/// Reasons a definition cannot become a runnable check
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("unknown check type '{check_type}' for check {id}")]
    UnknownType { id: String, check_type: String },

    #[error("check {id} ({check_type}) has a malformed definition: {source}")]
    Parse {
        id: String,
        check_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
