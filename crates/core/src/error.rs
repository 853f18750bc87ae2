#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unknown {entity}: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}
