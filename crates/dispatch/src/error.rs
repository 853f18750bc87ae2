use kaleido_core::format::Converter;
use kaleido_devtools::link::LinkError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The pairing lane has been retired.
    #[error("cancelled: shutting down")]
    ShutDown,

    #[error("{}", .0.missing_message())]
    MissingConverter(Converter),

    #[error("Failed to create context: {0}")]
    ContextCreation(#[from] LinkError),
}
