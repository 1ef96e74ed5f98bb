//! Engine error types

use thiserror::Error;

/// Errors surfaced by the key-selection engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no available keys for model {model}")]
    NoKeyAvailable { model: String },
}
