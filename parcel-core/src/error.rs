//! Failures of the share and receive pipelines

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;
use crate::ticket::TicketError;

#[derive(Debug, Error)]
pub enum ParcelError {
    #[error("Failed to start blob engine: {0}")]
    EngineStartFailed(String),

    #[error("Ingestion failed: {0}")]
    IngestionFailed(String),

    #[error("Invalid ticket: {0}")]
    InvalidTicket(#[from] TicketError),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Failed to materialize content at {path}: {reason}")]
    MaterializationFailed { path: PathBuf, reason: String },

    #[error("Blob engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, ParcelError>;
