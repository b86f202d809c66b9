//! Error types for the rustyl2cap library
//!
//! This module defines the errors reported by the HCI-facing collaborators.

use thiserror::Error;

/// Errors that can occur when handing commands or ACL data to the controller
#[derive(Error, Debug)]
pub enum HciError {
    #[error("HCI transport error: {0}")]
    SendError(#[from] std::io::Error),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,
}
