//! HTTP layer built on the Warp framework.
//!
//! [`relay`] contains the single route of the service, [`warp`] the server and body plumbing
//! and [`error`] the mapping from errors to HTTP responses.

use bytesize::KIB;
use serde::Serialize;

pub mod error;
pub mod relay;
pub mod warp;

/// Largest accepted request body (64 KiB).
pub const MAX_BODY_SIZE: u64 = 64 * KIB;

/// The JSON body of every response, successful or not.
#[derive(Clone, Serialize, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
}

impl Envelope {
    pub fn ok() -> Self {
        Envelope {
            success: true,
            message: "ok".to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Envelope {
            success: false,
            message: message.into(),
        }
    }
}
