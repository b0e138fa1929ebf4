//! Core of a LAN file transfer utility: UDP presence discovery, a
//! trust-on-first-use TLS transport, and a framed file transfer protocol.
//!
//! Frontends drive the core through [`discovery::Discovery`],
//! [`tofu::Tofu`] and the [`transfer`] module, receive progress through an
//! [`AppEvent`] channel, and supply the two policy callbacks (new-peer
//! approval and transfer-request approval).

pub mod config;
pub mod discovery;
pub mod tofu;
pub mod transfer;

use std::path::PathBuf;

/// Events reported from the core to a frontend.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),

    /// A new peer appeared in the presence table.
    PeerFound { name: String, endpoint: String },

    TransferProgress {
        file_name: String,
        /// Percent of the current file, 0.0 to 100.0.
        progress: f32,
        speed: String,
        is_sending: bool,
    },

    /// A file finished sending.
    TransferCompleted(String),

    /// A file finished writing on the receiving side.
    FileReceived { file_name: String, target: PathBuf },

    Error(String),
}

/// This instance's identity: the hostname, or a random fallback when the
/// hostname is unavailable. Also used as the certificate common name.
pub fn local_identity() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("unknown-{}", uuid::Uuid::new_v4()))
}
