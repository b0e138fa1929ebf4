//! TLS file transfer: wire protocol, sender and receiver state machines,
//! and the accept loop for inbound sessions.

pub mod constants;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod utils;

pub use constants::TRANSFER_PORT;
pub use receiver::{deny_all_requests, receive_session, RequestCallback};
pub use sender::{send_files, TransferSummary};
pub use server::run_server;
pub use utils::{resolve_files, FileOffer};
