//! Accept loop for inbound transfer sessions.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tofu::TofuListener;
use crate::AppEvent;

use super::receiver::{receive_session, RequestCallback};

/// Accept TOFU-authenticated connections until cancelled, one task per
/// session. A failed handshake or session only affects that connection; the
/// loop keeps accepting.
pub async fn run_server(
    listener: TofuListener,
    download_root: PathBuf,
    on_request: RequestCallback,
    event_tx: mpsc::Sender<AppEvent>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (mut stream, peer, remote_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("accept failed: {err:#}");
                continue;
            }
        };

        tracing::info!("session from '{}' at {remote_addr}", peer.identity);
        let _ = event_tx
            .send(AppEvent::Status(format!(
                "incoming connection from '{}'",
                peer.identity
            )))
            .await;

        let download_root = download_root.clone();
        let on_request = on_request.clone();
        let event_tx = event_tx.clone();
        let cancel = cancel.child_token();

        tokio::spawn(async move {
            let result =
                receive_session(&mut stream, &download_root, &on_request, &event_tx, &cancel)
                    .await;
            if let Err(err) = &result {
                tracing::warn!("session from '{}' failed: {err:#}", peer.identity);
                let _ = event_tx
                    .send(AppEvent::Error(format!(
                        "session from '{}' failed: {err:#}",
                        peer.identity
                    )))
                    .await;
            }
            let _ = stream.shutdown().await;
        });
    }
}
