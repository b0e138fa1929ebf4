//! Sending side of a transfer session.

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tofu::Tofu;
use crate::AppEvent;

use super::constants::{ACK_TIMEOUT, BUFFER_SIZE, PROGRESS_EVERY_BUFFERS};
use super::protocol::{self, FrameType, Request};
use super::utils::{format_speed, FileOffer};

/// Outcome of one completed session.
#[derive(Debug, Default, Clone)]
pub struct TransferSummary {
    pub files_sent: u32,
    pub bytes_sent: u64,
}

/// Dial a peer and run a full session over the authenticated stream:
/// request, decision, file streaming, end marker.
pub async fn send_files(
    tofu: &Tofu,
    addr: SocketAddr,
    files: &[FileOffer],
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: &CancellationToken,
) -> Result<TransferSummary> {
    let (mut stream, peer) = tofu.dial(addr).await?;

    let _ = event_tx
        .send(AppEvent::Status(format!(
            "connected to '{}' at {addr}",
            peer.identity
        )))
        .await;

    let summary = send_session(&mut stream, files, event_tx, cancel)
        .await
        .with_context(|| format!("transfer to '{}' failed", peer.identity))?;

    let _ = stream.shutdown().await;
    Ok(summary)
}

/// Run the sender's half of the protocol over an established stream.
pub async fn send_session<S>(
    stream: &mut S,
    files: &[FileOffer],
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: &CancellationToken,
) -> Result<TransferSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let total_size: u64 = files.iter().map(|offer| offer.size).sum();
    let request = Request::new(total_size, files.len() as u32)?;
    protocol::write_request(stream, &request).await?;

    // The receiver may sit on a confirmation prompt; bounded wait.
    let decision = tokio::time::timeout(ACK_TIMEOUT, protocol::read_header(stream))
        .await
        .map_err(|_| anyhow!("timed out waiting for transfer decision"))??;

    match decision.frame_type {
        FrameType::Ack => {}
        FrameType::Denied => bail!("request rejected by peer"),
        other => bail!("unexpected {other:?} frame while awaiting decision"),
    }

    let mut summary = TransferSummary::default();

    for (index, offer) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            bail!("transfer cancelled");
        }

        let _ = event_tx
            .send(AppEvent::Status(format!(
                "[{}/{}] sending {}",
                index + 1,
                files.len(),
                offer.name
            )))
            .await;

        let mut file = File::open(&offer.abs_path)
            .await
            .with_context(|| format!("cannot open {}", offer.abs_path.display()))?;

        let metadata = offer.metadata()?;
        protocol::write_metadata(stream, &metadata).await?;

        let written = copy_file(stream, &mut file, offer, event_tx, cancel).await?;
        if written != offer.size {
            bail!(
                "corrupted: file {} expected {} bytes, wrote {}",
                offer.name,
                offer.size,
                written
            );
        }

        summary.files_sent += 1;
        summary.bytes_sent += written;
        let _ = event_tx
            .send(AppEvent::TransferCompleted(offer.name.clone()))
            .await;
    }

    protocol::write_control(stream, FrameType::End).await?;
    Ok(summary)
}

/// Stream exactly the declared number of bytes from `file` to the wire.
/// Stops early (returning the short count) if the file ends before its
/// declared size; the caller treats that as corruption.
async fn copy_file<S>(
    stream: &mut S,
    file: &mut File,
    offer: &FileOffer,
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut written: u64 = 0;
    let mut buffers: u64 = 0;
    let started = Instant::now();

    while written < offer.size {
        if cancel.is_cancelled() {
            bail!("transfer cancelled");
        }

        let want = (offer.size - written).min(BUFFER_SIZE as u64) as usize;
        let read = file.read(&mut buffer[..want]).await?;
        if read == 0 {
            break;
        }
        stream.write_all(&buffer[..read]).await?;
        written += read as u64;
        buffers += 1;

        if written == offer.size || buffers % PROGRESS_EVERY_BUFFERS == 0 {
            let _ = event_tx
                .send(AppEvent::TransferProgress {
                    file_name: offer.name.clone(),
                    progress: (written as f32 / offer.size.max(1) as f32) * 100.0,
                    speed: format_speed(written, started.elapsed().as_secs_f64()),
                    is_sending: true,
                })
                .await;
        }
    }

    stream.flush().await?;
    Ok(written)
}
