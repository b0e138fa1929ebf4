//! Receiving side of a transfer session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::AppEvent;

use super::constants::{BUFFER_SIZE, PROGRESS_EVERY_BUFFERS, READ_IDLE_TIMEOUT};
use super::protocol::{self, FileMetadata, FrameType, Request};
use super::utils::{format_speed, next_available_path, sanitize_file_name, sanitize_rel_path};

/// Decision hook invoked once the request frame is parsed; returning false
/// answers with a Denied frame. The default used by hosts that do not
/// install one rejects everything.
pub type RequestCallback = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// A callback that denies every request, the safe default.
pub fn deny_all_requests() -> RequestCallback {
    Arc::new(|_| false)
}

/// Run the receiver's half of the protocol over an established stream.
///
/// Frame headers are consumed only at known boundaries: at session start,
/// and between files once each declared payload has been drained. Returns
/// `Ok(false)` when the request was denied, `Ok(true)` after a completed
/// session.
pub async fn receive_session<S>(
    stream: &mut S,
    download_root: &Path,
    on_request: &RequestCallback,
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: &CancellationToken,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = read_header_bounded(stream).await?;
    if header.frame_type != FrameType::Request {
        let _ = protocol::write_control(stream, FrameType::Error).await;
        bail!("expected request frame, got {:?}", header.frame_type);
    }
    let request = protocol::read_request(stream).await?;

    if !(on_request)(&request) {
        protocol::write_control(stream, FrameType::Denied).await?;
        tracing::info!(
            "denied request for {} files ({} bytes)",
            request.file_count,
            request.total_size
        );
        return Ok(false);
    }
    protocol::write_control(stream, FrameType::Ack).await?;

    let _ = event_tx
        .send(AppEvent::Status(format!(
            "receiving {} files ({} bytes)",
            request.file_count, request.total_size
        )))
        .await;

    let mut files_written: u32 = 0;
    let mut bytes_written: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            bail!("transfer cancelled");
        }

        let header = read_header_bounded(stream).await?;
        match header.frame_type {
            FrameType::FileMetadata => {
                let metadata = protocol::read_metadata(stream, &header).await?;
                let target = write_file(stream, download_root, &metadata, event_tx, cancel)
                    .await
                    .with_context(|| format!("failed receiving {}", metadata.name))?;
                files_written += 1;
                bytes_written += metadata.size;
                let _ = event_tx
                    .send(AppEvent::FileReceived {
                        file_name: metadata.name.clone(),
                        target,
                    })
                    .await;
            }
            FrameType::End => break,
            other => {
                let _ = protocol::write_control(stream, FrameType::Error).await;
                bail!("unexpected {other:?} frame during file stream");
            }
        }
    }

    tracing::info!(
        "session complete, {files_written} of {} files written ({bytes_written} bytes)",
        request.file_count
    );
    Ok(true)
}

/// Create the file's directory under the download root, pick a
/// non-colliding target name, and copy exactly the declared number of
/// bytes. A short stream leaves the partial file in place for the user to
/// inspect and fails the session.
async fn write_file<S>(
    stream: &mut S,
    download_root: &Path,
    metadata: &FileMetadata,
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: &CancellationToken,
) -> Result<PathBuf>
where
    S: AsyncRead + Unpin,
{
    let dir = download_root.join(sanitize_rel_path(&metadata.path));
    create_dirs(&dir)
        .await
        .with_context(|| format!("cannot create {}", dir.display()))?;

    let name = sanitize_file_name(&metadata.name);
    let target = next_available_path(&dir, &name)?;
    let mut file = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("cannot create {}", target.display()))?;

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut remaining = metadata.size;
    let mut buffers: u64 = 0;
    let started = Instant::now();

    while remaining > 0 {
        if cancel.is_cancelled() {
            bail!("transfer cancelled");
        }

        let want = remaining.min(BUFFER_SIZE as u64) as usize;
        let read = match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read(&mut buffer[..want])).await {
            Ok(read) => read?,
            Err(_) => {
                let _ = file.flush().await;
                bail!("read timed out, partial file at {}", target.display());
            }
        };
        if read == 0 {
            let _ = file.flush().await;
            bail!(
                "stream ended {remaining} bytes early, partial file at {}",
                target.display()
            );
        }

        file.write_all(&buffer[..read]).await?;
        remaining -= read as u64;
        buffers += 1;

        let done = metadata.size - remaining;
        if remaining == 0 || buffers % PROGRESS_EVERY_BUFFERS == 0 {
            let _ = event_tx
                .send(AppEvent::TransferProgress {
                    file_name: metadata.name.clone(),
                    progress: (done as f32 / metadata.size.max(1) as f32) * 100.0,
                    speed: format_speed(done, started.elapsed().as_secs_f64()),
                    is_sending: false,
                })
                .await;
        }
    }

    file.flush().await?;
    Ok(target)
}

async fn create_dirs(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(dir).await
}

/// Read the next header with the idle-read deadline applied.
async fn read_header_bounded<S>(stream: &mut S) -> Result<protocol::Header>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(READ_IDLE_TIMEOUT, protocol::read_header(stream))
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for next frame"))?
}
