//! End-to-end transfer scenarios between two TOFU endpoints on localhost:
//! first contact, pinned reconnect, certificate change, rejection, multiple
//! files with subdirectories, and collision renaming.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gobyte_core::tofu::{NewPeerCallback, Tofu};
use gobyte_core::transfer::{receive_session, send_files, FileOffer, RequestCallback};
use gobyte_core::AppEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Node {
    tofu: Tofu,
    cert_dir: PathBuf,
    trust_dir: PathBuf,
    prompts: Arc<AtomicUsize>,
    _dirs: tempfile::TempDir,
}

/// Build a fresh endpoint with its own cert and trust directories and an
/// approving, counting new-peer callback.
fn node(identity: &str) -> Node {
    let dirs = tempfile::tempdir().unwrap();
    let cert_dir = dirs.path().join("cert");
    let trust_dir = dirs.path().join("trust");
    let (tofu, prompts) = tofu_at(&cert_dir, &trust_dir, identity);
    Node {
        tofu,
        cert_dir,
        trust_dir,
        prompts,
        _dirs: dirs,
    }
}

/// (Re)open an endpoint over existing directories, with a fresh prompt
/// counter.
fn tofu_at(cert_dir: &Path, trust_dir: &Path, identity: &str) -> (Tofu, Arc<AtomicUsize>) {
    let prompts = Arc::new(AtomicUsize::new(0));
    let counter = prompts.clone();
    let on_new_peer: NewPeerCallback = Arc::new(move |_, fingerprint| {
        assert!(fingerprint.starts_with("sha256:"));
        counter.fetch_add(1, Ordering::SeqCst);
        true
    });
    let tofu = Tofu::new(identity, cert_dir, trust_dir, on_new_peer).unwrap();
    (tofu, prompts)
}

fn accept_requests() -> RequestCallback {
    Arc::new(|_| true)
}

fn events() -> mpsc::Sender<AppEvent> {
    let (tx, mut rx) = mpsc::channel(256);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    tx
}

fn offer(dir: &Path, name: &str) -> FileOffer {
    let abs_path = dir.join(name);
    FileOffer {
        name: name.to_string(),
        rel_path: ".".to_string(),
        size: fs::metadata(&abs_path).unwrap().len(),
        abs_path,
    }
}

/// Listen on an ephemeral port and serve exactly one session.
async fn serve_once(
    tofu: &Tofu,
    download_root: PathBuf,
    on_request: RequestCallback,
) -> (SocketAddr, tokio::task::JoinHandle<anyhow::Result<bool>>) {
    let listener = tofu
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _peer, _) = listener.accept().await?;
        let event_tx = events();
        let cancel = CancellationToken::new();
        receive_session(&mut stream, &download_root, &on_request, &event_tx, &cancel).await
    });

    (addr, handle)
}

async fn send_to(tofu: &Tofu, addr: SocketAddr, offers: &[FileOffer]) -> anyhow::Result<u32> {
    let event_tx = events();
    let cancel = CancellationToken::new();
    let summary = send_files(tofu, addr, offers, &event_tx, &cancel).await?;
    Ok(summary.files_sent)
}

#[tokio::test]
async fn test_first_contact_transfer() {
    let alice = node("alice");
    let bob = node("bob");
    let downloads = tempfile::tempdir().unwrap();

    let (addr, server) = serve_once(&bob.tofu, downloads.path().into(), accept_requests()).await;

    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("hello.txt"), b"hello world").unwrap();

    let sent = send_to(&alice.tofu, addr, &[offer(source.path(), "hello.txt")])
        .await
        .unwrap();
    assert_eq!(sent, 1);
    assert!(server.await.unwrap().unwrap());

    assert_eq!(
        fs::read_to_string(downloads.path().join("hello.txt")).unwrap(),
        "hello world"
    );

    // Both sides saw an unknown peer exactly once and pinned it.
    let pinned = fs::read_to_string(bob.trust_dir.join("alice")).unwrap();
    assert!(pinned.starts_with("sha256:"));
    assert!(fs::read_to_string(alice.trust_dir.join("bob"))
        .unwrap()
        .starts_with("sha256:"));
    assert_eq!(bob.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(alice.prompts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pinned_reconnect_skips_prompt() {
    let alice = node("alice");
    let bob = node("bob");
    let downloads = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();

    fs::write(source.path().join("first.txt"), b"hello world").unwrap();
    let (addr, server) = serve_once(&bob.tofu, downloads.path().into(), accept_requests()).await;
    send_to(&alice.tofu, addr, &[offer(source.path(), "first.txt")])
        .await
        .unwrap();
    server.await.unwrap().unwrap();

    // Fresh endpoints over the same directories: certificates are reloaded,
    // fingerprints are already pinned, so no prompt fires the second time.
    let (alice2, alice2_prompts) = tofu_at(&alice.cert_dir, &alice.trust_dir, "alice");
    let (bob2, bob2_prompts) = tofu_at(&bob.cert_dir, &bob.trust_dir, "bob");

    fs::write(source.path().join("second.txt"), b"again").unwrap();
    let (addr, server) = serve_once(&bob2, downloads.path().into(), accept_requests()).await;
    send_to(&alice2, addr, &[offer(source.path(), "second.txt")])
        .await
        .unwrap();
    server.await.unwrap().unwrap();

    assert_eq!(
        fs::read_to_string(downloads.path().join("second.txt")).unwrap(),
        "again"
    );
    assert_eq!(alice2_prompts.load(Ordering::SeqCst), 0);
    assert_eq!(bob2_prompts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_changed_certificate_is_refused() {
    let alice = node("alice");
    let bob = node("bob");
    let downloads = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();

    fs::write(source.path().join("hello.txt"), b"hello world").unwrap();
    let (addr, server) = serve_once(&bob.tofu, downloads.path().into(), accept_requests()).await;
    send_to(&alice.tofu, addr, &[offer(source.path(), "hello.txt")])
        .await
        .unwrap();
    server.await.unwrap().unwrap();
    let pinned_before = fs::read_to_string(bob.trust_dir.join("alice")).unwrap();

    // Wipe alice's certificate so a new key is generated under the same
    // identity.
    fs::remove_dir_all(&alice.cert_dir).unwrap();
    let (alice2, _) = tofu_at(&alice.cert_dir, &alice.trust_dir, "alice");

    let listener = bob
        .tofu
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

    let result = send_to(&alice2, addr, &[offer(source.path(), "hello.txt")]).await;
    assert!(result.is_err(), "handshake with a changed key must fail");
    assert!(server.await.unwrap().is_err());

    // The pin is untouched.
    assert_eq!(
        fs::read_to_string(bob.trust_dir.join("alice")).unwrap(),
        pinned_before
    );
}

#[tokio::test]
async fn test_rejected_request_creates_nothing() {
    let alice = node("alice");
    let bob = node("bob");
    let downloads = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("hello.txt"), b"hello world").unwrap();

    let deny: RequestCallback = Arc::new(|_| false);
    let (addr, server) = serve_once(&bob.tofu, downloads.path().into(), deny).await;

    let err = send_to(&alice.tofu, addr, &[offer(source.path(), "hello.txt")])
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("rejected"), "{err:#}");

    // Denial is a clean outcome for the receiver; nothing hit the disk.
    assert!(!server.await.unwrap().unwrap());
    assert_eq!(fs::read_dir(downloads.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_multiple_files_with_subdirectory() {
    let alice = node("alice");
    let bob = node("bob");
    let downloads = tempfile::tempdir().unwrap();

    let source = tempfile::tempdir().unwrap();
    fs::create_dir(source.path().join("docs")).unwrap();
    fs::write(source.path().join("docs/a.txt"), b"aaaaa").unwrap();
    fs::write(source.path().join("docs/b.txt"), b"bbbbb").unwrap();

    let offers = vec![
        FileOffer {
            name: "a.txt".to_string(),
            rel_path: "docs".to_string(),
            abs_path: source.path().join("docs/a.txt"),
            size: 5,
        },
        FileOffer {
            name: "b.txt".to_string(),
            rel_path: "docs".to_string(),
            abs_path: source.path().join("docs/b.txt"),
            size: 5,
        },
    ];

    let (addr, server) = serve_once(&bob.tofu, downloads.path().into(), accept_requests()).await;
    let sent = send_to(&alice.tofu, addr, &offers).await.unwrap();
    assert_eq!(sent, 2);
    server.await.unwrap().unwrap();

    assert_eq!(
        fs::read(downloads.path().join("docs/a.txt")).unwrap(),
        b"aaaaa"
    );
    assert_eq!(
        fs::read(downloads.path().join("docs/b.txt")).unwrap(),
        b"bbbbb"
    );
}

#[tokio::test]
async fn test_collision_renames_incoming_file() {
    let alice = node("alice");
    let bob = node("bob");
    let downloads = tempfile::tempdir().unwrap();
    fs::write(downloads.path().join("foo.bin"), [0x00]).unwrap();

    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("foo.bin"), [0xFF, 0xFF, 0xFF]).unwrap();

    let (addr, server) = serve_once(&bob.tofu, downloads.path().into(), accept_requests()).await;
    send_to(&alice.tofu, addr, &[offer(source.path(), "foo.bin")])
        .await
        .unwrap();
    server.await.unwrap().unwrap();

    // The pre-existing file is untouched; the incoming one got the suffix.
    assert_eq!(fs::read(downloads.path().join("foo.bin")).unwrap(), [0x00]);
    assert_eq!(
        fs::read(downloads.path().join("foo (1).bin")).unwrap(),
        [0xFF, 0xFF, 0xFF]
    );
}
