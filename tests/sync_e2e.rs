use anyhow::Result;
use deltatar::bitmap::PresenceBitmap;
use deltatar::client::open_tgz;
use deltatar::logger::NoopLogger;
use deltatar::server::{serve_listener, ServerState};
use deltatar::{
    ClientConfig, HttpTransport, MergeOrder, ServerConfig, SyncClient, SyncReport, Transport,
    Verbosity,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tar::{Builder, EntryType, Header};

enum Item<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
}

fn write_archive(path: &Path, items: &[Item]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    for item in items {
        let mut h = Header::new_gnu();
        h.set_mtime(1_700_000_000);
        match item {
            Item::Dir(name) => {
                h.set_entry_type(EntryType::Directory);
                h.set_mode(0o755);
                h.set_size(0);
                builder.append_data(&mut h, name, std::io::empty())?;
            }
            Item::File(name, body) => {
                h.set_entry_type(EntryType::Regular);
                h.set_mode(0o644);
                h.set_size(body.len() as u64);
                builder.append_data(&mut h, name, *body)?;
            }
            Item::Symlink(name, target) => {
                h.set_entry_type(EntryType::Symlink);
                h.set_mode(0o777);
                h.set_size(0);
                builder.append_link(&mut h, name, target)?;
            }
        }
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

fn write_file(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, body)?;
    Ok(())
}

/// (name, entry type, body) of every entry in a finished archive.
fn read_archive(path: &Path) -> Result<Vec<(String, EntryType, Vec<u8>)>> {
    let mut archive = open_tgz(path)?;
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
        let kind = entry.header().entry_type();
        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        out.push((name, kind, body));
    }
    Ok(out)
}

struct TestServer {
    root: tempfile::TempDir,
    base: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(fingerprint: bool) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            root: root.path().to_path_buf(),
            fingerprint,
            verbosity: Verbosity::Quiet,
            ..ServerConfig::default()
        };
        let state = Arc::new(ServerState::new(config)?);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let handle = tokio::spawn(async move {
            let _ = serve_listener(listener, state).await;
        });
        Ok(Self { root, base, handle })
    }

    fn url(&self, name: &str) -> String {
        format!("{}/{}", self.base, name)
    }

    fn archive_path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn sync(url: String, dest: PathBuf, reference: PathBuf, order: MergeOrder) -> Result<SyncReport> {
    tokio::task::spawn_blocking(move || {
        let mut config = ClientConfig::new(url.clone(), dest, reference);
        config.merge_order = order;
        config.verbosity = Verbosity::Quiet;
        config.io_timeout = Duration::from_secs(30);
        let transport = HttpTransport::new(url, config.io_timeout);
        SyncClient::new(transport, config, Arc::new(NoopLogger)).run()
    })
    .await?
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetches_only_missing_files() -> Result<()> {
    let server = TestServer::start(true).await?;
    write_archive(
        &server.archive_path("a.tgz"),
        &[
            Item::Dir("a/"),
            Item::File("a/x", b"AAAA"),
            Item::File("a/y", b"BBBB"),
            Item::File("a/empty", b""),
            Item::Symlink("a/link", "x"),
        ],
    )?;

    let reference = tempfile::tempdir()?;
    write_file(&reference.path().join("a/x"), b"AAAA")?;
    let out = tempfile::tempdir()?;
    let dest = out.path().join("a.tgz");

    let report = sync(
        server.url("a.tgz"),
        dest.clone(),
        reference.path().to_path_buf(),
        MergeOrder::Original,
    )
    .await?;
    assert!(report.diff_requested);
    assert_eq!(report.reused, 1);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.regular_files, 2);

    let entries = read_archive(&dest)?;
    let names: Vec<&str> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(names, vec!["a", "a/x", "a/y", "a/empty", "a/link"]);
    assert_eq!(entries[1].2, b"AAAA");
    assert_eq!(entries[2].2, b"BBBB");
    assert!(entries[3].2.is_empty());
    assert_eq!(entries[4].1, EntryType::Symlink);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_reference_file_is_fetched() -> Result<()> {
    let server = TestServer::start(true).await?;
    write_archive(
        &server.archive_path("a.tgz"),
        &[Item::File("x", b"server copy"), Item::File("y", b"same")],
    )?;

    let reference = tempfile::tempdir()?;
    write_file(&reference.path().join("x"), b"local copy")?;
    write_file(&reference.path().join("y"), b"same")?;
    let out = tempfile::tempdir()?;
    let dest = out.path().join("a.tgz");

    let report = sync(
        server.url("a.tgz"),
        dest.clone(),
        reference.path().to_path_buf(),
        MergeOrder::Appended,
    )
    .await?;
    assert_eq!(report.fetched, 1);
    assert_eq!(report.reused, 1);

    let entries = read_archive(&dest)?;
    assert_eq!(entries[0].0, "y");
    assert_eq!(entries[1].0, "x");
    assert_eq!(entries[1].2, b"server copy");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_sync_needs_no_diff() -> Result<()> {
    let server = TestServer::start(true).await?;
    write_archive(
        &server.archive_path("a.tgz"),
        &[Item::File("x", b"one"), Item::File("y", b"two")],
    )?;

    let reference = tempfile::tempdir()?;
    write_file(&reference.path().join("x"), b"one")?;
    write_file(&reference.path().join("y"), b"two")?;
    let out = tempfile::tempdir()?;

    for _ in 0..2 {
        let report = sync(
            server.url("a.tgz"),
            out.path().join("a.tgz"),
            reference.path().to_path_buf(),
            MergeOrder::Original,
        )
        .await?;
        assert!(!report.diff_requested);
        assert_eq!(report.diff_bytes, 0);
        assert_eq!(report.reused, 2);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_archive() -> Result<()> {
    let server = TestServer::start(true).await?;
    write_archive(&server.archive_path("empty.tgz"), &[])?;

    let reference = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    let dest = out.path().join("empty.tgz");
    let report = sync(
        server.url("empty.tgz"),
        dest.clone(),
        reference.path().to_path_buf(),
        MergeOrder::Original,
    )
    .await?;
    assert_eq!(report.entries, 0);
    assert!(!report.diff_requested);
    assert!(read_archive(&dest)?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_names_survive_the_round_trip() -> Result<()> {
    let server = TestServer::start(true).await?;
    let long_dir = "d".repeat(120);
    let reused = format!("{}/kept-{}", long_dir, "k".repeat(40));
    let fetched = format!("{}/fetched-{}", long_dir, "f".repeat(40));
    write_archive(
        &server.archive_path("long.tgz"),
        &[
            Item::File(&reused, b"local"),
            Item::File(&fetched, b"remote"),
        ],
    )?;

    let reference = tempfile::tempdir()?;
    write_file(&reference.path().join(&reused), b"local")?;
    let out = tempfile::tempdir()?;
    let dest = out.path().join("long.tgz");
    let report = sync(
        server.url("long.tgz"),
        dest.clone(),
        reference.path().to_path_buf(),
        MergeOrder::Original,
    )
    .await?;
    assert_eq!(report.reused, 1);
    assert_eq!(report.fetched, 1);

    let entries = read_archive(&dest)?;
    assert_eq!(entries[0].0, reused);
    assert_eq!(entries[1].0, fetched);
    assert_eq!(entries[1].2, b"remote");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_errors() -> Result<()> {
    let server = TestServer::start(true).await?;
    write_archive(&server.archive_path("a.tgz"), &[Item::File("x", b"1")])?;
    let missing = server.url("missing.tgz");
    let present = server.url("a.tgz");

    let statuses = tokio::task::spawn_blocking(move || {
        let status = |r: Result<ureq::Response, ureq::Error>| match r {
            Ok(resp) => resp.status(),
            Err(ureq::Error::Status(code, _)) => code,
            Err(e) => panic!("transport error: {e}"),
        };
        vec![
            status(ureq::get(&missing).call()),
            status(ureq::put(&present).send_bytes(b"")),
            status(ureq::post(&present).send_bytes(b"not gzip")),
        ]
    })
    .await?;
    assert_eq!(statuses, vec![404, 405, 400]);

    let out = tempfile::tempdir()?;
    let reference = tempfile::tempdir()?;
    let err = sync(
        server.url("missing.tgz"),
        out.path().join("missing.tgz"),
        reference.path().to_path_buf(),
        MergeOrder::Original,
    )
    .await
    .unwrap_err();
    assert!(format!("{:#}", err).contains("404"));
    assert!(!out.path().join("missing.tgz").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replaced_archive_is_rejected() -> Result<()> {
    let server = TestServer::start(true).await?;
    let archive = server.archive_path("a.tgz");
    write_archive(&archive, &[Item::File("x", b"old")])?;
    let url = server.url("a.tgz");

    let err = tokio::task::spawn_blocking(move || -> Result<String> {
        let transport = HttpTransport::new(url, Duration::from_secs(30));
        let index = transport.fetch_index()?;
        assert!(index.fingerprint.is_some());

        write_archive(&archive, &[Item::File("x", b"new")])?;
        let bitmap = PresenceBitmap::from_bytes(vec![0x80]).encode_gz()?;
        match transport.fetch_diff(bitmap, index.fingerprint.as_deref()) {
            Ok(_) => Ok(String::new()),
            Err(e) => Ok(format!("{:#}", e)),
        }
    })
    .await??;
    assert!(err.contains("412"), "unexpected: {err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fingerprints_can_be_disabled() -> Result<()> {
    let server = TestServer::start(false).await?;
    write_archive(&server.archive_path("a.tgz"), &[Item::File("x", b"1")])?;
    let url = server.url("a.tgz");

    let fingerprint = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        Ok(HttpTransport::new(url, Duration::from_secs(30))
            .fetch_index()?
            .fingerprint)
    })
    .await??;
    assert!(fingerprint.is_none());
    Ok(())
}
