//! Client side of the sync: index download, local scan, diff request, merge.
//!
//! The whole sync is one sequential pipeline with blocking I/O. Every phase
//! either completes or fails the sync; there is no retry and no partial
//! result. Scratch files live in a temporary directory that disappears with
//! the sync, and the output archive is written beside its destination and
//! renamed into place only once it is complete.

use crate::bitmap::PresenceBitmap;
use crate::config::{ClientConfig, MergeOrder, Verbosity};
use crate::logger::Logger;
use crate::merge::{append_fetched, splice_fetched};
use crate::paths::ensure_parent_exists;
use crate::protocol::{timeouts, CONTENT_TYPE, FINGERPRINT_HEADER};
use crate::scan::{LocalDiffScanner, ScanOutcome};
use crate::tar_stream::finish_tgz;
use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tar::Builder;
use tempfile::{NamedTempFile, TempDir};
use tracing::{info, warn};

/// A response body plus the archive fingerprint the server attached to it.
pub struct Download {
    pub body: Box<dyn Read + Send>,
    pub fingerprint: Option<String>,
}

/// Request side of the protocol.
///
/// [`HttpTransport`] talks to a real server; tests plug in in-process
/// implementations.
pub trait Transport {
    /// `GET`: the gzip-compressed index of the source archive.
    fn fetch_index(&self) -> Result<Download>;

    /// `POST`: the gzip-compressed diff for a gzip-compressed bitmap.
    fn fetch_diff(&self, bitmap_gz: Vec<u8>, fingerprint: Option<&str>) -> Result<Download>;
}

/// Blocking HTTP transport for one source URL.
pub struct HttpTransport {
    url: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, io_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(timeouts::CONNECT_SECS))
            .timeout_read(io_timeout)
            .timeout_write(io_timeout)
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }

    fn download(&self, result: Result<ureq::Response, ureq::Error>, what: &str) -> Result<Download> {
        match result {
            Ok(resp) => Ok(Download {
                fingerprint: resp.header(FINGERPRINT_HEADER).map(str::to_string),
                body: Box::new(resp.into_reader()),
            }),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(anyhow!(
                    "{} request to {} failed with HTTP {}: {}",
                    what,
                    self.url,
                    code,
                    body.trim()
                ))
            }
            Err(e) => Err(anyhow!(e).context(format!("{} request to {} failed", what, self.url))),
        }
    }
}

impl Transport for HttpTransport {
    fn fetch_index(&self) -> Result<Download> {
        self.download(self.agent.get(&self.url).call(), "index")
    }

    fn fetch_diff(&self, bitmap_gz: Vec<u8>, fingerprint: Option<&str>) -> Result<Download> {
        let mut req = self.agent.post(&self.url).set("Content-Type", CONTENT_TYPE);
        if let Some(fp) = fingerprint {
            req = req.set(FINGERPRINT_HEADER, fp);
        }
        self.download(req.send_bytes(&bitmap_gz), "diff")
    }
}

/// Where a sync currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    RequestIndex,
    ScanLocal,
    RequestDiff,
    MergeDiff,
    Finalize,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPhase::RequestIndex => "requesting index",
            SyncPhase::ScanLocal => "scanning reference tree",
            SyncPhase::RequestDiff => "requesting missing files",
            SyncPhase::MergeDiff => "merging missing files",
            SyncPhase::Finalize => "finalizing archive",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        })
    }
}

/// Summary of a finished sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub destination: String,
    pub entries: u64,
    pub regular_files: u64,
    pub reused: u64,
    pub fetched: u64,
    pub bytes_reused: u64,
    pub index_bytes: u64,
    pub diff_bytes: u64,
    pub diff_requested: bool,
    pub merge_order: MergeOrder,
    pub seconds: f64,
}

type TgzBuilder = Builder<GzEncoder<BufWriter<NamedTempFile>>>;

pub struct SyncClient<T: Transport> {
    transport: T,
    config: ClientConfig,
    logger: Arc<dyn Logger>,
    phase: SyncPhase,
    progress: ProgressBar,
}

impl<T: Transport> SyncClient<T> {
    pub fn new(transport: T, config: ClientConfig, logger: Arc<dyn Logger>) -> Self {
        let progress = if config.verbosity == Verbosity::Normal {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            ProgressBar::hidden()
        };
        Self {
            transport,
            config,
            logger,
            phase: SyncPhase::RequestIndex,
            progress,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    fn enter(&mut self, phase: SyncPhase) {
        self.phase = phase;
        self.progress.set_message(phase.to_string());
        info!(phase = ?phase, "{}", phase);
    }

    /// Run every phase to completion.
    pub fn run(&mut self) -> Result<SyncReport> {
        let started = Instant::now();
        self.logger
            .start(&self.config.source_url, &self.config.destination);

        match self.run_phases(started) {
            Ok(report) => {
                self.enter(SyncPhase::Done);
                self.progress.finish_and_clear();
                self.logger
                    .done(report.reused, report.fetched, report.seconds);
                Ok(report)
            }
            Err(e) => {
                let failed_in = self.phase;
                self.phase = SyncPhase::Failed;
                self.progress.abandon_with_message(format!("failed while {}", failed_in));
                self.logger.error(&failed_in.to_string(), &format!("{:#}", e));
                warn!(phase = ?failed_in, "sync failed: {:#}", e);
                Err(e.context(format!("sync failed while {}", failed_in)))
            }
        }
    }

    fn run_phases(&mut self, started: Instant) -> Result<SyncReport> {
        let scratch = match &self.config.scratch_dir {
            Some(dir) => TempDir::with_prefix_in("deltatar-", dir),
            None => TempDir::with_prefix("deltatar-"),
        }
        .context("Failed to create scratch directory")?;

        self.enter(SyncPhase::RequestIndex);
        let index = self.transport.fetch_index()?;
        let fingerprint = index.fingerprint;
        let (mut index_file, index_bytes) = spool(index.body, scratch.path(), "index-")
            .context("Failed to download index")?;

        self.enter(SyncPhase::ScanLocal);
        ensure_parent_exists(&self.config.destination)?;
        let out_dir = self
            .config
            .destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let out_file = NamedTempFile::new_in(out_dir)
            .with_context(|| format!("Failed to create output in {}", out_dir.display()))?;
        let mut output: TgzBuilder = Builder::new(GzEncoder::new(
            BufWriter::new(out_file),
            Compression::default(),
        ));

        let scanner = LocalDiffScanner::new(
            &self.config.reference,
            scratch.path(),
            self.config.verbosity,
            self.logger.as_ref(),
        );
        let index_reader = MultiGzDecoder::new(BufReader::new(index_file.as_file_mut()));
        let mut partial = match self.config.merge_order {
            MergeOrder::Original => Some(
                tempfile::Builder::new()
                    .prefix("partial-")
                    .tempfile_in(scratch.path())
                    .context("Failed to create partial archive")?,
            ),
            MergeOrder::Appended => None,
        };

        let outcome = match partial.as_mut() {
            Some(file) => {
                let mut builder = Builder::new(BufWriter::new(file.as_file_mut()));
                let outcome = scanner.scan(index_reader, &mut builder)?;
                builder.into_inner()?.flush()?;
                outcome
            }
            None => scanner.scan(index_reader, &mut output)?,
        };
        drop(index_file);

        let ScanOutcome {
            bitmap,
            plan,
            stats,
        } = outcome;
        info!(
            entries = stats.entries,
            reused = stats.reused,
            missing = stats.missing,
            "local scan complete"
        );

        let mut fetched = 0;
        let mut diff_bytes = 0;
        let diff_requested = bitmap.any_set();
        if diff_requested {
            self.enter(SyncPhase::RequestDiff);
            let (mut diff_file, n) = self.request_diff(&bitmap, fingerprint.as_deref(), scratch.path())?;
            diff_bytes = n;

            self.enter(SyncPhase::MergeDiff);
            let diff_reader = MultiGzDecoder::new(BufReader::new(diff_file.as_file_mut()));
            fetched = match partial.as_mut() {
                Some(file) => {
                    let file = file.as_file_mut();
                    file.seek(SeekFrom::Start(0))?;
                    splice_fetched(
                        BufReader::new(file),
                        diff_reader,
                        &plan,
                        &mut output,
                        self.config.verbosity,
                        self.logger.as_ref(),
                    )?
                }
                None => append_fetched(
                    diff_reader,
                    &plan,
                    &mut output,
                    self.config.verbosity,
                    self.logger.as_ref(),
                )?,
            };
        } else if let Some(file) = partial.as_mut() {
            // Nothing to fetch: the partial archive is already complete
            let file = file.as_file_mut();
            file.seek(SeekFrom::Start(0))?;
            splice_fetched(
                BufReader::new(file),
                io::empty(),
                &plan,
                &mut output,
                self.config.verbosity,
                self.logger.as_ref(),
            )?;
        }

        self.enter(SyncPhase::Finalize);
        let out_file = finish_tgz(output)?
            .into_inner()
            .map_err(|e| e.into_error())?;
        out_file.as_file().sync_all()?;
        out_file
            .persist(&self.config.destination)
            .with_context(|| format!("Failed to write {}", self.config.destination.display()))?;

        Ok(SyncReport {
            source: self.config.source_url.clone(),
            destination: self.config.destination.display().to_string(),
            entries: stats.entries,
            regular_files: stats.regular_files,
            reused: stats.reused,
            fetched,
            bytes_reused: stats.bytes_reused,
            index_bytes,
            diff_bytes,
            diff_requested,
            merge_order: self.config.merge_order,
            seconds: started.elapsed().as_secs_f64(),
        })
    }

    fn request_diff(
        &self,
        bitmap: &PresenceBitmap,
        fingerprint: Option<&str>,
        scratch: &Path,
    ) -> Result<(NamedTempFile, u64)> {
        info!(
            "downloading {} missing files from {}",
            bitmap.count_set(),
            self.config.source_url
        );
        let body = bitmap.encode_gz()?;
        let diff = self.transport.fetch_diff(body, fingerprint)?;
        spool(diff.body, scratch, "diff-").context("Failed to download diff")
    }
}

/// Copy a response body into a scratch file and rewind it.
fn spool(mut body: Box<dyn Read + Send>, dir: &Path, prefix: &str) -> Result<(NamedTempFile, u64)> {
    let mut file = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
    let n = {
        let mut writer = BufWriter::new(file.as_file_mut());
        let n = io::copy(&mut body, &mut writer)?;
        writer.flush()?;
        n
    };
    file.as_file_mut().seek(SeekFrom::Start(0))?;
    Ok((file, n))
}

/// gzip-compressed tar as an in-memory [`Download`], for in-process transports.
pub fn memory_download(bytes: Vec<u8>, fingerprint: Option<String>) -> Download {
    Download {
        body: Box::new(io::Cursor::new(bytes)),
        fingerprint,
    }
}

/// Open a finished archive for inspection.
pub fn open_tgz(path: &Path) -> Result<tar::Archive<MultiGzDecoder<BufReader<File>>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(tar::Archive::new(MultiGzDecoder::new(BufReader::new(file))))
}
