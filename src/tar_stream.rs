//! Sequential tar entry passthrough and streaming helpers
//!
//! Every transform in this crate reads one tar stream entry by entry and
//! writes another. Entries keep their header (mode, owner, timestamps, link
//! target) verbatim; only the size and, for index entries, the payload change.

use crate::counter;
use axum::body::Bytes;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tar::{Builder, Entry, EntryType, Header};
use tokio::sync::mpsc;

/// Header and logical metadata of one archive entry.
///
/// `path`, `link` and `size` are the values after GNU/PAX extensions have
/// been applied, which may differ from what fits in the raw header.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub header: Header,
    pub path: PathBuf,
    pub link: Option<PathBuf>,
    pub size: u64,
}

impl EntryMeta {
    pub fn read<R: Read>(entry: &Entry<'_, R>) -> io::Result<Self> {
        Ok(Self {
            header: entry.header().clone(),
            path: entry.path()?.into_owned(),
            link: entry.link_name()?.map(|l| l.into_owned()),
            size: entry.size(),
        })
    }

    pub fn entry_type(&self) -> EntryType {
        self.header.entry_type()
    }

    /// True if this entry gets a RegularFileCounter value.
    pub fn is_counted(&self) -> bool {
        counter::is_counted(self.entry_type(), self.size)
    }

    pub fn name(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Write `meta` followed by `data` (which must yield exactly `meta.size` bytes).
pub fn append_entry<W: Write, R: Read>(
    out: &mut Builder<W>,
    meta: &EntryMeta,
    data: R,
) -> io::Result<()> {
    let mut header = meta.header.clone();
    header.set_size(meta.size);

    let path_fits = header.path().ok().as_deref() == Some(meta.path.as_path());
    let link_fits = match (&meta.link, header.link_name().ok().flatten()) {
        (None, _) => true,
        (Some(link), Some(raw)) => &*raw == link.as_path(),
        (Some(_), None) => false,
    };

    if path_fits && link_fits {
        header.set_cksum();
        return out.append(&header, data);
    }
    match &meta.link {
        Some(link) => out.append_link(&mut header, &meta.path, link),
        None => out.append_data(&mut header, &meta.path, data),
    }
}

/// Close the tar stream and the gzip stream around it.
pub fn finish_tgz<W: Write>(builder: Builder<GzEncoder<W>>) -> io::Result<W> {
    builder.into_inner()?.finish()
}

/// Item carried from a blocking transform to an HTTP response body.
pub type Chunk<E> = Result<Bytes, E>;

/// Channel writer that sends data through a bounded mpsc channel
pub struct ChannelWriter<E> {
    tx: mpsc::Sender<Chunk<E>>,
    buffer: Vec<u8>,
    chunk_size: usize,
    sent: u64,
}

impl<E> ChannelWriter<E> {
    /// A `chunk_size` of zero is treated as one byte.
    pub fn new(tx: mpsc::Sender<Chunk<E>>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            tx,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            sent: 0,
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.sent += chunk.len() as u64;
            self.tx
                .blocking_send(Ok(Bytes::from(chunk)))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response receiver dropped"))?;
        }
        Ok(())
    }

    /// Bytes handed to the channel so far (excludes anything still buffered).
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Drop buffered output and report `err` to the receiver instead.
    pub fn fail(mut self, err: E) {
        self.buffer.clear();
        let _ = self.tx.blocking_send(Err(err));
    }
}

impl<E> Write for ChannelWriter<E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let available = self.chunk_size - self.buffer.len();
            let to_write = remaining.len().min(available);

            self.buffer.extend_from_slice(&remaining[..to_write]);
            written += to_write;
            remaining = &remaining[to_write..];

            if self.buffer.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}
