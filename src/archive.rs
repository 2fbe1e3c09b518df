//! Archive Builder / Streamer
//!
//! Turns a resolved [`PathState`] into a single zip or tar.gz byte stream.
//! Entries are produced one at a time on a dedicated thread and pushed
//! through a bounded channel, so at most one reconstructed file plus
//! `channel_capacity` encoded chunks are held in memory, whatever the size
//! of the restore.
//!
//! ## Walk order
//!
//! Directories are walked depth-first with children in lexicographic order.
//! Entry names are relative to the restored directory; a single-file restore
//! produces one entry named after the file. Tar archives carry an explicit
//! header for every directory. Zip archives only carry a directory marker
//! for directories left without entries once exclusions are applied, the
//! others are implied by their entries' paths.
//!
//! ## Failures
//!
//! - A file whose content cannot be rebuilt (missing object, bad diff,
//!   corrupt history) becomes a zero-length entry, is logged at `warn` and
//!   is listed in the [`RestoreReport`]. Its siblings are still written.
//! - Any other error (the chain turning unreadable, an encoder failure)
//!   aborts the stream: the consumer receives an error instead of a clean
//!   end of stream, and every later read returns the same error. A producer
//!   that dies without completing the archive is reported the same way.
//! - When the consumer goes away, the producer notices at the next write or
//!   entry boundary and stops.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rewind::archive::ArchiveBuilder;
//! use rewind::chain::IncrementChain;
//! use rewind::repository::Repository;
//! use rewind::resolver::PathResolver;
//! use rewind::storage::ObjectStore;
//! use rewind::types::{ArchiveKind, RewindConfig, Timestamp};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repository::open("/backups/laptop")?;
//! let resolver = PathResolver::new(Arc::new(IncrementChain::load(&repo)?));
//! let store = Arc::new(ObjectStore::new(repo.objects_dir(), true));
//!
//! let state = resolver.resolve("docs", Timestamp::new(1_700_000_000))?;
//! let builder = ArchiveBuilder::new(resolver, store, RewindConfig::default());
//! let mut stream = builder.stream(state, ArchiveKind::TarGz)?;
//!
//! let mut out = std::fs::File::create("docs.tar.gz")?;
//! std::io::copy(&mut stream, &mut out)?;
//! let report = stream.finish()?;
//! println!("{} files, {} failures", report.files_written, report.failures.len());
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RewindError};
use crate::resolver::{DirectoryState, FileState, PathResolver, PathState};
use crate::storage::ObjectStore;
use crate::types::{ArchiveKind, EntryFailure, RestorePhase, RestoreReport, RewindConfig};
use crate::utils::{join_path, parent_and_name};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, trace, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

type Chunk = Result<Vec<u8>>;

/// `Write` adapter that batches bytes into chunks on a bounded channel
///
/// Blocks when the channel is full. Fails with `BrokenPipe` once the
/// receiving side is gone.
pub(crate) struct ChannelWriter {
    sender: mpsc::Sender<Chunk>,
    buffer: Vec<u8>,
    chunk_size: usize,
    sent: u64,
    aborted: Arc<AtomicBool>,
}

impl ChannelWriter {
    pub(crate) fn new(sender: mpsc::Sender<Chunk>, chunk_size: usize, aborted: Arc<AtomicBool>) -> Self {
        Self {
            sender,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            sent: 0,
            aborted,
        }
    }

    /// Bytes delivered to the channel so far
    pub(crate) fn sent(&self) -> u64 {
        self.sent
    }

    /// Whether the consumer dropped or closed its end
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Discard buffered bytes and deliver an error in place of end-of-stream
    pub(crate) fn fail(&mut self, err: RewindError) {
        self.buffer.clear();
        if self.sender.blocking_send(Err(err)).is_err() {
            debug!("Archive consumer gone before the stream error could be delivered");
        }
    }

    fn send_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        let len = chunk.len() as u64;
        self.sender
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "archive consumer went away"))?;
        self.sent += len;
        Ok(())
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(io::Error::other("archive stream aborted"));
        }
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= self.chunk_size {
            self.send_buffer()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(io::Error::other("archive stream aborted"));
        }
        self.send_buffer()
    }
}

/// Permissions and times of one archive entry
#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    mode: u32,
    mtime: i64,
    size: u64,
}

impl EntryMeta {
    fn file(file: &FileState) -> Self {
        Self {
            mode: file.mode,
            mtime: file.mtime,
            size: file.size,
        }
    }

    fn directory(dir: &DirectoryState) -> Self {
        Self {
            mode: dir.mode,
            mtime: dir.mtime,
            size: 0,
        }
    }

    fn placeholder(mode: u32, mtime: i64) -> Self {
        Self { mode, mtime, size: 0 }
    }
}

/// One archive container format
///
/// `begin_directory` runs before a directory's children and
/// `end_directory` after them, with the number of entries written inside.
trait EntrySink {
    fn begin_directory(&mut self, name: &str, meta: &EntryMeta) -> Result<()>;
    fn end_directory(&mut self, name: &str, meta: &EntryMeta, entries: usize) -> Result<()>;
    fn add_file(&mut self, name: &str, meta: &EntryMeta, content: &[u8]) -> Result<()>;
    fn finish(self) -> Result<()>;
}

struct ZipSink<'a> {
    writer: ZipWriter<zip::write::StreamWriter<&'a mut ChannelWriter>>,
    method: CompressionMethod,
}

impl<'a> ZipSink<'a> {
    fn new(channel: &'a mut ChannelWriter, deflate: bool) -> Self {
        Self {
            writer: ZipWriter::new_stream(channel),
            method: if deflate {
                CompressionMethod::Deflated
            } else {
                CompressionMethod::Stored
            },
        }
    }

    fn options(&self, meta: &EntryMeta) -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(self.method)
            .unix_permissions(meta.mode & 0o7777)
            .last_modified_time(zip_time(meta.mtime))
            .large_file(meta.size >= u64::from(u32::MAX))
    }
}

impl EntrySink for ZipSink<'_> {
    fn begin_directory(&mut self, _name: &str, _meta: &EntryMeta) -> Result<()> {
        Ok(())
    }

    fn end_directory(&mut self, name: &str, meta: &EntryMeta, entries: usize) -> Result<()> {
        if entries == 0 {
            let options = self.options(meta);
            self.writer.add_directory(format!("{}/", name), options)?;
        }
        Ok(())
    }

    fn add_file(&mut self, name: &str, meta: &EntryMeta, content: &[u8]) -> Result<()> {
        let options = self.options(meta);
        self.writer.start_file(name, options)?;
        self.writer.write_all(content)?;
        Ok(())
    }

    fn finish(self) -> Result<()> {
        self.writer.finish()?;
        Ok(())
    }
}

struct TarGzSink<'a> {
    builder: tar::Builder<GzEncoder<&'a mut ChannelWriter>>,
}

impl<'a> TarGzSink<'a> {
    fn new(channel: &'a mut ChannelWriter, level: u32) -> Self {
        Self {
            builder: tar::Builder::new(GzEncoder::new(channel, Compression::new(level))),
        }
    }

    fn header(meta: &EntryMeta, entry_type: tar::EntryType) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(meta.size);
        header.set_mode(meta.mode & 0o7777);
        header.set_mtime(meta.mtime.max(0) as u64);
        header
    }
}

impl EntrySink for TarGzSink<'_> {
    fn begin_directory(&mut self, name: &str, meta: &EntryMeta) -> Result<()> {
        let mut header = Self::header(meta, tar::EntryType::Directory);
        self.builder.append_data(&mut header, name, io::empty())?;
        Ok(())
    }

    fn end_directory(&mut self, _name: &str, _meta: &EntryMeta, _entries: usize) -> Result<()> {
        Ok(())
    }

    fn add_file(&mut self, name: &str, meta: &EntryMeta, content: &[u8]) -> Result<()> {
        let mut header = Self::header(
            &EntryMeta {
                size: content.len() as u64,
                ..*meta
            },
            tar::EntryType::Regular,
        );
        self.builder.append_data(&mut header, name, content)?;
        Ok(())
    }

    fn finish(self) -> Result<()> {
        self.builder.into_inner()?.finish()?;
        Ok(())
    }
}

/// Zip timestamps are local DOS times from 1980 to 2107; out-of-range
/// values fall back to the format's epoch
fn zip_time(mtime: i64) -> zip::DateTime {
    Utc.timestamp_opt(mtime, 0)
        .single()
        .and_then(|dt| {
            zip::DateTime::from_date_and_time(
                u16::try_from(dt.year()).ok()?,
                dt.month() as u8,
                dt.day() as u8,
                dt.hour() as u8,
                dt.minute() as u8,
                dt.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

/// Builds archive streams for resolved paths
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    resolver: PathResolver,
    store: Arc<ObjectStore>,
    config: RewindConfig,
    exclude: Option<GlobSet>,
}

impl ArchiveBuilder {
    /// Create a builder
    ///
    /// # Arguments
    ///
    /// * `resolver` - Resolver over the chain the states came from
    /// * `store` - Object store holding file contents and diffs
    /// * `config` - Chunking, compression and depth settings
    pub fn new(resolver: PathResolver, store: Arc<ObjectStore>, config: RewindConfig) -> Self {
        Self {
            resolver,
            store,
            config,
            exclude: None,
        }
    }

    /// Skip descendants whose repository path matches any of `patterns`
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::InvalidPattern`] for a malformed glob.
    pub fn exclude(mut self, patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            self.exclude = None;
            return Ok(self);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        self.exclude = Some(builder.build()?);
        Ok(self)
    }

    /// Start streaming an archive of a resolved path
    ///
    /// Returns as soon as the producer thread is running; no entry has been
    /// reconstructed yet.
    ///
    /// # Errors
    ///
    /// - [`RewindError::InvalidPath`] if the state is absent
    /// - [`RewindError::Io`] if the producer thread cannot be spawned
    pub fn stream(&self, state: PathState, kind: ArchiveKind) -> Result<ArchiveStream> {
        if state.is_absent() {
            return Err(RewindError::InvalidPath("cannot archive an absent path".to_string()));
        }

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let aborted = Arc::new(AtomicBool::new(false));
        let phase = Arc::new(Mutex::new(RestorePhase::Streaming));

        let producer = Producer {
            resolver: self.resolver.clone(),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            exclude: self.exclude.clone(),
            consumer: sender.clone(),
            aborted: Arc::clone(&aborted),
        };
        let channel = ChannelWriter::new(sender, self.config.chunk_size.max(1), aborted);
        let shared_phase = Arc::clone(&phase);

        let handle = thread::Builder::new()
            .name("rewind-archive".to_string())
            .spawn(move || producer.run(state, kind, channel, shared_phase))?;

        Ok(ArchiveStream {
            receiver,
            pending: Vec::new(),
            pos: 0,
            producer: Some(handle),
            phase,
            kind,
            failed: None,
        })
    }
}

/// Everything the producer thread owns
struct Producer {
    resolver: PathResolver,
    store: Arc<ObjectStore>,
    config: RewindConfig,
    exclude: Option<GlobSet>,
    consumer: mpsc::Sender<Chunk>,
    aborted: Arc<AtomicBool>,
}

impl Producer {
    fn run(
        self,
        root: PathState,
        kind: ArchiveKind,
        mut channel: ChannelWriter,
        phase: Arc<Mutex<RestorePhase>>,
    ) -> RestoreReport {
        let root_path = match &root {
            PathState::File(file) => file.path.clone(),
            PathState::Directory(dir) => dir.path.clone(),
            PathState::Absent => String::new(),
        };
        let span = info_span!("archive", path = %root_path, kind = %kind);
        let _guard = span.enter();

        let started = Instant::now();
        let mut report = RestoreReport::new(kind);
        debug!("Restore phase: Streaming");

        let result = self
            .encode(&root, kind, &mut channel, &mut report)
            .and_then(|()| channel.flush().map_err(RewindError::from));
        report.archive_bytes = channel.sent();

        match result {
            Ok(()) => {
                report.phase = RestorePhase::Completed;
                info!(
                    "Restore phase: Completed ({} files, {} directories, {} failures, {} archive bytes)",
                    report.files_written,
                    report.directories_written,
                    report.failures.len(),
                    report.archive_bytes
                );
            }
            Err(e) if channel.is_closed() => {
                report.phase = RestorePhase::Aborted;
                report.cancelled = true;
                debug!("Restore phase: Aborted, consumer disconnected ({})", e);
            }
            Err(e) => {
                let reason = e.to_string();
                error!("Restore phase: Aborted, {}", reason);
                report.phase = RestorePhase::Aborted;
                report.error = Some(reason.clone());
                // Visible to the consumer before it sees the error chunk
                *phase.lock() = RestorePhase::Aborted;
                channel.fail(RewindError::FatalStream(reason));
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        *phase.lock() = report.phase;
        report
    }

    fn encode(
        &self,
        root: &PathState,
        kind: ArchiveKind,
        channel: &mut ChannelWriter,
        report: &mut RestoreReport,
    ) -> Result<()> {
        match kind {
            ArchiveKind::Zip => {
                let mut sink = ZipSink::new(channel, self.config.zip_deflate);
                self.write_root(root, &mut sink, report)?;
                sink.finish()
            }
            ArchiveKind::TarGz => {
                let mut sink = TarGzSink::new(channel, self.config.gzip_level);
                self.write_root(root, &mut sink, report)?;
                sink.finish()
            }
        }
    }

    /// Walk the tree; on failure, poison the channel before the sink is
    /// dropped so its trailer never reaches the consumer
    fn write_root<S: EntrySink>(&self, root: &PathState, sink: &mut S, report: &mut RestoreReport) -> Result<()> {
        let result = match root {
            PathState::File(file) => {
                let (_, name) = parent_and_name(&file.path);
                self.write_file(sink, name, file, report)
            }
            PathState::Directory(dir) => self
                .resolver
                .chain()
                .index_of(dir.timestamp)
                .ok_or_else(|| RewindError::internal(format!("no increment at {}", dir.timestamp.as_secs())))
                .and_then(|index| self.write_children(sink, dir, "", 0, index, report).map(|_| ())),
            PathState::Absent => Ok(()),
        };
        if result.is_err() {
            self.aborted.store(true, Ordering::Release);
        }
        result
    }

    fn write_children<S: EntrySink>(
        &self,
        sink: &mut S,
        dir: &DirectoryState,
        prefix: &str,
        depth: usize,
        index: usize,
        report: &mut RestoreReport,
    ) -> Result<usize> {
        let mut written = 0;
        for child in &dir.children {
            self.check_cancelled()?;

            let path = join_path(&dir.path, &child.name);
            if self.is_excluded(&path) {
                trace!("Excluded {:?}", path);
                continue;
            }
            let name = join_path(prefix, &child.name);

            match self.resolver.resolve_at(&path, index) {
                Ok(PathState::File(file)) => {
                    self.write_file(sink, &name, &file, report)?;
                    written += 1;
                }
                Ok(PathState::Directory(sub)) => {
                    if depth + 1 > self.config.max_tree_depth {
                        record_failure(
                            report,
                            &path,
                            format!("directory nesting exceeds {} levels", self.config.max_tree_depth),
                        );
                        continue;
                    }
                    let meta = EntryMeta::directory(&sub);
                    sink.begin_directory(&name, &meta)?;
                    report.directories_written += 1;
                    let entries = self.write_children(sink, &sub, &name, depth + 1, index, report)?;
                    sink.end_directory(&name, &meta, entries)?;
                    written += 1;
                }
                Ok(PathState::Absent) => {}
                Err(e) if e.is_entry_local() => {
                    self.write_placeholder(sink, &name, &path, EntryMeta::placeholder(0o644, 0), e, report)?;
                    written += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn write_file<S: EntrySink>(
        &self,
        sink: &mut S,
        name: &str,
        file: &FileState,
        report: &mut RestoreReport,
    ) -> Result<()> {
        match file.plan.reconstruct(&self.store) {
            Ok(content) => {
                sink.add_file(name, &EntryMeta::file(file), &content)?;
                report.files_written += 1;
                report.bytes_written += content.len() as u64;
                trace!("Archived {:?} ({} bytes)", file.path, content.len());
                Ok(())
            }
            Err(e) if e.is_entry_local() => {
                let meta = EntryMeta::placeholder(file.mode, file.mtime);
                self.write_placeholder(sink, name, &file.path, meta, e, report)
            }
            Err(e) => Err(e),
        }
    }

    fn write_placeholder<S: EntrySink>(
        &self,
        sink: &mut S,
        name: &str,
        path: &str,
        meta: EntryMeta,
        cause: RewindError,
        report: &mut RestoreReport,
    ) -> Result<()> {
        record_failure(report, path, cause.to_string());
        sink.add_file(name, &meta, &[])?;
        report.files_written += 1;
        Ok(())
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.as_ref().is_some_and(|set| set.is_match(path))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.consumer.is_closed() {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "archive consumer went away").into());
        }
        Ok(())
    }
}

fn record_failure(report: &mut RestoreReport, path: &str, reason: String) {
    let err = RewindError::PartialReconstruction {
        path: path.to_string(),
        reason: reason.clone(),
    };
    warn!("{}", err);
    report.failures.push(EntryFailure {
        path: path.to_string(),
        reason,
    });
}

/// Pull side of an archive being produced
///
/// Read it with [`std::io::Read`] from synchronous code, or with
/// [`ArchiveStream::next_chunk`] from async code. `Read` blocks the calling
/// thread and must not be used from inside an async runtime.
///
/// Dropping the stream (or calling [`ArchiveStream::cancel`]) stops the
/// producer at its next write.
pub struct ArchiveStream {
    receiver: mpsc::Receiver<Chunk>,
    pending: Vec<u8>,
    pos: usize,
    producer: Option<JoinHandle<RestoreReport>>,
    phase: Arc<Mutex<RestorePhase>>,
    kind: ArchiveKind,
    /// Set once the stream has ended in error; later reads repeat it
    failed: Option<String>,
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .field("buffered", &(self.pending.len() - self.pos))
            .finish()
    }
}

impl ArchiveStream {
    /// Container format being produced
    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Current phase of the producer
    pub fn phase(&self) -> RestorePhase {
        *self.phase.lock()
    }

    /// Next chunk of archive bytes
    ///
    /// Returns `None` at the clean end of the archive, and `Some(Err(..))`
    /// with [`RewindError::FatalStream`] when the producer aborted or died.
    /// Once an error was returned, every later call returns it again.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        if self.pos < self.pending.len() {
            let rest = self.pending.split_off(self.pos);
            self.pending.clear();
            self.pos = 0;
            return Some(Ok(rest));
        }
        if let Some(e) = self.terminal_error() {
            return Some(Err(e));
        }
        let message = self.receiver.recv().await;
        self.settle(message)
    }

    fn terminal_error(&self) -> Option<RewindError> {
        self.failed.clone().map(RewindError::FatalStream)
    }

    /// Record an error or an early end of the channel as the terminal state
    fn settle(&mut self, message: Option<Chunk>) -> Option<Chunk> {
        let reason = match message {
            Some(Ok(chunk)) => return Some(Ok(chunk)),
            Some(Err(RewindError::FatalStream(reason))) => reason,
            Some(Err(e)) => e.to_string(),
            // The producer publishes its final phase before the channel closes
            None if self.phase() == RestorePhase::Completed => return None,
            None => "archive producer stopped before finishing the archive".to_string(),
        };
        self.failed = Some(reason.clone());
        Some(Err(RewindError::FatalStream(reason)))
    }

    /// Wait for the producer and return its report
    ///
    /// Call after reading to the end. Unread bytes are discarded and the
    /// producer is stopped.
    ///
    /// # Errors
    ///
    /// - [`RewindError::FatalStream`] if the producer aborted on an error
    /// - [`RewindError::Internal`] if the producer thread panicked
    pub fn finish(mut self) -> Result<RestoreReport> {
        let report = self.join()?;
        match (&report.error, report.cancelled) {
            (Some(reason), false) => Err(RewindError::FatalStream(reason.clone())),
            _ => Ok(report),
        }
    }

    /// Stop the producer and return what it had done so far
    pub fn cancel(mut self) -> RestoreReport {
        match self.join() {
            Ok(report) => report,
            Err(e) => {
                let mut report = RestoreReport::new(self.kind);
                report.phase = RestorePhase::Aborted;
                report.error = Some(e.to_string());
                report
            }
        }
    }

    fn join(&mut self) -> Result<RestoreReport> {
        self.receiver.close();
        // Unblock a producer waiting on a full channel
        while self.receiver.try_recv().is_ok() {}
        let handle = self
            .producer
            .take()
            .ok_or_else(|| RewindError::internal("archive producer already joined"))?;
        handle
            .join()
            .map_err(|_| RewindError::internal("archive producer panicked"))
    }
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pos);
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if let Some(e) = self.terminal_error() {
                return Err(io::Error::other(e));
            }
            let message = self.receiver.blocking_recv();
            match self.settle(message) {
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Some(Err(e)) => return Err(io::Error::other(e)),
                None => return Ok(0),
            }
        }
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        self.receiver.close();
    }
}
