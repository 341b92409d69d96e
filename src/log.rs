//! Metric log: an in-memory buffer of timestamped lines, moved to durable
//! storage at explicit checkpoints.
//!
//! One `LogAccumulator` is shared (behind an `Arc`) by every bot run in the
//! process. `append` takes the buffer lock for a single `push`; `flush` swaps
//! the buffer out under that lock and writes the taken lines while holding a
//! separate flush lock, so appends never wait on disk I/O and every line
//! lands in exactly one flush.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, error, info};

/// A formatted metric message and the moment it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    /// `<ISO 8601 timestamp> - <message>`, millisecond precision, `Z` suffix.
    ///
    /// Line breaks inside the message are folded into single spaces so one
    /// event always renders as one line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - ", self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))?;
        let mut pieces = self
            .message
            .split(|c: char| c == '\r' || c == '\n')
            .filter(|p| !p.is_empty());
        if let Some(first) = pieces.next() {
            f.write_str(first)?;
            for piece in pieces {
                f.write_str(" ")?;
                f.write_str(piece)?;
            }
        }
        Ok(())
    }
}

/// Durable destination for flushed lines.
pub trait LogSink: Send + Sync {
    /// Persist `lines` in order. On error nothing may be considered written.
    fn write_lines(&self, lines: &[LogLine]) -> Result<()>;
}

/// Appends lines to a UTF-8 text file, creating it on first write.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A destination that can be cut back to an earlier length.
trait Truncate: Write {
    fn end(&mut self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn end(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write all of `payload` or none of it.
fn append_all_or_nothing<W: Truncate>(out: &mut W, payload: &[u8]) -> io::Result<()> {
    let original = out.end()?;
    let written = out.write_all(payload).and_then(|()| out.flush());
    if let Err(e) = written {
        if let Err(rollback) = out.truncate(original) {
            error!(error = %rollback, len = original, "failed to roll back partial log write");
        }
        return Err(e);
    }
    Ok(())
}

impl LogSink for FileSink {
    fn write_lines(&self, lines: &[LogLine]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        // One write call for the whole batch.
        let mut payload = String::new();
        for line in lines {
            payload.push_str(&line.to_string());
            payload.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open log file: {}", self.path.display()))?;
        append_all_or_nothing(&mut file, payload.as_bytes())
            .with_context(|| format!("failed to append to log file: {}", self.path.display()))
    }
}

/// Keeps flushed lines in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<LogLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, in write order.
    pub fn lines(&self) -> Vec<LogLine> {
        lock(&self.lines).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.lines).iter().map(|l| l.message.clone()).collect()
    }
}

impl LogSink for MemorySink {
    fn write_lines(&self, lines: &[LogLine]) -> Result<()> {
        lock(&self.lines).extend_from_slice(lines);
        Ok(())
    }
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn write_lines(&self, lines: &[LogLine]) -> Result<()> {
        (**self).write_lines(lines)
    }
}

/// Process-wide metric buffer.
pub struct LogAccumulator {
    buffer: Mutex<Vec<LogLine>>,
    flush_lock: Mutex<()>,
    sink: Box<dyn LogSink>,
}

impl LogAccumulator {
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            sink: Box::new(sink),
        }
    }

    /// Accumulator writing to the text log at `path`.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self::new(FileSink::new(path))
    }

    /// Buffer a message stamped with the current time.
    pub fn append(&self, message: impl Into<String>) {
        self.append_line(LogLine::new(message));
    }

    pub fn append_line(&self, line: LogLine) {
        info!(target: "botload::metrics", "{}", line.message);
        lock(&self.buffer).push(line);
    }

    /// Number of lines waiting for the next flush.
    pub fn pending(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Move every buffered line to the sink and leave the buffer empty.
    ///
    /// Lines appended while the sink write is in progress stay buffered for
    /// the next flush. If the sink fails, the taken lines are put back in
    /// front of anything appended meanwhile and the error is returned.
    pub fn flush(&self) -> Result<usize> {
        let _flushing = lock(&self.flush_lock);

        let taken = std::mem::take(&mut *lock(&self.buffer));
        if taken.is_empty() {
            return Ok(0);
        }

        match self.sink.write_lines(&taken) {
            Ok(()) => {
                debug!(lines = taken.len(), "flushed metric log");
                Ok(taken.len())
            }
            Err(e) => {
                error!(error = %e, lines = taken.len(), "metric log flush failed, lines retained");
                let mut buffer = lock(&self.buffer);
                buffer.splice(0..0, taken);
                Err(e)
            }
        }
    }

    /// Scope guard that flushes when dropped unless `finish` ran first.
    pub fn scope(self: &Arc<Self>) -> FlushGuard {
        FlushGuard {
            log: Arc::clone(self),
            finished: false,
        }
    }
}

impl fmt::Debug for LogAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogAccumulator")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Guarantees one flush on every exit path of a scope: an early return, its
/// future being dropped, or a panic in builds that unwind. Release builds
/// abort on panic and skip the flush.
#[must_use = "dropping the guard immediately flushes"]
pub struct FlushGuard {
    log: Arc<LogAccumulator>,
    finished: bool,
}

impl FlushGuard {
    pub fn log(&self) -> &Arc<LogAccumulator> {
        &self.log
    }

    /// Flush now and report the result. The drop flush is disarmed.
    pub fn finish(mut self) -> Result<usize> {
        self.finished = true;
        self.log.flush()
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.log.flush() {
            error!(error = %e, "metric log flush on scope exit failed");
        }
    }
}

// A panic while holding the lock cannot leave a Vec half-pushed, so a
// poisoned buffer is still safe to use.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingSink;

    impl LogSink for FailingSink {
        fn write_lines(&self, _lines: &[LogLine]) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn accumulator() -> (Arc<MemorySink>, Arc<LogAccumulator>) {
        let sink = Arc::new(MemorySink::new());
        let log = Arc::new(LogAccumulator::new(Arc::clone(&sink)));
        (sink, log)
    }

    #[test]
    fn test_line_format() {
        let line = LogLine {
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T12:00:00.042Z")
                .unwrap()
                .with_timezone(&Utc),
            message: "Bot ID: abc".to_string(),
        };
        assert_eq!(line.to_string(), "2024-05-01T12:00:00.042Z - Bot ID: abc");
    }

    #[test]
    fn test_multi_line_message_renders_as_one_line() {
        let line = LogLine::new("HTTP 502: <html>\r\n<body>Bad Gateway</body>\n</html>\n");
        let rendered = line.to_string();
        assert!(!rendered.contains('\n'));
        assert!(!rendered.contains('\r'));
        assert!(rendered.ends_with(" - HTTP 502: <html> <body>Bad Gateway</body> </html>"));
    }

    /// Accepts `limit` bytes in total, then fails like a full disk.
    struct ShortWriter {
        data: Vec<u8>,
        limit: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.limit.saturating_sub(self.data.len());
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Truncate for ShortWriter {
        fn end(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_partial_write_is_rolled_back() {
        let mut out = ShortWriter {
            data: b"existing\n".to_vec(),
            limit: 16,
        };
        assert!(append_all_or_nothing(&mut out, b"first line\nsecond line\n").is_err());
        assert_eq!(out.data, b"existing\n");

        out.limit = 64;
        append_all_or_nothing(&mut out, b"retry\n").unwrap();
        assert_eq!(out.data, b"existing\nretry\n");
    }

    #[test]
    fn test_flush_resets_buffer() {
        let (sink, log) = accumulator();
        log.append("one");
        log.append("two");
        assert_eq!(log.pending(), 2);

        assert_eq!(log.flush().unwrap(), 2);
        assert_eq!(log.pending(), 0);
        assert_eq!(sink.messages(), vec!["one", "two"]);

        assert_eq!(log.flush().unwrap(), 0);
        assert_eq!(sink.lines().len(), 2);
    }

    #[test]
    fn test_failed_flush_keeps_lines() {
        let log = LogAccumulator::new(FailingSink);
        log.append("kept");
        assert!(log.flush().is_err());
        assert_eq!(log.pending(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_all_flushed_once() {
        let (sink, log) = accumulator();
        let mut handles = Vec::new();
        for writer in 0..16 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                for i in 0..200 {
                    log.append(format!("writer {writer} line {i}"));
                    if i % 17 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        log.flush().unwrap();

        let messages = sink.messages();
        let unique: HashSet<_> = messages.iter().cloned().collect();
        assert_eq!(messages.len(), 16 * 200);
        assert_eq!(unique.len(), messages.len());
    }

    #[test]
    fn test_flush_racing_appends_loses_nothing() {
        let (sink, log) = accumulator();
        let done = Arc::new(AtomicBool::new(false));

        let flusher = {
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    log.flush().unwrap();
                    std::thread::yield_now();
                }
            })
        };

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        log.append(format!("{w}:{i}"));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        flusher.join().unwrap();
        log.flush().unwrap();

        let messages = sink.messages();
        let expected: HashSet<String> = (0..8)
            .flat_map(|w| (0..500).map(move |i| format!("{w}:{i}")))
            .collect();
        let got: HashSet<String> = messages.iter().cloned().collect();
        assert_eq!(messages.len(), expected.len());
        assert_eq!(got, expected);
    }

    #[test]
    fn test_guard_flushes_on_drop() {
        let (sink, log) = accumulator();
        {
            let guard = log.scope();
            guard.log().append("inside scope");
        }
        assert_eq!(sink.messages(), vec!["inside scope"]);
    }

    #[test]
    fn test_guard_flushes_on_panic() {
        let (sink, log) = accumulator();
        let scoped = Arc::clone(&log);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let guard = scoped.scope();
            guard.log().append("before panic");
            panic!("bot run panicked");
        }));
        assert!(result.is_err());
        assert_eq!(sink.messages(), vec!["before panic"]);
    }

    #[test]
    fn test_guard_finish_flushes_once() {
        let (sink, log) = accumulator();
        let guard = log.scope();
        log.append("a");
        assert_eq!(guard.finish().unwrap(), 1);
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn test_guard_flushes_when_future_is_dropped() {
        let (sink, log) = accumulator();
        let scoped = {
            let log = Arc::clone(&log);
            async move {
                let guard = log.scope();
                guard.log().append("before cancel");
                futures::future::pending::<()>().await;
                drop(guard);
            }
        };
        tokio_test::block_on(async {
            let _ = tokio::time::timeout(std::time::Duration::from_millis(10), scoped).await;
        });
        assert_eq!(sink.messages(), vec!["before cancel"]);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("test.log");
        let log = LogAccumulator::to_file(&path);

        log.append("first");
        log.flush().unwrap();
        log.append("second");
        log.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - first"));
        assert!(lines[1].ends_with(" - second"));
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_file_sink_keeps_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let log = LogAccumulator::to_file(&path);

        log.append("Error in bot #0 during create: HTTP 502: <html>\n<body>Bad Gateway</body>\n</html>");
        log.append("next event");
        log.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("<html> <body>Bad Gateway</body> </html>"));
        assert!(lines[1].ends_with(" - next event"));
    }
}
