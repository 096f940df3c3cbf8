//! External codec subprocess actor
//!
//! A `CodecProcess` owns one encoder or decoder child process. Input is fed
//! through a bounded channel drained by a writer task into the child's stdin;
//! a reader task pulls stdout, frames it with a [`Framer`] and forwards whole
//! units on an output channel. Neither side drops data: a full queue makes the
//! producer wait.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Splits a subprocess output byte stream into complete units
pub trait Framer: Send + 'static {
    /// Append `chunk` and push every unit it completes onto `out`
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Bytes>);

    /// Flush whatever is left once the stream has ended
    fn finish(&mut self) -> Option<Bytes> {
        None
    }
}

/// Forwards stdout chunks as they are read
#[derive(Debug, Default)]
pub struct PassThrough;

impl Framer for PassThrough {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) {
        out.push(Bytes::copy_from_slice(chunk));
    }
}

/// Splits a raw sample stream into units of exactly `frame_size` bytes
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_size: usize,
    buffer: BytesMut,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            buffer: BytesMut::with_capacity(frame_size.max(1)),
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Framer for FrameAccumulator {
    fn push(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) {
        self.buffer.extend_from_slice(chunk);
        while self.buffer.len() >= self.frame_size {
            out.push(self.buffer.split_to(self.frame_size).freeze());
        }
    }
}

/// Subprocess launch and lifecycle settings
#[derive(Debug, Clone)]
pub struct CodecProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Input units queued before `feed` waits
    pub input_capacity: usize,
    /// Framed output units queued before the reader waits
    pub output_capacity: usize,
    pub read_buffer_size: usize,
    /// Read wait before re-checking that the child is alive
    pub read_timeout: Duration,
    /// Grace period for background tasks on stop before the child is killed
    pub stop_timeout: Duration,
}

impl CodecProcessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input_capacity: 8,
            output_capacity: 8,
            read_buffer_size: 64 * 1024,
            read_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(2),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Running codec subprocess
pub struct CodecProcess {
    label: String,
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl CodecProcess {
    /// Spawn the child and its writer/reader tasks.
    ///
    /// Framed output arrives on the returned receiver; it closes when the
    /// child exits, its stdout breaks, or the process is stopped.
    pub fn spawn<F: Framer>(
        label: impl Into<String>,
        config: &CodecProcessConfig,
        framer: F,
    ) -> Result<(Self, mpsc::Receiver<Bytes>)> {
        let label = label.into();

        info!(
            "Starting {} codec process: {} {}",
            label,
            config.program,
            config.args.join(" ")
        );

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::subprocess(&config.program, format!("spawn failed: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::subprocess(&config.program, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::subprocess(&config.program, "stdout not captured"))?;
        let stderr = child.stderr.take();

        debug!("{} codec process started with PID {:?}", label, child.id());

        let child = Arc::new(tokio::sync::Mutex::new(Some(child)));
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let (input_tx, input_rx) = mpsc::channel(config.input_capacity.max(1));
        let (output_tx, output_rx) = mpsc::channel(config.output_capacity.max(1));

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(Self::write_loop(
            label.clone(),
            stdin,
            input_rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(Self::read_loop(
            label.clone(),
            stdout,
            framer,
            output_tx,
            child.clone(),
            cancel.clone(),
            running.clone(),
            config.read_buffer_size.max(1),
            config.read_timeout,
        )));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(Self::log_stderr(
                label.clone(),
                stderr,
                cancel.clone(),
            )));
        }

        Ok((
            Self {
                label,
                input_tx: Mutex::new(Some(input_tx)),
                child,
                cancel,
                running,
                tasks: Mutex::new(tasks),
                stop_timeout: config.stop_timeout,
            },
            output_rx,
        ))
    }

    /// Queue bytes for the child's stdin, waiting while the queue is full
    pub async fn feed(&self, data: Bytes) -> Result<()> {
        let tx = self.input_tx.lock().clone();
        let tx = tx.ok_or_else(|| AppError::subprocess(&self.label, "process stopped"))?;
        tx.send(data)
            .await
            .map_err(|_| AppError::subprocess(&self.label, "stdin closed"))
    }

    /// Queue bytes without waiting; `Ok(false)` when the queue is full
    pub fn try_feed(&self, data: Bytes) -> Result<bool> {
        let guard = self.input_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| AppError::subprocess(&self.label, "process stopped"))?;
        match tx.try_send(data) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AppError::subprocess(&self.label, "stdin closed"))
            }
        }
    }

    /// Whether the child is still producing output
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Signal cancellation, wait for the tasks up to the stop timeout, then
    /// kill the child whether or not they exited. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() && self.tasks.lock().is_empty() {
            return;
        }
        debug!("Stopping {} codec process", self.label);

        self.cancel.cancel();
        self.input_tx.lock().take();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let join_all = futures::future::join_all(tasks);
        if tokio::time::timeout(self.stop_timeout, join_all).await.is_err() {
            warn!(
                "{} codec tasks did not exit within {:?}, killing process",
                self.label, self.stop_timeout
            );
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("{} codec process exited: {}", self.label, status),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {} codec process: {}", self.label, e);
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("{} codec process stopped", self.label);
    }

    async fn write_loop(
        label: String,
        mut stdin: ChildStdin,
        mut input_rx: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                data = input_rx.recv() => {
                    let Some(data) = data else { break };
                    // A child that stops reading must not pin the writer past stop
                    let written = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        r = stdin.write_all(&data) => r,
                    };
                    if let Err(e) = written {
                        warn!("{} codec stdin write failed: {}", label, e);
                        break;
                    }
                }
            }
        }
        if !cancel.is_cancelled() {
            let _ = stdin.shutdown().await;
        }
        // Dropping stdin closes the pipe so the child sees EOF
        drop(stdin);
        debug!("{} codec writer exited", label);
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_loop<F: Framer>(
        label: String,
        mut stdout: ChildStdout,
        mut framer: F,
        output_tx: mpsc::Sender<Bytes>,
        child: Arc<tokio::sync::Mutex<Option<Child>>>,
        cancel: CancellationToken,
        running: Arc<AtomicBool>,
        buffer_size: usize,
        read_timeout: Duration,
    ) {
        let mut buf = BytesMut::with_capacity(buffer_size);
        let mut units = Vec::new();

        'outer: loop {
            buf.clear();
            buf.reserve(buffer_size);

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(read_timeout, stdout.read_buf(&mut buf)) => r,
            };

            match read {
                Err(_) => {
                    if let Some(child) = child.lock().await.as_mut() {
                        if let Ok(Some(status)) = child.try_wait() {
                            warn!("{} codec process exited: {}", label, status);
                            break;
                        }
                    }
                }
                Ok(Ok(0)) => {
                    debug!("{} codec stdout closed", label);
                    break;
                }
                Ok(Ok(_)) => {
                    framer.push(&buf, &mut units);
                    for unit in units.drain(..) {
                        let sent = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'outer,
                            r = output_tx.send(unit) => r,
                        };
                        if sent.is_err() {
                            debug!("{} codec output receiver dropped", label);
                            break 'outer;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("{} codec stdout read failed: {}", label, e);
                    break;
                }
            }
        }

        if !cancel.is_cancelled() {
            if let Some(rest) = framer.finish() {
                let _ = output_tx.send(rest).await;
            }
        }
        running.store(false, Ordering::SeqCst);
        debug!("{} codec reader exited", label);
    }

    async fn log_stderr<R: AsyncRead + Unpin>(label: String, stderr: R, cancel: CancellationToken) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => debug!("[{}] {}", label, line),
                _ => break,
            }
        }
    }
}

impl Drop for CodecProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_waits_for_full_frame() {
        let mut acc = FrameAccumulator::new(6);
        let mut out = Vec::new();

        acc.push(&[1, 2, 3, 4], &mut out);
        assert!(out.is_empty());
        assert_eq!(acc.pending(), 4);

        acc.push(&[5, 6, 7, 8, 9, 10, 11, 12, 13], &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&out[1][..], &[7, 8, 9, 10, 11, 12]);
        assert_eq!(acc.pending(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cat_round_trip() {
        let config = CodecProcessConfig::new("cat");
        let (process, mut output) =
            CodecProcess::spawn("test", &config, FrameAccumulator::new(4)).unwrap();

        process.feed(Bytes::from_static(b"abcdef")).await.unwrap();
        process.feed(Bytes::from_static(b"gh")).await.unwrap();

        let first = output.recv().await.unwrap();
        let second = output.recv().await.unwrap();
        assert_eq!(&first[..], b"abcd");
        assert_eq!(&second[..], b"efgh");
        assert!(process.is_running());

        process.stop().await;
        assert!(!process.is_running());
        assert!(process.feed(Bytes::from_static(b"x")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let config = CodecProcessConfig::new("cat").stop_timeout(Duration::from_millis(200));
        let (process, _output) = CodecProcess::spawn("idle", &config, PassThrough).unwrap();
        process.stop().await;
        process.stop().await;
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_try_feed_reports_full_queue_and_stop_is_prompt() {
        // `sleep` never reads stdin, so the pipe and then the queue fill up
        let config = CodecProcessConfig::new("sleep")
            .args(["30"])
            .input_capacity(2)
            .stop_timeout(Duration::from_secs(5));
        let (process, _output) = CodecProcess::spawn("stuck", &config, PassThrough).unwrap();

        let chunk = Bytes::from(vec![0u8; 256 * 1024]);
        let mut accepted = 0;
        let mut full = false;
        for _ in 0..16 {
            if process.try_feed(chunk.clone()).unwrap() {
                accepted += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            } else {
                full = true;
                break;
            }
        }
        assert!(full, "queue never filled after {} chunks", accepted);

        // The writer is blocked mid-write; cancellation still ends it
        let started = std::time::Instant::now();
        process.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(process.try_feed(chunk).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_closes_when_child_exits() {
        let config = CodecProcessConfig::new("true");
        let (process, mut output) = CodecProcess::spawn("short", &config, PassThrough).unwrap();
        assert!(output.recv().await.is_none());
        process.stop().await;
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_program_is_subprocess_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let config = CodecProcessConfig::new("/nonexistent/codec-binary");
            let err = CodecProcess::spawn("missing", &config, PassThrough).err().unwrap();
            assert!(matches!(err, AppError::Subprocess { .. }));
        });
    }
}
