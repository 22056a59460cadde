//! Transcode pipeline
//!
//! Pipes a resolver audio stream into an external encoder process (ffmpeg)
//! producing an MP3 file at a given path. The pipeline runs as a spawned
//! task; the caller observes it through a `PipelineHandle`:
//!
//! - Events arrive in order: `Started`, zero or more `Progress`, then exactly
//!   one of `Completed`/`Failed`. Nothing is delivered after a terminal event.
//! - `cancel()` is cooperative and idempotent: it kills the encoder, aborts
//!   the upstream stream, and deletes the partial output file, in that order.
//! - Dropping the handle before a terminal event triggers the same teardown,
//!   which is how a client disconnect propagates into the pipeline.
//!
//! Every failure is terminal for the job: the upstream stream cannot be
//! reopened from the same offset, so nothing is retried and the partial
//! output file is never left behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resolver::AudioStream;

/// Encoder settings for one job
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub bitrate_kbps: u32,
    pub channels: u32,
    pub sample_rate: u32,
    /// Source duration, when the resolver reported one. Enables progress
    /// estimation; progress is optional telemetry, not a correctness signal.
    pub duration_hint: Option<Duration>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            bitrate_kbps: 320,
            channels: 2,
            sample_rate: 44_100,
            duration_hint: None,
        }
    }
}

/// Lifecycle of one conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Streaming,
    Encoding,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Events surfaced to the job's owner
#[derive(Debug)]
pub enum PipelineEvent {
    /// Encoder process launched, stream consumption begun
    Started,
    /// Best-effort completion estimate, monotonic non-decreasing, 0-100
    Progress(f32),
    /// Output file fully written and closed
    Completed,
    /// Encoder or stream failure; the partial file has been removed
    Failed(Error),
}

/// Factory for per-job pipeline tasks
pub struct TranscodePipeline {
    ffmpeg_path: String,
}

impl TranscodePipeline {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Begin consuming `stream` and writing MP3 to `output_path`. Returns
    /// immediately; the returned handle is the only way to observe or cancel
    /// the job.
    pub fn start(&self, stream: AudioStream, output_path: PathBuf, opts: EncodeOptions) -> PipelineHandle {
        let cmd = encoder_command(&self.ffmpeg_path, &output_path, &opts);
        spawn_job(cmd, stream, output_path, opts.duration_hint)
    }
}

/// Build the ffmpeg invocation: stdin in, MP3 file out, machine-readable
/// progress on stdout.
fn encoder_command(ffmpeg_path: &str, output_path: &Path, opts: &EncodeOptions) -> Command {
    let mut cmd = Command::new(ffmpeg_path);
    cmd.arg("-hide_banner")
        .args(["-loglevel", "error"])
        .args(["-i", "pipe:0"])
        .arg("-vn")
        .args(["-codec:a", "libmp3lame"])
        .args(["-b:a", &format!("{}k", opts.bitrate_kbps)])
        .args(["-ac", &opts.channels.to_string()])
        .args(["-ar", &opts.sample_rate.to_string()])
        .args(["-f", "mp3"])
        .args(["-progress", "pipe:1"])
        .arg("-y")
        .arg(output_path);
    cmd
}

/// Spawn the per-job task driving one encoder process.
///
/// Kept separate from `TranscodePipeline::start` so tests can substitute an
/// arbitrary command for the encoder.
pub(crate) fn spawn_job(
    mut cmd: Command,
    mut stream: AudioStream,
    output_path: PathBuf,
    duration_hint: Option<Duration>,
) -> PipelineHandle {
    let (event_tx, event_rx) = mpsc::channel(16);
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let status = Arc::new(Mutex::new(JobStatus::Pending));
    let task_status = Arc::clone(&status);

    let task = tokio::spawn(async move {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                set_status(&task_status, JobStatus::Failed);
                stream.abort().await;
                let _ = event_tx
                    .send(PipelineEvent::Failed(Error::Encode(format!(
                        "Cannot launch encoder: {}",
                        e
                    ))))
                    .await;
                return;
            }
        };

        // A dropped handle (client disconnect) closes the watch sender,
        // which lands in the cancel branch just like an explicit cancel.
        let outcome = tokio::select! {
            res = drive(&mut child, &mut stream, duration_hint, &event_tx, &task_status) => Some(res),
            _ = cancel_rx.changed() => None,
        };

        match outcome {
            Some(Ok(())) => {
                set_status(&task_status, JobStatus::Done);
                info!("Conversion completed: {}", output_path.display());
                let _ = event_tx.send(PipelineEvent::Completed).await;
            }
            Some(Err(e)) => {
                set_status(&task_status, JobStatus::Failed);
                let _ = child.kill().await;
                stream.abort().await;
                remove_partial(&output_path).await;
                let _ = event_tx.send(PipelineEvent::Failed(e)).await;
            }
            None => {
                set_status(&task_status, JobStatus::Cancelled);
                info!("Conversion cancelled: {}", output_path.display());
                // Teardown order matters: stop the encoder before deleting
                // the file it is writing, then release the upstream stream.
                let _ = child.kill().await;
                stream.abort().await;
                remove_partial(&output_path).await;
            }
        }
    });

    PipelineHandle {
        events: event_rx,
        cancel_tx,
        status,
        task: Some(task),
    }
}

/// Feed the stream into the encoder and watch it to completion.
async fn drive(
    child: &mut Child,
    stream: &mut AudioStream,
    duration_hint: Option<Duration>,
    event_tx: &mpsc::Sender<PipelineEvent>,
    status: &Arc<Mutex<JobStatus>>,
) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Encode("encoder has no stdin".to_string()))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    set_status(status, JobStatus::Streaming);
    let _ = event_tx.send(PipelineEvent::Started).await;
    debug!("Encoder launched, streaming audio");

    let feed = async {
        let res = tokio::io::copy(stream, &mut stdin).await;
        // EOF on stdin is what tells the encoder the source is done
        let _ = stdin.shutdown().await;
        drop(stdin);
        res
    };
    let progress = report_progress(stdout, duration_hint, event_tx, status);
    // stderr must be drained while the job runs: a chatty encoder that
    // fills the pipe would block and stop consuming stdin, wedging the job
    let diagnostics = capture_stderr(stderr);
    let (copy_res, (), detail) = tokio::join!(feed, progress, diagnostics);

    match copy_res {
        // A broken pipe means the encoder died first; fall through and let
        // the exit status tell the real story.
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
            return Err(Error::Resolve(format!("Audio stream failed: {}", e)));
        }
        _ => {}
    }

    let exit = child
        .wait()
        .await
        .map_err(|e| Error::Encode(format!("Cannot reap encoder: {}", e)))?;

    if !exit.success() {
        return Err(Error::Encode(format!(
            "Encoder exited with {}: {}",
            exit,
            detail.trim()
        )));
    }

    Ok(())
}

/// Encoder diagnostics kept for failure reporting
const STDERR_KEEP_BYTES: usize = 8 * 1024;

/// Read the encoder's stderr to EOF, keeping the first few KB for error
/// detail. Reads past the cap are discarded, never left in the pipe.
async fn capture_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut chunk = [0u8; 4096];
    let mut kept = Vec::new();
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if kept.len() < STDERR_KEEP_BYTES {
                    let take = n.min(STDERR_KEEP_BYTES - kept.len());
                    kept.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Parse `key=value` progress lines from the encoder and translate
/// `out_time_ms` into a percent estimate. Values are microseconds despite
/// the field name.
async fn report_progress(
    stdout: Option<ChildStdout>,
    duration_hint: Option<Duration>,
    event_tx: &mpsc::Sender<PipelineEvent>,
    status: &Arc<Mutex<JobStatus>>,
) {
    let Some(stdout) = stdout else { return };
    let mut lines = BufReader::new(stdout).lines();
    let mut last_pct = 0.0f32;

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(raw) = line.strip_prefix("out_time_ms=") else {
            continue;
        };
        // First progress report means the encoder is producing output
        if *status.lock().unwrap() == JobStatus::Streaming {
            set_status(status, JobStatus::Encoding);
        }
        let (Ok(out_us), Some(total)) = (raw.trim().parse::<u64>(), duration_hint) else {
            continue;
        };
        if total.is_zero() {
            continue;
        }
        let pct = ((out_us as f64 / total.as_micros() as f64) * 100.0).min(100.0) as f32;
        if pct > last_pct {
            last_pct = pct;
            let _ = event_tx.send(PipelineEvent::Progress(pct)).await;
        }
    }
}

fn set_status(status: &Arc<Mutex<JobStatus>>, next: JobStatus) {
    *status.lock().unwrap() = next;
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove partial output {}: {}", path.display(), e),
    }
}

/// Owner-side handle for one running conversion job
pub struct PipelineHandle {
    events: mpsc::Receiver<PipelineEvent>,
    cancel_tx: watch::Sender<bool>,
    status: Arc<Mutex<JobStatus>>,
    task: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Next lifecycle event; `None` once the pipeline task is gone.
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    /// Terminate the job: kill the encoder, abort the upstream stream,
    /// delete the partial file. Waits for teardown to finish. Calling this
    /// on a completed or already-cancelled job is a no-op.
    pub async fn cancel(&mut self) {
        if self.status().is_terminal() {
            return;
        }
        let _ = self.cancel_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::AudioStream;
    use std::io::Cursor;

    /// Stand-in encoder: copies stdin to the given file, like ffmpeg with a
    /// passthrough codec.
    fn stub_encoder(output: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec cat > '{}'", output.display()));
        cmd
    }

    /// Stand-in encoder that fails immediately without consuming input.
    fn failing_encoder() -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'boom' >&2; exit 1");
        cmd
    }

    #[tokio::test]
    async fn completes_and_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");
        let stream = AudioStream::from_reader(Cursor::new(b"audio-bytes".to_vec()));

        let mut handle = spawn_job(stub_encoder(&output), stream, output.clone(), None);

        assert!(matches!(handle.next_event().await, Some(PipelineEvent::Started)));
        match handle.next_event().await {
            Some(PipelineEvent::Completed) => {}
            other => panic!("expected Completed, got {:?}", other),
        }
        assert_eq!(handle.status(), JobStatus::Done);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"audio-bytes");
    }

    #[tokio::test]
    async fn encoder_failure_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");
        // Pre-existing partial content must not survive a failure
        tokio::fs::write(&output, b"partial").await.unwrap();
        let stream = AudioStream::from_reader(Cursor::new(vec![0u8; 1024]));

        let mut handle = spawn_job(failing_encoder(), stream, output.clone(), None);

        assert!(matches!(handle.next_event().await, Some(PipelineEvent::Started)));
        match handle.next_event().await {
            Some(PipelineEvent::Failed(Error::Encode(msg))) => {
                assert!(msg.contains("boom"), "stderr missing from {:?}", msg);
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(handle.status(), JobStatus::Failed);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn cancel_kills_encoder_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");

        // A stream that never ends until the writer side is dropped
        let (writer, reader) = tokio::io::duplex(64);
        let stream = AudioStream::from_reader(reader);

        let mut handle = spawn_job(stub_encoder(&output), stream, output.clone(), None);
        assert!(matches!(handle.next_event().await, Some(PipelineEvent::Started)));

        handle.cancel().await;
        assert_eq!(handle.status(), JobStatus::Cancelled);
        assert!(!output.exists());
        assert!(handle.next_event().await.is_none());

        // Idempotent: a second cancel is a no-op
        handle.cancel().await;
        assert_eq!(handle.status(), JobStatus::Cancelled);

        drop(writer);
    }

    #[tokio::test]
    async fn dropped_handle_tears_down_within_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");

        let (writer, reader) = tokio::io::duplex(64);
        let stream = AudioStream::from_reader(reader);

        let mut handle = spawn_job(stub_encoder(&output), stream, output.clone(), None);
        assert!(matches!(handle.next_event().await, Some(PipelineEvent::Started)));

        // Simulated client disconnect: the owning request future vanishes
        drop(handle);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!output.exists());
        drop(writer);
    }

    #[tokio::test]
    async fn chatty_encoder_stderr_does_not_stall_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");

        // Floods stderr well past the pipe buffer before touching stdin,
        // the way ffmpeg logs decode errors on a damaged source.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "head -c 200000 /dev/zero >&2; exec cat > '{}'",
            output.display()
        ));
        let stream = AudioStream::from_reader(Cursor::new(b"audio-bytes".to_vec()));

        let mut handle = spawn_job(cmd, stream, output.clone(), None);
        assert!(matches!(handle.next_event().await, Some(PipelineEvent::Started)));

        let terminal = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
            .await
            .expect("no terminal event: pipeline stalled on encoder stderr");
        match terminal {
            Some(PipelineEvent::Completed) => {}
            other => panic!("expected Completed, got {:?}", other),
        }
        assert_eq!(handle.status(), JobStatus::Done);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"audio-bytes");
    }

    #[tokio::test]
    async fn failure_detail_is_capped_not_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("echo 'first line kept' >&2; head -c 200000 /dev/zero >&2; exit 1");
        let stream = AudioStream::from_reader(Cursor::new(vec![0u8; 64]));

        let mut handle = spawn_job(cmd, stream, output.clone(), None);
        assert!(matches!(handle.next_event().await, Some(PipelineEvent::Started)));
        match handle.next_event().await {
            Some(PipelineEvent::Failed(Error::Encode(msg))) => {
                assert!(msg.contains("first line kept"));
                assert!(msg.len() < 2 * STDERR_KEEP_BYTES);
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp3");

        // Encoder stand-in that emits progress lines out of order, then
        // drains stdin so the pipe does not break.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "echo out_time_ms=5000000; echo out_time_ms=2000000; echo out_time_ms=30000000; cat > '{}'",
            output.display()
        ));
        let stream = AudioStream::from_reader(Cursor::new(b"x".to_vec()));

        let mut handle = spawn_job(
            cmd,
            stream,
            output.clone(),
            Some(Duration::from_secs(10)),
        );

        let mut seen = Vec::new();
        while let Some(ev) = handle.next_event().await {
            match ev {
                PipelineEvent::Progress(p) => seen.push(p),
                PipelineEvent::Completed => break,
                PipelineEvent::Started => {}
                PipelineEvent::Failed(e) => panic!("unexpected failure: {}", e),
            }
        }

        // 5s and 30s of a 10s hint: the 2s report is swallowed, 30s caps at 100
        assert_eq!(seen.len(), 2);
        assert!((seen[0] - 50.0).abs() < 0.5);
        assert!((seen[1] - 100.0).abs() < f32::EPSILON);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
