//! Spawns and watches worker processes.
//!
//! A worker is this crate's own binary started with `--internal-role
//! worker`, a cleared environment, `/` as working directory and all three
//! standard streams piped. A reader thread turns stdout into frames on a
//! channel so the parent can wait on it with a deadline. stderr is drained
//! by a second thread and kept only up to a bound. Reaping goes through
//! `wait4` so CPU time and peak RSS come back with the status.

use crate::config::types::{Result, SandboxError};
use crate::limiter::hardening::{self, RlimitPlan};
use crate::limiter::protocol::{max_frame_bytes, WorkerFrame, WorkerJob};
use crate::limiter::{ExitEvidence, Interruption, KillReport, Launcher, WorkerSession};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Flag that switches the binary into worker mode.
pub const WORKER_ROLE_FLAG: &str = "--internal-role";
pub const WORKER_ROLE: &str = "worker";

const STDERR_LIMIT: usize = 16 * 1024;
const REAP_POLL: Duration = Duration::from_millis(5);
const REAP_AFTER_KILL: Duration = Duration::from_secs(2);

/// Launches workers as hardened child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    stack_limit_bytes: u64,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, stack_limit_bytes: u64, grace: Duration) -> Self {
        Self {
            program,
            stack_limit_bytes,
            grace,
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerSession>> {
        let plan = RlimitPlan::for_job(job, self.stack_limit_bytes);
        let payload = serde_json::to_vec(job)
            .map_err(|e| SandboxError::Protocol(format!("cannot encode worker job: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .arg(WORKER_ROLE_FLAG)
            .arg(WORKER_ROLE)
            .env_clear()
            .current_dir("/")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Only raw syscalls run between fork and exec.
        unsafe {
            command.pre_exec(move || hardening::apply(&plan));
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            SandboxError::Process(format!(
                "failed to start worker {}: {}",
                self.program.display(),
                e
            ))
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        log::debug!("worker {} started from {}", pid, self.program.display());

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(mut stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let mut session = ProcessSession::detached(pid, started, self.grace);
            session.kill_group();
            return Err(SandboxError::Process(
                "worker started without piped stdio".to_string(),
            ));
        };

        // A worker that dies before reading its job shows up as EOF on
        // stdout; the write error itself carries no extra information.
        thread::spawn(move || {
            let _ = stdin.write_all(&payload);
        });

        Ok(Box::new(ProcessSession {
            pid,
            started,
            grace: self.grace,
            frames: Some(spawn_frame_reader(stdout, max_frame_bytes(&job.limits))),
            stderr: Some(read_bounded_async(stderr, STDERR_LIMIT)),
        }))
    }
}

enum FrameEvent {
    Frame(WorkerFrame),
    Malformed(String),
}

fn spawn_frame_reader(stdout: ChildStdout, max_line: usize) -> Receiver<FrameEvent> {
    let (tx, rx) = bounded(64);
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = (&mut reader)
                .take(max_line as u64 + 1)
                .read_until(b'\n', &mut line);
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(FrameEvent::Malformed(format!("read failed: {e}")));
                    break;
                }
            }
            if line.last() != Some(&b'\n') {
                let event = if line.len() > max_line {
                    FrameEvent::Malformed(format!("frame exceeds {max_line} bytes"))
                } else {
                    FrameEvent::Malformed("truncated frame".to_string())
                };
                let _ = tx.send(event);
                break;
            }
            let event = match serde_json::from_slice::<WorkerFrame>(&line) {
                Ok(frame) => FrameEvent::Frame(frame),
                Err(e) => FrameEvent::Malformed(format!("malformed frame: {e}")),
            };
            let stop = matches!(event, FrameEvent::Malformed(_));
            if tx.send(event).is_err() || stop {
                break;
            }
        }
    });
    rx
}

/// Drain a pipe on a thread, keeping the first `limit` bytes.
fn read_bounded_async(mut stream: ChildStderr, limit: usize) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let remaining = limit.saturating_sub(out.len());
                    out.extend_from_slice(&buf[..n.min(remaining)]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        out
    })
}

struct ProcessSession {
    pid: Pid,
    started: Instant,
    grace: Duration,
    frames: Option<Receiver<FrameEvent>>,
    stderr: Option<thread::JoinHandle<Vec<u8>>>,
}

struct Reaped {
    status: i32,
    usage: libc::rusage,
}

impl ProcessSession {
    fn detached(pid: Pid, started: Instant, grace: Duration) -> Self {
        Self {
            pid,
            started,
            grace,
            frames: None,
            stderr: None,
        }
    }

    fn kill_group(&mut self) -> KillReport {
        let mut report = KillReport::default();
        let start = Instant::now();

        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) => report.kill_sent = true,
            Err(e) => {
                let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
                report.kill_sent = true;
                report
                    .notes
                    .push(format!("group SIGKILL fallback used: {e}"));
            }
        }

        report.waited_ms = start.elapsed().as_millis() as u64;
        report
    }

    /// Poll `wait4` until the worker is gone or `patience` runs out.
    fn reap(&self, patience: Duration) -> Option<Reaped> {
        let deadline = Instant::now() + patience;
        loop {
            let mut status: libc::c_int = 0;
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, libc::WNOHANG, &mut usage) };
            if rc == self.pid.as_raw() {
                return Some(Reaped { status, usage });
            }
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("wait4({}) failed: {}", self.pid, err);
                return None;
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(REAP_POLL);
        }
    }

    fn collect(&mut self, reaped: Option<Reaped>, kill: Option<KillReport>) -> ExitEvidence {
        let mut evidence = ExitEvidence {
            wall_time_ms: self.started.elapsed().as_millis() as u64,
            kill,
            ..ExitEvidence::default()
        };

        match reaped {
            Some(Reaped { status, usage }) => {
                if libc::WIFEXITED(status) {
                    evidence.exit_code = Some(libc::WEXITSTATUS(status));
                } else if libc::WIFSIGNALED(status) {
                    evidence.signal = Some(libc::WTERMSIG(status));
                }
                evidence.cpu_time_ms = timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime);
                evidence.max_rss_kb = usage.ru_maxrss.max(0) as u64;
                if let Some(report) = evidence.kill.as_mut() {
                    report.reaped = true;
                }
            }
            None => {
                if let Some(report) = evidence.kill.as_mut() {
                    report.notes.push("worker not reaped".to_string());
                }
            }
        }

        // Dropping the receiver lets the reader thread exit on its next send.
        self.frames = None;
        if let Some(handle) = self.stderr.take() {
            let bytes = handle.join().unwrap_or_default();
            evidence.stderr = String::from_utf8_lossy(&bytes).into_owned();
        }
        evidence
    }
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    let ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
    ms.max(0) as u64
}

impl WorkerSession for ProcessSession {
    fn next_frame(&mut self, limit: Duration) -> std::result::Result<WorkerFrame, Interruption> {
        let Some(frames) = self.frames.as_ref() else {
            return Err(Interruption::Exited);
        };
        match frames.recv_timeout(limit + self.grace) {
            Ok(FrameEvent::Frame(frame)) => Ok(frame),
            Ok(FrameEvent::Malformed(reason)) => Err(Interruption::Protocol(reason)),
            Err(RecvTimeoutError::Timeout) => Err(Interruption::Deadline),
            Err(RecvTimeoutError::Disconnected) => Err(Interruption::Exited),
        }
    }

    fn terminate(mut self: Box<Self>) -> ExitEvidence {
        let report = self.kill_group();
        log::debug!("worker {} killed", self.pid);
        let reaped = self.reap(REAP_AFTER_KILL);
        self.collect(reaped, Some(report))
    }

    fn finish(mut self: Box<Self>) -> ExitEvidence {
        if let Some(reaped) = self.reap(self.grace) {
            return self.collect(Some(reaped), None);
        }
        let report = self.kill_group();
        let reaped = self.reap(REAP_AFTER_KILL);
        self.collect(reaped, Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeval_conversion_adds_seconds_and_micros() {
        let tv = libc::timeval {
            tv_sec: 2,
            tv_usec: 345_000,
        };
        assert_eq!(timeval_ms(tv), 2_345);
    }

    #[test]
    fn missing_program_is_a_process_error() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/nonexistent/snakebox-worker"),
            8 * 1024 * 1024,
            Duration::from_millis(50),
        );
        let job = WorkerJob {
            source: "x = 1".into(),
            expressions: vec![],
            start_index: 0,
            budget: crate::config::types::ResourceBudget::source_default(),
            test_budget: crate::config::types::ResourceBudget::test_default(),
            capabilities: crate::capability::CapabilitySet::standard(),
            limits: crate::lang::Limits::default(),
        };
        match launcher.launch(&job) {
            Err(SandboxError::Process(message)) => assert!(message.contains("failed to start worker")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("launch of a missing binary succeeded"),
        }
    }
}
