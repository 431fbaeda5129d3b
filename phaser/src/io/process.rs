//! Helpers for running child processes with timeouts and bounded output.
//!
//! Children are spawned into their own process group so a timeout (or an
//! external `stop`) can take down everything the child started.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} {stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// Knobs for [`run_command`].
#[derive(Debug, Clone, Copy)]
pub struct RunOptions<'a> {
    /// Bytes fed to the child's stdin; `None` connects stdin to null.
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bound on stdout/stderr kept in memory; excess is drained and counted.
    pub output_limit_bytes: usize,
    /// Tee every stdout/stderr line to this file as it arrives.
    pub stream_path: Option<&'a Path>,
    /// Record the child's process group id here while it runs.
    pub pgid_marker: Option<&'a Path>,
}

impl RunOptions<'_> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            stream_path: None,
            pgid_marker: None,
        }
    }
}

type StreamSink = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. On timeout the child's whole
/// process group is killed and `timed_out` is set.
#[instrument(skip_all, fields(timeout_secs = opts.timeout.as_secs(), streaming = opts.stream_path.is_some()))]
pub fn run_command(mut cmd: Command, opts: &RunOptions<'_>) -> Result<CommandOutput> {
    if opts.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let sink: StreamSink = Arc::new(match opts.stream_path {
        Some(path) => Some(Mutex::new(BufWriter::new(create_stream_file(path)?))),
        None => None,
    });

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(marker) = opts.pgid_marker {
        write_pgid_marker(marker, child.id())?;
    }

    let stdin_handle = match opts.stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || match child_stdin.write_all(&input) {
                // The child may exit without reading its input.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = opts.output_limit_bytes;
    let stdout_sink = Arc::clone(&sink);
    let stderr_sink = Arc::clone(&sink);
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit, &stdout_sink));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit, &stderr_sink));

    let mut timed_out = false;
    let status = match child.wait_timeout(opts.timeout).context("wait for command")? {
        Some(status) => {
            // Anything the leader left behind would hold the output pipes open.
            kill_leftover_group(child.id());
            status
        }
        None => {
            warn!(
                timeout_secs = opts.timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_child_group(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(marker) = opts.pgid_marker {
        remove_pgid_marker(marker);
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Err(e)) => warn!(err = %e, "failed to write child stdin"),
            Err(_) => warn!("stdin writer thread panicked"),
            Ok(Ok(())) => {}
        }
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn create_stream_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    File::create(path).with_context(|| format!("create stream file {}", path.display()))
}

#[cfg(unix)]
fn kill_child_group(child: &mut std::process::Child) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(i32::try_from(child.id()).context("child pid out of range")?);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        warn!(err = %e, "killpg failed; killing child directly");
        child.kill().context("kill command")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_child_group(child: &mut std::process::Child) -> Result<()> {
    child.kill().context("kill command")
}

#[cfg(unix)]
fn kill_leftover_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "killed processes left in child group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, err = %e, "failed to kill leftover child group"),
    }
}

#[cfg(not(unix))]
fn kill_leftover_group(_pgid: u32) {}

fn write_pgid_marker(path: &Path, pgid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, format!("{pgid}\n"))
        .with_context(|| format!("write pgid marker {}", path.display()))
}

/// Remove a pgid marker; a missing marker is fine.
pub fn remove_pgid_marker(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(err = %e, path = %path.display(), "failed to remove pgid marker");
    }
}

/// Read the process group id recorded by a running invocation, if any.
pub fn read_pgid_marker(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Send `signal` to the process group recorded in `marker`.
///
/// Returns the group id when a live group was signalled.
#[cfg(unix)]
pub fn signal_recorded_group(marker: &Path, signal: nix::sys::signal::Signal) -> Option<i32> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let pgid = read_pgid_marker(marker).filter(|pgid| *pgid > 1)?;
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => {
            info!(pgid, signal = %signal, "signalled child process group");
            Some(pgid)
        }
        Err(e) => {
            debug!(pgid, err = %e, "child process group already gone");
            None
        }
    }
}

/// Kill a child group left behind by a controller that died mid-invocation,
/// then clear its marker.
pub fn reap_orphaned_group(marker: &Path) -> Option<i32> {
    if !marker.exists() {
        return None;
    }
    #[cfg(unix)]
    let killed = signal_recorded_group(marker, nix::sys::signal::Signal::SIGKILL);
    #[cfg(not(unix))]
    let killed = None;
    if let Some(pgid) = killed {
        warn!(pgid, "killed child process group orphaned by a previous controller");
    }
    remove_pgid_marker(marker);
    killed
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, tee-ing to the shared sink.
fn read_stream_limited<R: Read>(
    reader: R,
    limit: usize,
    sink: &StreamSink,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read output")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = sink.as_ref()
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let opts = RunOptions {
            stdin: Some(b"hello\n"),
            ..RunOptions::new(Duration::from_secs(10), 1024)
        };
        let out = run_command(sh("cat; echo oops >&2"), &opts).expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, b"hello\n");
        assert_eq!(out.stderr, b"oops\n");
    }

    #[test]
    fn truncates_beyond_limit() {
        let opts = RunOptions::new(Duration::from_secs(10), 4);
        let out = run_command(sh("printf 'abcdefgh'"), &opts).expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 4);
        assert!(out.stdout_truncated_notice("agent").contains("truncated 4 bytes"));
    }

    #[test]
    fn timeout_kills_and_clears_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("child.pgid");
        let opts = RunOptions {
            pgid_marker: Some(&marker),
            ..RunOptions::new(Duration::from_millis(200), 1024)
        };
        let out = run_command(sh("sleep 30"), &opts).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(!marker.exists());
    }

    #[test]
    fn exited_leader_does_not_wait_for_background_children() {
        let opts = RunOptions::new(Duration::from_secs(1), 1024);
        let started = std::time::Instant::now();
        let out = run_command(sh("sleep 8 & echo started; exit 0"), &opts).expect("run");
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
        assert!(!out.timed_out);
        assert!(out.success());
        assert_eq!(out.stdout, b"started\n");
    }

    #[test]
    fn orphaned_group_is_killed_and_marker_cleared() {
        use std::os::unix::process::CommandExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("child.pgid");
        let mut cmd = Command::new("sleep");
        cmd.arg("30").process_group(0);
        let mut child = cmd.spawn().expect("spawn");
        write_pgid_marker(&marker, child.id()).expect("marker");

        let pgid = reap_orphaned_group(&marker).expect("group killed");
        assert_eq!(u32::try_from(pgid).expect("pgid"), child.id());
        assert!(!marker.exists());
        let status = child.wait().expect("wait");
        assert!(!status.success());
        assert_eq!(reap_orphaned_group(&marker), None);
    }

    #[test]
    fn streams_output_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/agent.log");
        let opts = RunOptions {
            stream_path: Some(&log),
            ..RunOptions::new(Duration::from_secs(10), 1024)
        };
        let out = run_command(sh("echo one; echo two"), &opts).expect("run");
        assert!(out.success());
        assert_eq!(fs::read_to_string(&log).expect("log"), "one\ntwo\n");
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        let opts = RunOptions::new(Duration::from_secs(10), 1024);
        let out = run_command(sh("exit 3"), &opts).expect("run");
        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));
    }
}
