//! Subprocess isolation backend
//!
//! Each execution gets:
//! - a fresh scratch directory (removed afterwards) as its working directory
//! - a cleared environment
//! - its own session and process group, so teardown reaches every descendant
//! - `setrlimit` backstops for CPU time, address space, processes, file size,
//!   open files and core dumps
//! - new user and mount namespaces in which every host mount is read-only and
//!   only the scratch directory is writable
//! - optionally a new network namespace with no configured interfaces
//!
//! A watchdog samples `/proc` for the CPU time and resident memory of the
//! whole process group and terminates it as soon as a ceiling is crossed.

use async_trait::async_trait;
use codelab_common::Language;
use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{chdir, getgid, getuid, setsid, Pid};
use serde::{Deserialize, Serialize};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{Invocation, IsolationBoundary, RawExecutionOutcome, SandboxError};
use crate::cancel::CancelSignal;
use crate::limits::{LimitBreach, ResourceLimits};

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(20);
/// `/proc/<pid>/stat` reports times in USER_HZ, fixed at 100 on Linux
const USER_HZ: u64 = 100;
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// New network namespace; only an unconfigured loopback is visible
    #[default]
    Unshare,
    /// Share the host network
    Inherit,
}

impl NetworkPolicy {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "unshare" | "none" | "isolated" => Some(NetworkPolicy::Unshare),
            "inherit" | "host" => Some(NetworkPolicy::Inherit),
            _ => None,
        }
    }
}

pub struct ProcessSandbox {
    network: NetworkPolicy,
    scratch_root: Option<PathBuf>,
}

impl ProcessSandbox {
    pub fn new(network: NetworkPolicy) -> Self {
        Self {
            network,
            scratch_root: None,
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Run a no-op under full isolation once; hosts without unprivileged
    /// user namespaces fail here instead of on every execution
    pub fn verify(&self) -> Result<(), SandboxError> {
        let scratch = self.create_scratch()?;
        let noop = Invocation::new(Language::Python, "/bin/sh");
        let rlimits = RlimitPlan::for_limits(&ResourceLimits::default(), &noop);
        let isolation = IsolationPlan::new(self.network, scratch.path())?;

        let mut command = std::process::Command::new("/bin/sh");
        command
            .args(["-c", ":"])
            .current_dir(scratch.path())
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: as in `run`
        unsafe {
            command.pre_exec(move || enter_sandbox(rlimits, &isolation));
        }

        let status = command
            .status()
            .map_err(|e| SandboxError::SetupFailed(format!("namespace isolation unavailable: {}", e)))?;
        if !status.success() {
            return Err(SandboxError::SetupFailed(format!("isolation self-check exited with {}", status)));
        }
        Ok(())
    }

    fn create_scratch(&self) -> Result<tempfile::TempDir, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("codelab-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| SandboxError::SetupFailed(format!("cannot create scratch directory: {}", e)))
    }
}

/// Address space granted on top of the memory ceiling for interpreter mappings
const ADDRESS_SPACE_HEADROOM_BYTES: u64 = 256 * 1024 * 1024;

/// Allocator failure messages of the supported interpreters
const OUT_OF_MEMORY_MARKERS: [&str; 3] = ["MemoryError", "Cannot allocate memory", "out of memory"];

#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_secs: u64,
    file_size_bytes: u64,
    open_files: u64,
    processes: u64,
    address_space_bytes: Option<u64>,
}

impl RlimitPlan {
    fn for_limits(limits: &ResourceLimits, invocation: &Invocation) -> Self {
        Self {
            cpu_secs: limits.cpu_rlimit_secs(),
            file_size_bytes: limits.max_file_size_mb * 1024 * 1024,
            open_files: limits.max_open_files,
            processes: limits.max_processes,
            address_space_bytes: (!invocation.reserves_address_space)
                .then(|| limits.memory_bytes().saturating_add(ADDRESS_SPACE_HEADROOM_BYTES)),
        }
    }
}

/// A mount to make read-only inside the execution's mount namespace
#[derive(Debug, Clone, PartialEq)]
struct ReadOnlyMount {
    path: PathBuf,
    /// Per-mount flags that must survive the remount
    kept: MsFlags,
    /// Kernel pseudo filesystems may refuse a remount; they hold no user data
    best_effort: bool,
}

/// Namespace and mount setup, computed before fork so the child only makes syscalls
#[derive(Debug, Clone)]
struct IsolationPlan {
    unshare_network: bool,
    uid_map: String,
    gid_map: String,
    scratch: PathBuf,
    read_only: Vec<ReadOnlyMount>,
}

impl IsolationPlan {
    fn new(network: NetworkPolicy, scratch: &Path) -> Result<Self, SandboxError> {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| SandboxError::SetupFailed(format!("cannot read mount table: {}", e)))?;
        // The outer ids map onto themselves so file ownership inside scratch stays valid
        let uid = getuid().as_raw();
        let gid = getgid().as_raw();
        Ok(Self {
            unshare_network: network == NetworkPolicy::Unshare,
            uid_map: format!("{} {} 1", uid, uid),
            gid_map: format!("{} {} 1", gid, gid),
            scratch: scratch.to_path_buf(),
            read_only: parse_writable_mounts(&mountinfo),
        })
    }
}

/// Decode the octal escapes (`\040` for a space) used in mountinfo paths
fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if bytes[i] == b'\\' && octal {
            let value = bytes[i + 1..i + 4].iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    PathBuf::from(std::ffi::OsString::from_vec(out))
}

/// Mounts from `/proc/self/mountinfo` that are currently writable
fn parse_writable_mounts(mountinfo: &str) -> Vec<ReadOnlyMount> {
    mountinfo
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let mount_point = fields.nth(4)?;
            let options = fields.next()?;
            let mut kept = MsFlags::empty();
            for option in options.split(',') {
                match option {
                    "ro" => return None,
                    "nosuid" => kept |= MsFlags::MS_NOSUID,
                    "nodev" => kept |= MsFlags::MS_NODEV,
                    "noexec" => kept |= MsFlags::MS_NOEXEC,
                    "noatime" => kept |= MsFlags::MS_NOATIME,
                    "nodiratime" => kept |= MsFlags::MS_NODIRATIME,
                    "relatime" => kept |= MsFlags::MS_RELATIME,
                    "strictatime" => kept |= MsFlags::MS_STRICTATIME,
                    _ => {}
                }
            }
            let path = unescape_mount_path(mount_point);
            let best_effort = path.starts_with("/proc") || path.starts_with("/sys");
            Some(ReadOnlyMount { path, kept, best_effort })
        })
        .collect()
}

/// Enter fresh user, mount and (optionally) network namespaces, then leave
/// only the scratch directory writable
fn isolate(plan: &IsolationPlan) -> std::io::Result<()> {
    let mut namespaces = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS;
    if plan.unshare_network {
        namespaces |= CloneFlags::CLONE_NEWNET;
    }
    unshare(namespaces)?;

    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::write("/proc/self/uid_map", &plan.uid_map)?;
    std::fs::write("/proc/self/gid_map", &plan.gid_map)?;

    // Nothing below may propagate back to the host
    mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)?;
    // A separate mount for scratch, untouched by the read-only pass
    let scratch = plan.scratch.as_path();
    mount(Some(scratch), scratch, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)?;

    for target in &plan.read_only {
        let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | target.kept;
        match mount(None::<&str>, target.path.as_path(), None::<&str>, flags, None::<&str>) {
            Ok(()) => {}
            Err(_) if target.best_effort => {}
            Err(Errno::ENOENT) => {}
            Err(e) => return Err(e.into()),
        }
    }

    // The working directory was entered before the bind mount; re-enter through it
    chdir(scratch)?;
    Ok(())
}

/// Runs in the forked child between fork and exec
fn enter_sandbox(limits: RlimitPlan, isolation: &IsolationPlan) -> std::io::Result<()> {
    setsid()?;
    isolate(isolation)?;
    // SIGXCPU at the soft limit, SIGKILL one second later
    setrlimit(Resource::RLIMIT_CPU, limits.cpu_secs, limits.cpu_secs + 1)?;
    setrlimit(Resource::RLIMIT_FSIZE, limits.file_size_bytes, limits.file_size_bytes)?;
    setrlimit(Resource::RLIMIT_NOFILE, limits.open_files, limits.open_files)?;
    setrlimit(Resource::RLIMIT_NPROC, limits.processes, limits.processes)?;
    if let Some(bytes) = limits.address_space_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

/// Process group of one execution; killed when dropped
struct ProcessGroup {
    pgid: Pid,
}

impl ProcessGroup {
    fn signal(&self, signal: Signal) {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = %self.pgid, signal = ?signal, error = %e, "Failed to signal process group"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let _ = killpg(self.pgid, Signal::SIGKILL);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct UsageSample {
    cpu_ms: u64,
    rss_kb: u64,
}

/// Sum CPU time and resident memory over every live member of process group `pgid`
///
/// The leader contributes its peak RSS, other members their current RSS. CPU
/// time of reaped children is already folded into their parent's counters.
fn sample_group(pgid: u32) -> Option<UsageSample> {
    let mut total: Option<UsageSample> = None;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        if parse_pgrp(&stat) != Some(pgid) {
            continue;
        }
        let Some(cpu_ms) = parse_cpu_ms(&stat) else {
            continue;
        };
        let rss_kb = std::fs::read_to_string(format!("/proc/{}/status", pid))
            .ok()
            .and_then(|status| {
                if pid == pgid {
                    parse_peak_rss_kb(&status)
                } else {
                    parse_rss_kb(&status)
                }
            })
            .unwrap_or(0);

        let sample = total.get_or_insert_with(UsageSample::default);
        sample.cpu_ms += cpu_ms;
        sample.rss_kb += rss_kb;
    }
    total
}

/// Fields of `/proc/<pid>/stat` following the command name
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    Some(rest.split_whitespace().collect())
}

fn parse_pgrp(stat: &str) -> Option<u32> {
    stat_fields(stat)?.get(2)?.parse().ok()
}

/// utime + stime + cutime + cstime from `/proc/<pid>/stat`, in milliseconds
fn parse_cpu_ms(stat: &str) -> Option<u64> {
    let fields = stat_fields(stat)?;
    let mut ticks = 0u64;
    for index in 11..=14 {
        ticks += fields.get(index)?.parse::<u64>().ok()?;
    }
    Some(ticks * 1000 / USER_HZ)
}

fn status_kb(status: &str, name: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(name))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse::<u64>().ok())
}

fn parse_rss_kb(status: &str) -> Option<u64> {
    status_kb(status, "VmRSS:")
}

/// Peak resident set size from `/proc/<pid>/status`, falling back to current RSS
fn parse_peak_rss_kb(status: &str) -> Option<u64> {
    status_kb(status, "VmHWM:").or_else(|| parse_rss_kb(status))
}

fn reports_out_of_memory(stderr: &str) -> bool {
    OUT_OF_MEMORY_MARKERS.iter().any(|marker| stderr.contains(marker))
}

fn spawn_stdin_writer(stdin: Option<ChildStdin>, input: Vec<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            // The program may exit without reading; a broken pipe is expected
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        }
    })
}

/// Read a stream to EOF keeping at most `cap` bytes. `overflow` is notified
/// the first time the cap is exceeded; the rest of the stream is drained.
async fn read_capped<R>(reader: Option<R>, cap: usize, overflow: Option<Arc<Notify>>) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let room = cap.saturating_sub(buf.len());
        if n > room {
            buf.extend_from_slice(&chunk[..room]);
            if !truncated {
                truncated = true;
                if let Some(overflow) = &overflow {
                    overflow.notify_one();
                }
            }
        } else {
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    (buf, truncated)
}

async fn collect_stream(task: &mut JoinHandle<(Vec<u8>, bool)>, wait: Duration) -> (String, bool) {
    match tokio::time::timeout(wait, &mut *task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        _ => {
            // A descendant escaped the group and still holds the pipe
            task.abort();
            (String::new(), false)
        }
    }
}

async fn terminate_gracefully(child: &mut Child, group: &ProcessGroup, grace: Duration) -> Option<ExitStatus> {
    group.signal(Signal::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            group.signal(Signal::SIGKILL);
            child.wait().await.ok()
        }
    }
}

/// Wait for exit or the first limit breach, terminating the group on a breach
async fn supervise(
    child: &mut Child,
    pid: u32,
    group: &ProcessGroup,
    limits: &ResourceLimits,
    overflow: &Notify,
    cancel: &mut CancelSignal,
) -> (Option<ExitStatus>, Option<LimitBreach>, UsageSample) {
    let deadline = tokio::time::Instant::now() + limits.wall_time();
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut usage = UsageSample::default();

    let breach = loop {
        tokio::select! {
            status = child.wait() => return (status.ok(), None, usage),
            _ = tokio::time::sleep_until(deadline) => break LimitBreach::WallTime,
            _ = overflow.notified() => break LimitBreach::OutputSize,
            _ = cancel.cancelled() => break LimitBreach::Cancelled,
            _ = watchdog.tick() => {
                if let Some(sample) = sample_group(pid) {
                    usage.cpu_ms = usage.cpu_ms.max(sample.cpu_ms);
                    usage.rss_kb = usage.rss_kb.max(sample.rss_kb);
                    if sample.cpu_ms > limits.cpu_time_ms {
                        break LimitBreach::CpuTime;
                    }
                    if sample.rss_kb.saturating_mul(1024) > limits.memory_bytes() {
                        break LimitBreach::Memory;
                    }
                }
            }
        }
    };

    let status = if breach == LimitBreach::Cancelled {
        terminate_gracefully(child, group, limits.grace_period()).await
    } else {
        group.signal(Signal::SIGKILL);
        child.wait().await.ok()
    };

    (status, Some(breach), usage)
}

#[async_trait]
impl IsolationBoundary for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(
        &self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        mut cancel: CancelSignal,
    ) -> Result<RawExecutionOutcome, SandboxError> {
        let scratch = self.create_scratch()?;
        for file in &invocation.files {
            tokio::fs::write(scratch.path().join(&file.name), &file.contents).await?;
        }

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .env("LANG", "C.UTF-8")
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let rlimits = RlimitPlan::for_limits(limits, invocation);
        let isolation = IsolationPlan::new(self.network, scratch.path())?;
        // SAFETY: enter_sandbox only makes syscalls on data prepared before the
        // fork (paths go through stack buffers) and takes no locks.
        unsafe {
            command.pre_exec(move || enter_sandbox(rlimits, &isolation));
        }

        let mut child = command.spawn().map_err(|e| {
            SandboxError::SetupFailed(format!("failed to spawn {}: {}", invocation.program, e))
        })?;
        let started = Instant::now();
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::SetupFailed("process exited before supervision".to_string()))?;
        let group = ProcessGroup {
            pgid: Pid::from_raw(pid as i32),
        };
        debug!(pid, program = %invocation.program, language = %invocation.language, "Spawned sandboxed process");

        let writer = spawn_stdin_writer(child.stdin.take(), stdin.as_bytes().to_vec());
        let overflow = Arc::new(Notify::new());
        let mut stdout_task = tokio::spawn(read_capped(
            child.stdout.take(),
            limits.output_bytes,
            Some(overflow.clone()),
        ));
        let mut stderr_task = tokio::spawn(read_capped(child.stderr.take(), limits.stderr_bytes, None));

        let (status, mut breach, usage) =
            supervise(&mut child, pid, &group, limits, &overflow, &mut cancel).await;
        let wall_time_ms = started.elapsed().as_millis() as u64;

        // Leader is gone; sweep anything it left behind in the group
        group.signal(Signal::SIGKILL);
        writer.abort();

        let (stdout, stdout_truncated) = collect_stream(&mut stdout_task, limits.grace_period()).await;
        let (stderr, _) = collect_stream(&mut stderr_task, limits.grace_period()).await;

        // An allocation refused by RLIMIT_AS surfaces as the interpreter's own error
        let exited_cleanly = status.is_some_and(|s| s.success());
        if breach.is_none()
            && !exited_cleanly
            && rlimits.address_space_bytes.is_some()
            && reports_out_of_memory(&stderr)
        {
            breach = Some(LimitBreach::Memory);
        }

        if let Err(e) = scratch.close() {
            warn!(error = %e, "Failed to remove scratch directory");
        }

        debug!(
            pid,
            exit_code = ?status.and_then(|s| s.code()),
            breach = ?breach,
            wall_time_ms,
            cpu_time_ms = usage.cpu_ms,
            "Sandboxed process finished"
        );

        Ok(RawExecutionOutcome {
            stdout,
            stderr,
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            wall_time_ms,
            cpu_time_ms: Some(usage.cpu_ms),
            peak_memory_kb: (usage.rss_kb > 0).then_some(usage.rss_kb),
            breach,
            stdout_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;

    fn sandbox() -> ProcessSandbox {
        ProcessSandbox::new(NetworkPolicy::Inherit)
    }

    fn shell(script: &str) -> Invocation {
        Invocation::new(Language::Python, "/bin/sh").with_args(["-c", script])
    }

    fn limits(wall_time_ms: u64) -> ResourceLimits {
        ResourceLimits {
            wall_time_ms,
            cpu_time_ms: wall_time_ms,
            ..ResourceLimits::default()
        }
    }

    fn is_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => false,
            Ok(stat) => {
                let state = stat[stat.rfind(')').unwrap() + 1..].split_whitespace().next();
                !matches!(state, Some("Z") | Some("X"))
            }
        }
    }

    #[test]
    fn test_parse_cpu_ms() {
        let stat = "4242 (python3 (x)) R 1 4242 4242 0 -1 4194304 120 0 0 0 37 13 0 0 20 0 1 0 100 0 0";
        assert_eq!(parse_cpu_ms(stat), Some(500));
        assert_eq!(parse_cpu_ms("garbage"), None);
    }

    #[test]
    fn test_parse_peak_rss() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmHWM:\t    9000 kB\nVmRSS:\t    8000 kB\n";
        assert_eq!(parse_peak_rss_kb(status), Some(9000));
        assert_eq!(parse_peak_rss_kb("VmRSS:\t 700 kB\n"), Some(700));
        assert_eq!(parse_peak_rss_kb("Name:\tzombie\n"), None);
    }

    #[test]
    fn test_parse_pgrp() {
        let stat = "4300 (sh) S 4242 4242 4242 0 -1 4194304 120 0 0 0 1 1 0 0 20 0 1 0 100 0 0";
        assert_eq!(parse_pgrp(stat), Some(4242));
        assert_eq!(parse_pgrp("4300 (sh)"), None);
    }

    #[test]
    fn test_parse_rss_ignores_peak() {
        let status = "VmHWM:\t    9000 kB\nVmRSS:\t    8000 kB\n";
        assert_eq!(parse_rss_kb(status), Some(8000));
    }

    #[test]
    fn test_writable_mounts_keep_locked_flags() {
        let mountinfo = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /tmp rw,nosuid,nodev shared:2 - tmpfs tmpfs rw
24 22 0:22 / /usr ro,relatime shared:3 - ext4 /dev/sda2 ro
25 22 0:5 / /proc rw,nosuid,nodev,noexec,relatime shared:4 - proc proc rw
26 22 8:3 / /mnt/my\\040disk rw,noatime shared:5 - ext4 /dev/sda3 rw
";
        let mounts = parse_writable_mounts(mountinfo);
        let paths: Vec<&Path> = mounts.iter().map(|m| m.path.as_path()).collect();
        assert_eq!(
            paths,
            vec![Path::new("/"), Path::new("/tmp"), Path::new("/proc"), Path::new("/mnt/my disk")]
        );
        assert_eq!(mounts[0].kept, MsFlags::MS_RELATIME);
        assert_eq!(mounts[1].kept, MsFlags::MS_NOSUID | MsFlags::MS_NODEV);
        assert!(!mounts[1].best_effort);
        assert!(mounts[2].best_effort);
    }

    #[test]
    fn test_address_space_follows_memory_ceiling() {
        let limits = ResourceLimits {
            memory_mb: 64,
            max_processes: 8,
            ..ResourceLimits::default()
        };

        let plan = RlimitPlan::for_limits(&limits, &shell(":"));
        assert_eq!(plan.processes, 8);
        assert_eq!(plan.address_space_bytes, Some(64 * 1024 * 1024 + ADDRESS_SPACE_HEADROOM_BYTES));

        let plan = RlimitPlan::for_limits(&limits, &shell(":").reserving_address_space());
        assert_eq!(plan.address_space_bytes, None);
    }

    #[test]
    fn test_out_of_memory_markers() {
        assert!(reports_out_of_memory("Traceback (most recent call last):\nMemoryError\n"));
        assert!(reports_out_of_memory("Error: out of memory\n"));
        assert!(!reports_out_of_memory("ValueError: bad input\n"));
    }

    #[tokio::test]
    async fn test_memory_of_child_processes_counts_against_ceiling() {
        let mut limits = limits(10_000);
        limits.memory_mb = 64;

        // The shell itself stays small; `tail` buffers 150 MB of a pipe
        let script = "head -c 200000000 /dev/zero | tail -c 150000000 > /dev/null; echo survived";
        let outcome = sandbox()
            .run(&shell(script), "", &limits, CancelSignal::never())
            .await
            .unwrap();

        assert_ne!(outcome.stdout, "survived\n");
        assert_eq!(outcome.breach, Some(LimitBreach::Memory));
    }

    #[tokio::test]
    async fn test_fork_bomb_is_bounded() {
        let mut limits = limits(3000);
        limits.max_processes = 8;

        let script = "for i in 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16; do sleep 5 & done; echo started";
        let outcome = sandbox()
            .run(&shell(script), "", &limits, CancelSignal::never())
            .await
            .unwrap();

        assert_ne!(outcome.stdout, "started\n");
    }

    #[tokio::test]
    async fn test_only_scratch_is_writable() {
        let outside = std::env::temp_dir().join(format!("codelab-outside-{}", uuid::Uuid::new_v4()));
        let script = format!(
            "echo inside > inside.txt && cat inside.txt; echo owned > {} 2>/dev/null && echo escaped; true",
            outside.display()
        );

        let outcome = sandbox()
            .run(&shell(&script), "", &limits(5000), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "inside\n");
        assert!(!outside.exists());
    }

    #[test]
    fn test_self_check_passes() {
        sandbox().verify().unwrap();
    }

    #[tokio::test]
    async fn test_echoes_stdin() {
        let outcome = sandbox()
            .run(&shell("cat"), "hello\n", &limits(5000), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.breach.is_none());
    }

    #[tokio::test]
    async fn test_captures_streams_and_exit_code_separately() {
        let outcome = sandbox()
            .run(&shell("echo out; echo err 1>&2; exit 3"), "", &limits(5000), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_wall_timeout_kills_whole_group() {
        let outcome = sandbox()
            .run(&shell("sleep 30 & echo $!; wait"), "", &limits(300), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.breach, Some(LimitBreach::WallTime));
        assert!(outcome.wall_time_ms < 5000);

        let orphan: i32 = outcome.stdout.trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..50 {
            alive = is_alive(orphan);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background process {} survived the timeout", orphan);
    }

    #[tokio::test]
    async fn test_output_cap_truncates_and_terminates() {
        let mut limits = limits(5000);
        limits.output_bytes = 1024;

        let outcome = sandbox()
            .run(&shell("yes"), "", &limits, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.breach, Some(LimitBreach::OutputSize));
        assert!(outcome.stdout_truncated);
        assert_eq!(outcome.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_cpu_ceiling_is_independent_of_wall_clock() {
        let mut limits = limits(10_000);
        limits.cpu_time_ms = 300;

        let outcome = sandbox()
            .run(&shell("while :; do :; done"), "", &limits, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.breach, Some(LimitBreach::CpuTime));
        assert!(outcome.wall_time_ms < 10_000);
    }

    #[tokio::test]
    async fn test_cancellation_terminates_within_grace_period() {
        let (handle, signal) = cancel_pair();
        let started = Instant::now();

        let run = tokio::spawn(async move {
            sandbox()
                .run(&shell("sleep 30"), "", &limits(30_000), signal)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome.breach, Some(LimitBreach::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_scratch_directory_is_discarded() {
        let invocation = shell("cat data.txt; echo; pwd").with_file("data.txt", "abc");
        let outcome = sandbox()
            .run(&invocation, "", &limits(5000), CancelSignal::never())
            .await
            .unwrap();

        let mut lines = outcome.stdout.lines();
        assert_eq!(lines.next(), Some("abc"));
        let scratch = lines.next().unwrap();
        assert!(scratch.contains("codelab-"));
        assert!(!std::path::Path::new(scratch).exists());
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("CODELAB_HOST_SECRET", "leak");
        let outcome = sandbox()
            .run(&shell("echo \"[$CODELAB_HOST_SECRET]\""), "", &limits(5000), CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "[]\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_a_setup_failure() {
        let invocation = Invocation::new(Language::Python, "/nonexistent/interpreter");
        let err = sandbox()
            .run(&invocation, "", &limits(1000), CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SetupFailed(_)));
    }
}
