//! Abort token and the background memory watchdog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use super::config::WatchdogConfig;

/// Why a worker was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Memory use crossed the watchdog threshold.
    ResourceExhausted,
    /// Operator interrupt.
    Interrupted,
}

impl AbortReason {
    fn to_raw(self) -> u8 {
        match self {
            Self::ResourceExhausted => 1,
            Self::Interrupted => 2,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::ResourceExhausted),
            2 => Some(Self::Interrupted),
            _ => None,
        }
    }
}

/// Shared, clonable cancellation flag. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    reason: Arc<AtomicU8>,
}

impl AbortToken {
    /// Untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort.
    pub fn trip(&self, reason: AbortReason) {
        let _ = self
            .reason
            .compare_exchange(0, reason.to_raw(), Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Reason for the abort, if one was requested.
    pub fn reason(&self) -> Option<AbortReason> {
        AbortReason::from_raw(self.reason.load(Ordering::SeqCst))
    }

    /// True once tripped.
    pub fn is_tripped(&self) -> bool {
        self.reason().is_some()
    }
}

/// One memory sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes in use.
    pub used_bytes: u64,
    /// Bytes available before the process is in trouble.
    pub limit_bytes: u64,
}

/// Source of memory samples.
pub trait MemoryProbe: Send + 'static {
    /// Current usage, or `None` when it cannot be measured.
    fn sample(&self) -> Option<MemoryUsage>;
}

/// Resident set size of this process and every descendant, read from `/proc`, against a fixed
/// or cgroup limit. Test commands run as child processes, so their memory is counted too.
#[derive(Debug, Clone)]
pub struct ProcMemoryProbe {
    proc_root: PathBuf,
    pid: u32,
    limit_bytes: Option<u64>,
}

impl ProcMemoryProbe {
    /// Probe using `limit_bytes`, falling back to the cgroup v2 `memory.max` value.
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            pid: std::process::id(),
            limit_bytes: limit_bytes.or_else(cgroup_memory_max),
        }
    }

    /// Measure the tree rooted at `pid` under a different proc mount.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>, pid: u32) -> Self {
        self.proc_root = proc_root.into();
        self.pid = pid;
        self
    }

    /// Limit this probe compares against.
    pub fn limit_bytes(&self) -> Option<u64> {
        self.limit_bytes
    }
}

fn cgroup_memory_max() -> Option<u64> {
    std::fs::read_to_string("/sys/fs/cgroup/memory.max")
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Parse `VmRSS:   1234 kB` out of a proc status document.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}

/// Parent pid out of a `/proc/<pid>/stat` line. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_parent_pid(stat: &str) -> Option<u32> {
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(1)?.parse().ok()
}

/// `root` followed by all of its live descendants.
fn process_tree(proc_root: &Path, root: u32) -> Vec<u32> {
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    if let Ok(entries) = std::fs::read_dir(proc_root) {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let Some(parent) = std::fs::read_to_string(entry.path().join("stat"))
                .ok()
                .and_then(|stat| parse_parent_pid(&stat))
            else {
                continue;
            };
            if parent != pid {
                children.entry(parent).or_default().push(pid);
            }
        }
    }

    let mut tree = vec![root];
    let mut next = 0;
    while let Some(&pid) = tree.get(next) {
        if let Some(kids) = children.remove(&pid) {
            tree.extend(kids);
        }
        next += 1;
    }
    tree
}

impl MemoryProbe for ProcMemoryProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        let limit_bytes = self.limit_bytes?;
        let mut used_bytes = None;
        for pid in process_tree(&self.proc_root, self.pid) {
            let status = self.proc_root.join(pid.to_string()).join("status");
            // Zombies and processes that exited since the scan have no VmRSS.
            if let Some(rss) = std::fs::read_to_string(status)
                .ok()
                .and_then(|status| parse_vm_rss(&status))
            {
                *used_bytes.get_or_insert(0) += rss;
            }
        }
        Some(MemoryUsage {
            used_bytes: used_bytes?,
            limit_bytes,
        })
    }
}

/// Background thread that trips an [`AbortToken`] when memory use crosses the threshold.
pub struct MemoryWatchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryWatchdog {
    /// Start sampling `probe`. `on_breach` runs once, after the token is tripped.
    pub fn spawn<P, F>(
        probe: P,
        config: WatchdogConfig,
        token: AbortToken,
        on_breach: F,
    ) -> std::io::Result<Self>
    where
        P: MemoryProbe,
        F: FnOnce(MemoryUsage) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("memory-watchdog".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    if let Some(usage) = probe.sample() {
                        if usage.used_bytes >= config.trip_point(usage.limit_bytes) {
                            warn!(
                                used_bytes = usage.used_bytes,
                                limit_bytes = usage.limit_bytes,
                                threshold_percent = config.threshold_percent,
                                "memory has exceeded the shutdown threshold"
                            );
                            token.trip(AbortReason::ResourceExhausted);
                            on_breach(usage);
                            return;
                        }
                    } else {
                        debug!("memory usage unavailable, watchdog idle");
                    }
                    std::thread::sleep(config.poll_interval);
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop sampling and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    struct FixedProbe {
        used: Arc<AtomicU64>,
        limit: u64,
    }

    impl MemoryProbe for FixedProbe {
        fn sample(&self) -> Option<MemoryUsage> {
            Some(MemoryUsage {
                used_bytes: self.used.load(Ordering::SeqCst),
                limit_bytes: self.limit,
            })
        }
    }

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig::default().with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn first_abort_reason_wins() {
        let token = AbortToken::new();
        assert!(!token.is_tripped());
        token.trip(AbortReason::Interrupted);
        token.trip(AbortReason::ResourceExhausted);
        assert_eq!(token.reason(), Some(AbortReason::Interrupted));
        assert!(token.clone().is_tripped());
    }

    #[test]
    fn parse_vm_rss_reads_kib() {
        let status = "Name:\tworker\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tworker\n"), None);
    }

    fn fake_process(proc_root: &Path, pid: u32, parent: u32, rss_kib: Option<u64>) {
        let dir = proc_root.join(pid.to_string());
        std::fs::create_dir_all(&dir).expect("pid dir should be created");
        std::fs::write(
            dir.join("stat"),
            format!("{pid} (cargo test (x)) S {parent} {pid} {pid} 0 -1\n"),
        )
        .expect("stat should be written");
        let status = match rss_kib {
            Some(kib) => format!("Name:\tp{pid}\nVmRSS:\t{kib} kB\n"),
            None => format!("Name:\tp{pid}\nState:\tZ (zombie)\n"),
        };
        std::fs::write(dir.join("status"), status).expect("status should be written");
    }

    #[test]
    fn memory_usage_includes_child_processes() {
        let proc_root = tempfile::tempdir().expect("tempdir should be created");
        fake_process(proc_root.path(), 100, 1, Some(1000));
        fake_process(proc_root.path(), 200, 100, Some(3000));
        fake_process(proc_root.path(), 300, 200, Some(5000));
        fake_process(proc_root.path(), 310, 200, None);
        fake_process(proc_root.path(), 400, 1, Some(70_000));
        std::fs::create_dir_all(proc_root.path().join("self")).expect("self should be created");

        let sampler = ProcMemoryProbe::new(Some(1 << 30)).with_proc_root(proc_root.path(), 100);
        let usage = sampler.sample().expect("usage should be measured");
        assert_eq!(usage.used_bytes, (1000 + 3000 + 5000) * 1024);
        assert_eq!(usage.limit_bytes, 1 << 30);

        let mut tree = process_tree(proc_root.path(), 100);
        tree.sort_unstable();
        assert_eq!(tree, vec![100, 200, 300, 310]);
    }

    #[test]
    fn parent_pid_survives_odd_command_names() {
        assert_eq!(parse_parent_pid("42 (a) b (c)) R 7 42 42 0"), Some(7));
        assert_eq!(parse_parent_pid("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_child_process_is_part_of_the_tree() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("sleep should start");
        let tree = process_tree(Path::new("/proc"), std::process::id());
        let _ = child.kill();
        let _ = child.wait();
        assert!(tree.contains(&child.id()), "tree: {tree:?}");
    }

    #[test]
    fn watchdog_trips_token_and_runs_hook_on_breach() {
        let used = Arc::new(AtomicU64::new(100));
        let probe = FixedProbe {
            used: Arc::clone(&used),
            limit: 1000,
        };
        let token = AbortToken::new();
        let (tx, rx) = mpsc::channel();

        let watchdog = MemoryWatchdog::spawn(probe, fast_config(), token.clone(), move |usage| {
            let _ = tx.send(usage);
        })
        .expect("watchdog should spawn");

        std::thread::sleep(Duration::from_millis(20));
        assert!(!token.is_tripped());

        used.store(950, Ordering::SeqCst);
        let usage = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("breach hook should run");
        assert_eq!(usage.used_bytes, 950);
        assert_eq!(token.reason(), Some(AbortReason::ResourceExhausted));
        watchdog.stop();
    }

    #[test]
    fn watchdog_stops_quietly_below_threshold() {
        let probe = FixedProbe {
            used: Arc::new(AtomicU64::new(10)),
            limit: 1000,
        };
        let token = AbortToken::new();
        let watchdog = MemoryWatchdog::spawn(probe, fast_config(), token.clone(), |_| {
            panic!("hook must not run below the threshold")
        })
        .expect("watchdog should spawn");
        std::thread::sleep(Duration::from_millis(20));
        watchdog.stop();
        assert!(!token.is_tripped());
    }
}
