//! Execution context backed by a private copy of a project tree.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::debug;

use super::SandboxSpec;
use crate::mutation::engine::{EngineError, ExecutionContext};
use crate::mutation::model::{TestGroup, TestRunSummary, UnitId};

const SKIP_NAMES: &[&str] = &[".git", ".hg", ".svn", "target", "node_modules", ".mutation"];

const POLL: Duration = Duration::from_millis(10);

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2048;

fn should_skip(name: &str) -> bool {
    SKIP_NAMES.contains(&name)
}

/// Copy `src` into `dst`, leaving out VCS metadata and build output.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if should_skip(&name.to_string_lossy()) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &dst.join(&name))?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), dst.join(&name))?;
        }
    }
    Ok(())
}

/// How a command invocation ended.
#[derive(Debug)]
enum CommandOutcome {
    Exited { status: ExitStatus, stderr: String },
    TimedOut,
}

fn run_command(
    argv: &[String],
    extra: &[String],
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutcome, EngineError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(EngineError::CommandFailed("empty command".to_string()));
    };

    let mut stderr_file = tempfile::tempfile()?;
    let mut command = Command::new(program);
    command
        .args(args)
        .args(extra)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr_file.try_clone()?);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so a timeout can take down everything the command started.
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .map_err(|err| EngineError::CommandFailed(format!("{program}: {err}")))?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if timeout.is_some_and(|limit| started.elapsed() > limit) {
            debug!(program = %program, pid = child.id(), "command timed out");
            kill_process_tree(&mut child);
            return Ok(CommandOutcome::TimedOut);
        }
        std::thread::sleep(POLL);
    };

    let mut stderr = String::new();
    stderr_file.seek(SeekFrom::Start(0))?;
    stderr_file.read_to_string(&mut stderr)?;
    if stderr.len() > STDERR_TAIL {
        let mut cut = stderr.len() - STDERR_TAIL;
        while !stderr.is_char_boundary(cut) {
            cut += 1;
        }
        stderr.drain(..cut);
    }
    Ok(CommandOutcome::Exited { status, stderr })
}

/// Kill `child` together with its process group and reap it.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = child.id() as libc::pid_t;
        // SAFETY: signalling a process group we created has no memory-safety requirements.
        if unsafe { libc::kill(-group, libc::SIGKILL) } != 0 {
            debug!(
                group,
                error = %std::io::Error::last_os_error(),
                "failed to signal process group"
            );
        }
    }
    if let Err(err) = child.kill() {
        debug!(pid = child.id(), error = %err, "failed to kill command");
    }
    if let Err(err) = child.wait() {
        debug!(pid = child.id(), error = %err, "failed to reap command");
    }
}

#[derive(Debug)]
struct LoadedUnit {
    unit: UnitId,
    path: PathBuf,
    original: Vec<u8>,
}

/// A scratch copy of the project. Patches rewrite the unit's file in the copy; tests run there.
///
/// The copy is removed when the context is dropped.
#[derive(Debug)]
pub struct SandboxContext {
    spec: SandboxSpec,
    workdir: TempDir,
    loaded: Option<LoadedUnit>,
}

impl SandboxContext {
    /// Copy the project at `spec.root` into a new scratch directory.
    pub fn create(spec: &SandboxSpec) -> Result<Self, EngineError> {
        let workdir = tempfile::Builder::new()
            .prefix("mutation-sandbox-")
            .tempdir()?;
        copy_tree(&spec.root, workdir.path())?;
        debug!(root = %spec.root.display(), copy = %workdir.path().display(), "sandbox created");
        Ok(Self {
            spec: spec.clone(),
            workdir,
            loaded: None,
        })
    }

    /// Root of the scratch copy.
    pub fn path(&self) -> &Path {
        self.workdir.path()
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_secs.map(Duration::from_secs)
    }
}

impl ExecutionContext for SandboxContext {
    fn load(&mut self, unit: &UnitId, _tests: &TestGroup) -> Result<(), EngineError> {
        let path = self.workdir.path().join(unit.as_str());
        let original = fs::read(&path).map_err(|_| EngineError::UnknownUnit(unit.to_string()))?;
        self.loaded = Some(LoadedUnit {
            unit: unit.clone(),
            path,
            original,
        });
        Ok(())
    }

    fn patch(&mut self, unit: &UnitId, code: &[u8]) -> Result<bool, EngineError> {
        let loaded = self.loaded.as_ref().ok_or(EngineError::NotLoaded)?;
        if &loaded.unit != unit {
            return Err(EngineError::UnknownUnit(unit.to_string()));
        }
        fs::write(&loaded.path, code)?;

        let Some(check) = &self.spec.check_command else {
            return Ok(true);
        };
        let viable = match run_command(check, &[], self.workdir.path(), self.timeout())? {
            CommandOutcome::Exited { status, .. } => status.success(),
            CommandOutcome::TimedOut => false,
        };
        if !viable {
            debug!(unit = %unit, "patch rejected by check command");
            fs::write(&loaded.path, &loaded.original)?;
        }
        Ok(viable)
    }

    fn run_tests(&mut self, tests: &TestGroup) -> Result<TestRunSummary, EngineError> {
        let outcome = run_command(
            &self.spec.test_command,
            &tests.tests,
            self.workdir.path(),
            self.timeout(),
        )?;
        let tests_run = tests.tests.len().max(1);
        Ok(match outcome {
            CommandOutcome::Exited { status, .. } if status.success() => {
                TestRunSummary::passed(tests_run)
            }
            CommandOutcome::Exited { status, stderr } => TestRunSummary::failed(
                tests.name.clone(),
                Some(format!("{status}: {}", stderr.trim_end())),
            ),
            CommandOutcome::TimedOut => {
                TestRunSummary::failed(tests.name.clone(), Some("timed out".to_string()))
            }
        })
    }
}
