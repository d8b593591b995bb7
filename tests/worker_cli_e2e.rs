#![cfg(all(feature = "cli", any(target_os = "linux", target_os = "macos")))]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tempfile::{TempDir, tempdir};

use mutation_executor::mutation::{
    Handshake, MutationConfig, MutationOperator, SandboxSpec, TestGroup, WorkerExit, read_records,
};

const LIB: &str = "use std::sync::LazyLock;

pub fn add(a: i32, b: i32) -> i32 {
    a + b
}

pub static BASE: LazyLock<i32> = LazyLock::new(|| {
    1 + 2
});
";

struct Fixture {
    tmp: TempDir,
    handshake: Vec<u8>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempdir().expect("tempdir should be created");
        let project = tmp.path().join("project");
        fs::create_dir_all(project.join("src")).expect("project src should be created");
        fs::write(project.join("src/lib.rs"), LIB).expect("lib.rs should be written");

        let handshake = Handshake {
            config: MutationConfig::default()
                .with_threshold(50)
                .with_operators([MutationOperator::Arithmetic]),
            context: SandboxSpec::new(
                &project,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "grep -q 'a + b' src/lib.rs".to_string(),
                ],
            ),
            tests: TestGroup::new("lib"),
        };
        let mut buf = Vec::new();
        handshake.write_to(&mut buf).expect("handshake should encode");
        fs::write(tmp.path().join("handshake"), &buf).expect("handshake should be written");

        Self {
            tmp,
            handshake: buf,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    fn run(&self, start: usize, end: usize, input: &Path) -> Output {
        self.run_with_stdin(start, end, input, &[])
    }

    fn run_with_stdin(&self, start: usize, end: usize, input: &Path, stdin: &[u8]) -> Output {
        let mut child = Command::new(env!("CARGO_BIN_EXE_mutation-worker"))
            .arg(start.to_string())
            .arg(end.to_string())
            .arg("src/lib.rs")
            .arg(input)
            .arg(self.path("records"))
            .env("MUTATION_WORKER_MEMORY_LIMIT", (1u64 << 40).to_string())
            .env("RUST_LOG", "debug")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("worker should start");
        child
            .stdin
            .take()
            .expect("stdin should be piped")
            .write_all(stdin)
            .expect("stdin should be written");
        child.wait_with_output().expect("worker should finish")
    }
}

fn exit_of(output: &Output) -> WorkerExit {
    WorkerExit::from_code(output.status.code().expect("worker should exit normally"))
}

#[test]
fn worker_restarts_at_static_initializer_and_resumes() {
    let fixture = Fixture::new();
    let handshake = fixture.path("handshake");

    let first = fixture.run(0, 2, &handshake);
    assert_eq!(
        exit_of(&first),
        WorkerExit::ForcedRestart,
        "stderr: {}",
        String::from_utf8_lossy(&first.stderr)
    );

    let replay = read_records(&fixture.path("records")).expect("records should replay");
    assert_eq!(replay.records.len(), 1);
    assert!(replay.records[0].detected);
    assert_eq!(replay.records[0].member_signature, "add(a: i32, b: i32) -> i32");

    let resume_at = replay
        .resume_index(mutation_executor::mutation::IndexRange::new(0, 2))
        .expect("one index should remain");
    assert_eq!(resume_at, 1);

    let second = fixture.run(resume_at, 2, &handshake);
    assert_eq!(exit_of(&second), WorkerExit::Ok);

    let replay = read_records(&fixture.path("records")).expect("records should replay");
    let outcomes: Vec<(usize, bool)> = replay.records.iter().map(|r| (r.index, r.detected)).collect();
    assert_eq!(outcomes, vec![(0, true), (1, false)]);
    assert_eq!(replay.records[1].member_signature, "static BASE");

    let original = fs::read_to_string(fixture.path("project/src/lib.rs")).expect("lib.rs readable");
    assert_eq!(original, LIB);
}

#[test]
fn worker_reads_handshake_from_stdin() {
    let fixture = Fixture::new();
    let output = fixture.run_with_stdin(0, 1, Path::new("-"), &fixture.handshake);
    assert_eq!(exit_of(&output), WorkerExit::Ok);

    let replay = read_records(&fixture.path("records")).expect("records should replay");
    assert_eq!(replay.records.len(), 1);
}

#[test]
fn truncated_handshake_is_an_unknown_error() {
    let fixture = Fixture::new();
    let text = String::from_utf8(fixture.handshake.clone()).expect("handshake should be utf8");
    let truncated = fixture.path("truncated");
    fs::write(&truncated, text.lines().next().expect("first line")).expect("should be written");

    let output = fixture.run(0, 2, &truncated);
    assert_eq!(exit_of(&output), WorkerExit::UnknownError);
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read handshake"));
}
