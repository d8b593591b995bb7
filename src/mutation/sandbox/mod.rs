//! Source-tree backend: mutates files of a project on disk and runs an external test command.

mod context;
mod mutator;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::config::MutationConfig;
use super::engine::{EngineError, MutationBackend};

pub use context::{SandboxContext, copy_tree};
pub use mutator::{MutationSite, SourceMutator, scan_sites};

/// Describes how to build sandboxes for one project. Sent to workers as the context descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Project root; unit ids are paths relative to it.
    pub root: PathBuf,
    /// Test command. Test ids of the group are appended as arguments.
    pub test_command: Vec<String>,
    /// Optional command run after each patch; a non-zero exit marks the mutant non-viable.
    #[serde(default)]
    pub check_command: Option<Vec<String>>,
    /// Per-command timeout. Timed-out test runs count as failures.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SandboxSpec {
    /// Spec for `root`, testing with `test_command`.
    pub fn new(root: impl AsRef<Path>, test_command: Vec<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            test_command,
            check_command: None,
            timeout_secs: None,
        }
    }
}

/// Backend over a project directory. Every context is a fresh copy of the tree.
#[derive(Debug, Clone)]
pub struct SourceTreeBackend {
    spec: SandboxSpec,
}

impl SourceTreeBackend {
    /// Backend for `spec`.
    pub fn new(spec: SandboxSpec) -> Self {
        Self { spec }
    }

    /// The sandbox spec.
    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }
}

impl MutationBackend for SourceTreeBackend {
    type Generator = SourceMutator;
    type Context = SandboxContext;

    fn generator(&self, config: &MutationConfig) -> Result<SourceMutator, EngineError> {
        Ok(SourceMutator::new(&self.spec.root, config.operators.clone()))
    }

    fn create_context(&self) -> Result<SandboxContext, EngineError> {
        SandboxContext::create(&self.spec)
    }
}
