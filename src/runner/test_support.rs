//! Scripted executor for runner tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use super::SandboxRunner;
use crate::config::Config;
use crate::executor::{CommandSpec, PhaseResult, ProcessExecutor};

#[derive(Default)]
struct State {
    responses: VecDeque<PhaseResult>,
    calls: Vec<CommandSpec>,
    staged: Vec<BTreeMap<String, String>>,
}

/// Records every command and answers from a queue of canned results.
/// Once the queue is empty every command succeeds with no output.
///
/// For `docker build` and any `docker run` with a bind mount, the files in
/// the workspace are captured at call time, since the workspace is gone by
/// the time the runner returns.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    state: Arc<Mutex<State>>,
}

impl ScriptedExecutor {
    pub fn new(responses: impl IntoIterator<Item = PhaseResult>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                responses: responses.into_iter().collect(),
                ..State::default()
            })),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Workspace contents captured per build or mounted run.
    pub fn staged(&self) -> Vec<BTreeMap<String, String>> {
        self.state.lock().unwrap().staged.clone()
    }
}

#[async_trait]
impl ProcessExecutor for ScriptedExecutor {
    async fn execute(&self, command: &CommandSpec) -> PhaseResult {
        let snapshot = context_dir(command).map(|dir| snapshot(&dir));
        let mut state = self.state.lock().unwrap();
        state.calls.push(command.clone());
        if let Some(files) = snapshot {
            state.staged.push(files);
        }
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| PhaseResult::completed("", "", 0))
    }
}

fn context_dir(command: &CommandSpec) -> Option<PathBuf> {
    match command.args.first().map(String::as_str) {
        Some("build") => command.args.last().map(PathBuf::from),
        Some("run") => {
            let volume = command
                .args
                .iter()
                .position(|a| a == "-v")
                .and_then(|i| command.args.get(i + 1))?;
            volume.split(':').next().map(PathBuf::from)
        }
        _ => None,
    }
}

fn snapshot(dir: &Path) -> BTreeMap<String, String> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let contents = std::fs::read_to_string(entry.path()).ok()?;
            Some((entry.file_name().to_string_lossy().into_owned(), contents))
        })
        .collect()
}

/// A runner whose workspaces live in a fresh temp dir.
pub fn runner_in(executor: ScriptedExecutor) -> (TempDir, SandboxRunner<ScriptedExecutor>) {
    let root = tempfile::tempdir().unwrap();
    let config = Config {
        workspace_root: Some(root.path().to_path_buf()),
        ..Config::default()
    };
    let runner = SandboxRunner::new(executor, &config);
    (root, runner)
}

pub fn assert_workspaces_removed(root: &TempDir) {
    let leftover: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name())
        .collect();
    assert!(leftover.is_empty(), "workspaces left behind: {leftover:?}");
}
