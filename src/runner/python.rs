//! Python runner: builds a per-execution image with the requested pip
//! requirements, then runs `main.py` in it.

use std::time::Duration;

use super::image::ImageJob;
use super::{SandboxRunner, ScriptExecution};
use crate::config::PythonConfig;
use crate::executor::ProcessExecutor;
use crate::limits::ResourceLimits;

/// A Python execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct PythonRequest {
    pub code: String,
    /// pip requirement specifiers, e.g. `requests==2.31.0`.
    pub requirements: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub image: String,
    pub limits: ResourceLimits,
}

impl PythonRequest {
    pub fn new(code: impl Into<String>, defaults: &PythonConfig) -> Self {
        Self {
            code: code.into(),
            requirements: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(defaults.timeout_seconds),
            image: defaults.image.clone(),
            limits: defaults.limits,
        }
    }

    #[must_use]
    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    #[must_use]
    pub const fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Requirement lines with blanks dropped.
    fn requirement_lines(&self) -> Vec<&str> {
        self.requirements
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .collect()
    }

    fn dockerfile(&self) -> String {
        let mut lines = vec![
            format!("FROM {}", self.image),
            "WORKDIR /app".to_string(),
            "COPY main.py .".to_string(),
        ];
        if !self.requirement_lines().is_empty() {
            lines.push("COPY requirements.txt .".into());
            lines.push("RUN pip install --no-cache-dir -r requirements.txt".into());
        }
        lines.push(r#"CMD ["python", "-u", "main.py"]"#.into());
        lines.join("\n") + "\n"
    }
}

impl<E: ProcessExecutor> SandboxRunner<E> {
    /// Run Python code in a network-isolated container.
    pub async fn run_python(&self, request: &PythonRequest) -> ScriptExecution {
        let mut files = vec![("main.py", request.code.clone())];
        let requirements = request.requirement_lines();
        if !requirements.is_empty() {
            files.push(("requirements.txt", requirements.join("\n") + "\n"));
        }

        self.run_image_job(ImageJob {
            language: "Python",
            tag_prefix: "python-exec",
            workspace_prefix: "pyrunner_",
            code: &request.code,
            base_image: &request.image,
            files,
            dockerfile: request.dockerfile(),
            stdin: request.stdin.as_deref(),
            timeout: request.timeout,
            limits: &request.limits,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::{LaunchError, PhaseResult, NO_EXIT_CODE, REJECTED_EXIT_CODE};
    use crate::runner::test_support::{assert_workspaces_removed, runner_in, ScriptedExecutor};
    use crate::runner::TIMEOUT_EXIT_CODE;

    fn request(code: &str) -> PythonRequest {
        PythonRequest::new(code, &Config::default().python)
    }

    #[tokio::test]
    async fn hello_world() {
        let executor = ScriptedExecutor::new([
            PhaseResult::completed("Successfully built", "", 0),
            PhaseResult::completed("hello\n", "", 0),
        ]);
        let (root, runner) = runner_in(executor.clone());

        let result = runner.run_python(&request("print('hello')")).await;
        let summary = result.summary();

        assert_eq!(summary.stdout, "hello\n");
        assert_eq!(summary.exit_code, 0);
        assert!(!summary.timed_out);
        assert!(summary.error.is_none());
        assert!(result.succeeded());

        let calls = executor.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(&calls[0].args[..2], ["build", "-t"]);
        let tag = calls[0].args[2].clone();
        assert!(tag.starts_with("python-exec-"));
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(300)));

        assert_eq!(
            calls[1].args,
            [
                "run",
                "--rm",
                "--name",
                tag.as_str(),
                "--network=none",
                "--cpus=1",
                "--memory=256m",
                tag.as_str()
            ]
        );
        assert_eq!(calls[1].timeout, Some(Duration::from_secs(60)));
        assert_eq!(calls[2].args, ["rmi", "-f", tag.as_str()]);

        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn stages_source_and_dockerfile() {
        let executor = ScriptedExecutor::default();
        let (_root, runner) = runner_in(executor.clone());

        runner.run_python(&request("print('hi')")).await;

        let staged = executor.staged();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0]["main.py"], "print('hi')");
        assert!(!staged[0].contains_key("requirements.txt"));
        assert_eq!(
            staged[0]["Dockerfile"],
            "FROM python:3.10-slim\nWORKDIR /app\nCOPY main.py .\nCMD [\"python\", \"-u\", \"main.py\"]\n"
        );
    }

    #[tokio::test]
    async fn requirements_are_installed_at_build_time() {
        let executor = ScriptedExecutor::default();
        let (_root, runner) = runner_in(executor.clone());

        let req = request("import requests")
            .with_requirements(["requests==2.31.0", "  ", "numpy"])
            .with_image("python:3.12-slim");
        runner.run_python(&req).await;

        let staged = &executor.staged()[0];
        assert_eq!(staged["requirements.txt"], "requests==2.31.0\nnumpy\n");
        let dockerfile = &staged["Dockerfile"];
        assert!(dockerfile.starts_with("FROM python:3.12-slim\n"));
        assert!(dockerfile.contains("COPY requirements.txt .\n"));
        assert!(dockerfile.contains("RUN pip install --no-cache-dir -r requirements.txt\n"));
    }

    #[tokio::test]
    async fn runtime_exception_is_user_failure() {
        let executor = ScriptedExecutor::new([
            PhaseResult::completed("", "", 0),
            PhaseResult::completed(
                "",
                "Traceback (most recent call last):\n  File \"/app/main.py\", line 1\nValueError: x\n",
                1,
            ),
        ]);
        let (root, runner) = runner_in(executor.clone());

        let result = runner.run_python(&request("raise ValueError('x')")).await;
        let summary = result.summary();

        assert_eq!(summary.stdout, "");
        assert!(summary.stderr.contains("ValueError: x"));
        assert_ne!(summary.exit_code, 0);
        assert!(summary.error.is_none());
        assert!(result.ran());
        assert_eq!(executor.call_count(), 3, "image still removed");
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn failed_build_skips_run() {
        let executor = ScriptedExecutor::new([PhaseResult::completed(
            "Step 4/5",
            "ERROR: No matching distribution found for nosuchpkg",
            1,
        )]);
        let (root, runner) = runner_in(executor.clone());

        let req = request("import nosuchpkg").with_requirements(["nosuchpkg"]);
        let result = runner.run_python(&req).await;

        assert!(result.run.is_none());
        assert_eq!(result.build.exit_code, 1);
        assert_eq!(result.error.as_deref(), Some("Docker image build for Python failed."));
        let summary = result.summary();
        assert!(summary.stderr.contains("Build STDERR:\nERROR: No matching distribution"));
        assert_eq!(summary.exit_code, 1);

        // No run, and no rmi for an image that was never built.
        assert_eq!(executor.call_count(), 1);
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn build_timeout_sets_error() {
        let executor = ScriptedExecutor::new([PhaseResult::timed_out(
            "Step 3/5",
            "",
            Duration::from_secs(300),
        )]);
        let (root, runner) = runner_in(executor.clone());

        let result = runner.run_python(&request("print(1)")).await;

        assert!(result.build.timed_out);
        assert!(result.run.is_none());
        assert_eq!(result.error.as_deref(), Some("Docker image build for Python timed out."));
        assert!(result.summary().timed_out);

        // No run, but the tag is still cleaned up.
        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].args, ["rmi", "-f", calls[0].args[2].as_str()]);
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn run_timeout_is_normalized_and_container_removed() {
        let executor = ScriptedExecutor::new([
            PhaseResult::completed("", "", 0),
            PhaseResult::timed_out("tick\n", "", Duration::from_secs(2)),
        ]);
        let (root, runner) = runner_in(executor.clone());

        let req = request("import time\nprint('tick')\ntime.sleep(10)")
            .with_timeout(Duration::from_secs(2));
        let result = runner.run_python(&req).await;
        let summary = result.summary();

        assert!(summary.timed_out);
        assert_eq!(summary.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(summary.stdout, "tick\n");
        assert!(summary.stderr.contains("timed out after 2 seconds"));
        assert!(summary.error.is_none());

        let calls = executor.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1].timeout, Some(Duration::from_secs(2)));
        let tag = &calls[0].args[2];
        assert_eq!(calls[2].args, ["rm", "-f", tag.as_str()]);
        assert_eq!(calls[3].args, ["rmi", "-f", tag.as_str()]);
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn missing_backend_is_infrastructure_error() {
        let executor = ScriptedExecutor::new([PhaseResult::launch_failure(LaunchError::NotFound {
            program: "docker".into(),
        })]);
        let (root, runner) = runner_in(executor.clone());

        let result = runner.run_python(&request("print(")).await;

        let error = result.error.as_deref().unwrap();
        assert!(error.contains("not found"));
        assert!(result.build.stderr.contains("not found"));
        assert_eq!(result.build.exit_code, NO_EXIT_CODE);
        assert!(result.run.is_none());
        assert_eq!(executor.call_count(), 1);
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn stdin_is_forwarded_to_run() {
        let executor = ScriptedExecutor::default();
        let (_root, runner) = runner_in(executor.clone());

        let req = request("print(input())").with_stdin("Ada\n");
        runner.run_python(&req).await;

        let calls = executor.calls();
        assert!(calls[0].stdin.is_none());
        assert!(calls[1].args.iter().any(|a| a == "-i"));
        assert_eq!(calls[1].stdin.as_deref(), Some(&b"Ada\n"[..]));
    }

    #[tokio::test]
    async fn rmi_failure_is_only_logged() {
        let executor = ScriptedExecutor::new([
            PhaseResult::completed("", "", 0),
            PhaseResult::completed("ok\n", "", 0),
            PhaseResult::completed("", "Error: No such image", 1),
        ]);
        let (root, runner) = runner_in(executor.clone());

        let result = runner.run_python(&request("print('ok')")).await;

        assert!(result.succeeded());
        assert!(result.error.is_none());
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn empty_code_fails_fast() {
        let executor = ScriptedExecutor::default();
        let (root, runner) = runner_in(executor.clone());

        let result = runner.run_python(&request("   \n")).await;

        assert_eq!(result.build.exit_code, REJECTED_EXIT_CODE);
        assert!(result.error.is_none());
        assert!(result.run.is_none());
        assert_eq!(executor.call_count(), 0);
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn invalid_limits_fail_fast() {
        let executor = ScriptedExecutor::default();
        let (_root, runner) = runner_in(executor.clone());

        let req = request("print(1)").with_limits(ResourceLimits {
            cpus: 0.0,
            ..ResourceLimits::default()
        });
        let result = runner.run_python(&req).await;

        assert_eq!(result.build.exit_code, REJECTED_EXIT_CODE);
        assert!(result.build.stderr.contains("cpu"));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn image_with_extra_instructions_is_rejected() {
        let executor = ScriptedExecutor::default();
        let (root, runner) = runner_in(executor.clone());

        let req = request("print(1)").with_image("python:3.10-slim\nRUN pip download requests");
        let result = runner.run_python(&req).await;

        assert_eq!(result.build.exit_code, REJECTED_EXIT_CODE);
        assert!(result.build.stderr.contains("Invalid base image reference"));
        assert!(result.error.is_none());
        assert_eq!(executor.call_count(), 0);
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn concurrent_runs_use_distinct_tags() {
        let executor = ScriptedExecutor::default();
        let (root, runner) = runner_in(executor.clone());

        let a = request("print('a')");
        let b = request("print('b')");
        tokio::join!(runner.run_python(&a), runner.run_python(&b));

        let tags: std::collections::HashSet<_> = executor
            .calls()
            .iter()
            .filter(|c| c.args[0] == "build")
            .map(|c| c.args[2].clone())
            .collect();
        assert_eq!(tags.len(), 2);
        assert_workspaces_removed(&root);
    }

    #[tokio::test]
    async fn real_docker_hello() {
        // Needs a Docker daemon; skipped unless explicitly enabled.
        if std::env::var("SANDBOX_RUNNER_DOCKER_TEST").is_err() {
            return;
        }

        let runner = SandboxRunner::new(crate::executor::TokioExecutor::new(), &Config::default());
        let result = runner.run_python(&request("print('hello')")).await;
        let summary = result.summary();
        assert_eq!(summary.stdout, "hello\n");
        assert_eq!(summary.exit_code, 0);
        assert!(summary.error.is_none());
    }
}
