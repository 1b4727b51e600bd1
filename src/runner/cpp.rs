//! C++ runner: compiles in the toolchain's base image with the workspace
//! bind-mounted, then runs the binary from a read-only mount.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::{normalize_timeout_exit, validate_common, validate_image, SandboxRunner};
use crate::config::CppConfig;
use crate::executor::{PhaseResult, ProcessExecutor, NO_EXIT_CODE, REJECTED_EXIT_CODE};
use crate::limits::ResourceLimits;
use crate::sandbox::{ContainerRun, Mount};
use crate::workspace::Workspace;

const MOUNT_POINT: &str = "/sandbox";

/// Supported C++ toolchains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compiler {
    /// GNU `g++`, the primary compiler.
    Gcc,
    /// LLVM `clang++`, the alternate compiler.
    Clang,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported compiler: '{0}'. Supported compilers are 'g++' (primary) and 'clang++' (alternate).")]
pub struct CompilerError(pub String);

impl FromStr for Compiler {
    type Err = CompilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "primary" | "g++" | "gcc" => Ok(Self::Gcc),
            "alternate" | "clang++" | "clang" => Ok(Self::Clang),
            other => Err(CompilerError(other.to_string())),
        }
    }
}

impl Compiler {
    pub const fn executable(self) -> &'static str {
        match self {
            Self::Gcc => "g++",
            Self::Clang => "clang++",
        }
    }
}

impl fmt::Display for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.executable())
    }
}

/// A C++ execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct CppRequest {
    pub code: String,
    pub stdin: Option<String>,
    pub compile_timeout: Duration,
    pub exec_timeout: Duration,
    /// Compiler name as given by the caller; see [`Compiler`].
    pub compiler: String,
    pub limits: ResourceLimits,
    pub gcc_image: String,
    pub clang_image: String,
}

impl CppRequest {
    pub fn new(code: impl Into<String>, defaults: &CppConfig) -> Self {
        Self {
            code: code.into(),
            stdin: None,
            compile_timeout: Duration::from_secs(defaults.compile_timeout_seconds),
            exec_timeout: Duration::from_secs(defaults.exec_timeout_seconds),
            compiler: defaults.compiler.clone(),
            limits: defaults.limits,
            gcc_image: defaults.gcc_image.clone(),
            clang_image: defaults.clang_image.clone(),
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    #[must_use]
    pub const fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    fn image(&self, compiler: Compiler) -> &str {
        match compiler {
            Compiler::Gcc => &self.gcc_image,
            Compiler::Clang => &self.clang_image,
        }
    }

    /// Spelling reported back as `compiler_used`.
    fn compiler_label(&self) -> String {
        match self.compiler.trim() {
            "" => "primary".to_string(),
            name => name.to_string(),
        }
    }

    fn validate(&self) -> Result<Compiler, String> {
        let compiler: Compiler = self.compiler.parse().map_err(|e: CompilerError| e.to_string())?;
        validate_common(&self.code, self.compile_timeout, &self.limits)?;
        if self.exec_timeout.is_zero() {
            return Err("Timeout must be greater than zero.".into());
        }
        validate_image(self.image(compiler))?;
        Ok(compiler)
    }
}

/// Result of a C++ execution. The `execution_*` fields are `None` when
/// compilation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CppExecution {
    pub compilation_stdout: String,
    pub compilation_stderr: String,
    pub compilation_exit_code: i32,
    pub timed_out_compilation: bool,
    pub execution_stdout: Option<String>,
    pub execution_stderr: Option<String>,
    pub execution_exit_code: Option<i32>,
    pub timed_out_execution: bool,
    pub compiler_used: String,
    pub error: Option<String>,
}

impl CppExecution {
    fn from_compile(compile: PhaseResult, compiler_used: String) -> Self {
        Self {
            compilation_stdout: compile.stdout,
            compilation_stderr: compile.stderr,
            compilation_exit_code: compile.exit_code,
            timed_out_compilation: compile.timed_out,
            execution_stdout: None,
            execution_stderr: None,
            execution_exit_code: None,
            timed_out_execution: false,
            compiler_used,
            error: None,
        }
    }

    fn rejected(reason: String) -> Self {
        Self::from_compile(PhaseResult::rejected(reason), "none".into())
    }

    fn with_run(mut self, run: PhaseResult) -> Self {
        self.execution_stdout = Some(run.stdout);
        self.execution_stderr = Some(run.stderr);
        self.execution_exit_code = Some(run.exit_code);
        self.timed_out_execution = run.timed_out;
        self
    }

    /// Rejected during staging; nothing was run.
    pub const fn is_rejected(&self) -> bool {
        self.compilation_exit_code == REJECTED_EXIT_CODE
    }

    pub const fn compiled(&self) -> bool {
        self.compilation_exit_code == 0 && !self.timed_out_compilation
    }

    /// Compiled, ran and exited 0.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
            && self.compiled()
            && !self.timed_out_execution
            && self.execution_exit_code == Some(0)
    }
}

impl<E: ProcessExecutor> SandboxRunner<E> {
    /// Compile and run C++17 code with the requested toolchain.
    #[instrument(skip(self, request), fields(compiler = %request.compiler))]
    pub async fn run_cpp(&self, request: &CppRequest) -> CppExecution {
        let compiler = match request.validate() {
            Ok(compiler) => compiler,
            Err(reason) => {
                warn!(%reason, "Rejected request");
                return CppExecution::rejected(reason);
            }
        };
        let compiler_used = request.compiler_label();
        let image = request.image(compiler);

        let workspace = match self.workspace("cpprunner_") {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %e, "Failed to create workspace");
                return infrastructure(format!("Failed to prepare workspace: {e}"), compiler_used);
            }
        };
        if let Err(e) = workspace.write("main.cpp", &request.code).await {
            error!(error = %e, "Failed to stage source");
            return infrastructure(format!("Failed to stage main.cpp: {e}"), compiler_used);
        }
        let owner = workspace.owner();

        let build_name = format!("cpp-build-{}", workspace.id());
        let compile_spec = self.docker.run_container(
            &ContainerRun {
                limits: Some(&request.limits),
                user: owner.as_deref(),
                workdir: Some(MOUNT_POINT),
                mount: Some(mount(&workspace, false)),
                command: [compiler.executable(), "-std=c++17", "-O2", "main.cpp", "-o", "main"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                ..ContainerRun::new(&build_name, image)
            },
            request.compile_timeout,
        );

        info!(%compiler, %image, "Compiling");
        let compile = self.execute_container(&compile_spec, &build_name).await;

        if let Some(launch) = compile.launch_error() {
            error!(error = %launch, "Container backend unavailable");
            let error = format!("Sandbox backend unavailable: {launch}");
            let mut result = CppExecution::from_compile(compile, compiler_used);
            result.error = Some(error);
            return result;
        }
        let result = CppExecution::from_compile(compile, compiler_used);
        if !result.compiled() {
            info!(
                exit_code = result.compilation_exit_code,
                timed_out = result.timed_out_compilation,
                "Compilation failed"
            );
            return result;
        }

        let run_name = format!("cpp-run-{}", workspace.id());
        let run_spec = self
            .docker
            .run_container(
                &ContainerRun {
                    limits: Some(&request.limits),
                    user: owner.as_deref(),
                    interactive: true,
                    workdir: Some(MOUNT_POINT),
                    mount: Some(mount(&workspace, true)),
                    command: vec!["./main".to_string()],
                    ..ContainerRun::new(&run_name, image)
                },
                request.exec_timeout,
            )
            .stdin(request.stdin.as_deref().unwrap_or_default());

        info!("Running binary");
        let mut run = self.execute_container(&run_spec, &run_name).await;
        normalize_timeout_exit(&mut run);

        let error = run
            .launch_error()
            .map(|launch| format!("Sandbox backend unavailable: {launch}"));
        info!(exit_code = run.exit_code, timed_out = run.timed_out, "Run finished");

        let mut result = result.with_run(run);
        result.error = error;
        result
    }
}

fn mount(workspace: &Workspace, read_only: bool) -> Mount<'_> {
    Mount {
        host: workspace.path(),
        target: MOUNT_POINT,
        read_only,
    }
}

fn infrastructure(message: String, compiler_used: String) -> CppExecution {
    let mut result = CppExecution::from_compile(
        PhaseResult::completed(String::new(), message.clone(), NO_EXIT_CODE),
        compiler_used,
    );
    result.error = Some(message);
    result
}
