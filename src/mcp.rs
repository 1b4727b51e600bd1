//! MCP server implementation using rmcp.
//!
//! Exposes the Python, C++ and Go runners as MCP tools. Tool results are
//! the JSON-serialized execution record; `is_error` is set whenever the
//! program did not run to a zero exit.

use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::executor::ProcessExecutor;
use crate::limits::{MemoryLimit, ResourceLimits};
use crate::runner::{CppRequest, GoRequest, PythonRequest, SandboxRunner};

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer<E: Clone> {
    config: Arc<Config>,
    runner: Arc<SandboxRunner<E>>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the `run_python` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunPythonParams {
    #[schemars(description = "Python source code to execute")]
    pub code: String,

    #[schemars(description = "pip requirement specifiers, e.g. 'requests==2.31.0'")]
    #[serde(default)]
    pub requirements: Vec<String>,

    #[schemars(description = "Run timeout in seconds")]
    pub timeout: Option<u64>,

    #[schemars(description = "Base Docker image reference, e.g. 'python:3.10-slim'")]
    pub python_image: Option<String>,

    #[schemars(description = "Number of CPUs, e.g. 0.5")]
    pub cpu_limit: Option<f64>,

    #[schemars(description = "Memory limit as docker --memory accepts it, e.g. '256m', '1.5g', '512MiB'")]
    pub memory_limit: Option<String>,

    #[schemars(description = "Text passed to the program's standard input")]
    pub stdin: Option<String>,
}

/// Parameters for the `run_cpp` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCppParams {
    #[schemars(description = "C++17 source code containing main()")]
    pub code: String,

    #[schemars(description = "Text passed to the program's standard input")]
    pub stdin: Option<String>,

    #[schemars(description = "Compilation timeout in seconds")]
    pub compile_timeout: Option<u64>,

    #[schemars(description = "Execution timeout in seconds")]
    pub exec_timeout: Option<u64>,

    #[schemars(description = "'primary' (g++) or 'alternate' (clang++)")]
    pub compiler: Option<String>,
}

/// Parameters for the `run_go` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunGoParams {
    #[schemars(description = "Go source code for package main")]
    pub code: String,

    #[schemars(description = "Run timeout in seconds")]
    pub timeout: Option<u64>,

    #[schemars(description = "Base Docker image reference, e.g. 'golang:1.21-alpine'")]
    pub go_image: Option<String>,

    #[schemars(description = "Number of CPUs, e.g. 0.5")]
    pub cpu_limit: Option<f64>,

    #[schemars(description = "Memory limit as docker --memory accepts it, e.g. '256m', '1.5g', '512MiB'")]
    pub memory_limit: Option<String>,

    #[schemars(description = "Text passed to the program's standard input")]
    pub stdin: Option<String>,
}

#[tool_router]
impl<E: ProcessExecutor + Clone + 'static> SandboxServer<E> {
    /// Create a new sandbox server.
    pub fn new(config: Config, executor: E) -> Self {
        let runner = SandboxRunner::new(executor, &config);
        Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
            tool_router: Self::tool_router(),
        }
    }

    /// Execute Python code in an isolated container.
    #[tool(description = "Execute Python code in an isolated Docker container with no network access")]
    async fn run_python(
        &self,
        Parameters(params): Parameters<RunPythonParams>,
    ) -> Result<CallToolResult, McpError> {
        require_code(&params.code)?;
        let defaults = &self.config.python;

        let mut request = PythonRequest::new(params.code, defaults)
            .with_requirements(params.requirements)
            .with_timeout(seconds("timeout", params.timeout, defaults.timeout_seconds)?)
            .with_limits(limits(
                defaults.limits,
                params.cpu_limit,
                params.memory_limit.as_deref(),
            )?);
        if let Some(image) = params.python_image {
            request = request.with_image(image);
        }
        if let Some(stdin) = params.stdin {
            request = request.with_stdin(stdin);
        }

        info!(code_len = request.code.len(), requirements = request.requirements.len(), "run_python");
        let result = self.runner.run_python(&request).await;
        respond(&result, result.succeeded())
    }

    /// Compile and execute C++ code.
    #[tool(description = "Compile C++17 code with g++ (primary) or clang++ (alternate) and run it in an isolated Docker container")]
    async fn run_cpp(
        &self,
        Parameters(params): Parameters<RunCppParams>,
    ) -> Result<CallToolResult, McpError> {
        require_code(&params.code)?;
        let defaults = &self.config.cpp;

        let mut request = CppRequest::new(params.code, defaults)
            .with_compile_timeout(seconds(
                "compile_timeout",
                params.compile_timeout,
                defaults.compile_timeout_seconds,
            )?)
            .with_exec_timeout(seconds(
                "exec_timeout",
                params.exec_timeout,
                defaults.exec_timeout_seconds,
            )?);
        if let Some(compiler) = params.compiler {
            request = request.with_compiler(compiler);
        }
        if let Some(stdin) = params.stdin {
            request = request.with_stdin(stdin);
        }

        info!(code_len = request.code.len(), compiler = %request.compiler, "run_cpp");
        let result = self.runner.run_cpp(&request).await;
        respond(&result, result.succeeded())
    }

    /// Compile and execute Go code.
    #[tool(description = "Build and run a Go program (package main) in an isolated Docker container with no network access")]
    async fn run_go(
        &self,
        Parameters(params): Parameters<RunGoParams>,
    ) -> Result<CallToolResult, McpError> {
        require_code(&params.code)?;
        let defaults = &self.config.go;

        let mut request = GoRequest::new(params.code, defaults)
            .with_timeout(seconds("timeout", params.timeout, defaults.timeout_seconds)?)
            .with_limits(limits(
                defaults.limits,
                params.cpu_limit,
                params.memory_limit.as_deref(),
            )?);
        if let Some(image) = params.go_image {
            request = request.with_image(image);
        }
        if let Some(stdin) = params.stdin {
            request = request.with_stdin(stdin);
        }

        info!(code_len = request.code.len(), "run_go");
        let result = self.runner.run_go(&request).await;
        respond(&result, result.succeeded())
    }
}

fn require_code(code: &str) -> Result<(), McpError> {
    if code.trim().is_empty() {
        return Err(McpError::invalid_params("code must not be empty", None));
    }
    Ok(())
}

fn seconds(name: &str, value: Option<u64>, default: u64) -> Result<Duration, McpError> {
    match value.unwrap_or(default) {
        0 => Err(McpError::invalid_params(
            format!("{name} must be greater than zero"),
            None,
        )),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn limits(
    defaults: ResourceLimits,
    cpus: Option<f64>,
    memory: Option<&str>,
) -> Result<ResourceLimits, McpError> {
    let mut limits = defaults;
    if let Some(cpus) = cpus {
        limits.cpus = cpus;
    }
    if let Some(memory) = memory {
        limits.memory = memory
            .parse::<MemoryLimit>()
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
    }
    limits
        .validate()
        .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
    Ok(limits)
}

fn respond<T: Serialize>(result: &T, succeeded: bool) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| McpError::internal_error(format!("Failed to serialize result: {e}"), None))?;
    if succeeded {
        Ok(CallToolResult::success(vec![Content::text(json)]))
    } else {
        warn!("Execution did not succeed");
        Ok(CallToolResult::error(vec![Content::text(json)]))
    }
}

#[tool_handler]
impl<E: ProcessExecutor + Clone + 'static> ServerHandler for SandboxServer<E> {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-runner".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute untrusted code in network-isolated Docker containers.\n\
                 \n\
                 Tools:\n\
                 - run_python: code, optional requirements, timeout (default {}s), stdin\n\
                 - run_cpp: code, optional compiler ('primary' or 'alternate'), stdin\n\
                 - run_go: code (package main), optional timeout (default {}s), stdin\n\
                 \n\
                 Results are JSON with stdout, stderr and exit codes.",
                self.config.python.timeout_seconds, self.config.go.timeout_seconds,
            )),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio<E: ProcessExecutor + Clone + 'static>(
    config: Config,
    executor: E,
) -> anyhow::Result<()> {
    let server = SandboxServer::new(config, executor);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PhaseResult;
    use crate::runner::test_support::ScriptedExecutor;

    fn test_server(executor: ScriptedExecutor) -> (tempfile::TempDir, SandboxServer<ScriptedExecutor>) {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            workspace_root: Some(root.path().to_path_buf()),
            ..Config::default()
        };
        (root, SandboxServer::new(config, executor))
    }

    fn text(result: &CallToolResult) -> serde_json::Value {
        let raw = result.content[0].as_text().unwrap().text.clone();
        serde_json::from_str(&raw).unwrap()
    }

    fn python(code: &str) -> RunPythonParams {
        RunPythonParams {
            code: code.into(),
            requirements: Vec::new(),
            timeout: None,
            python_image: None,
            cpu_limit: None,
            memory_limit: None,
            stdin: None,
        }
    }

    #[tokio::test]
    async fn test_run_python_success() {
        let executor = ScriptedExecutor::new([
            PhaseResult::completed("", "", 0),
            PhaseResult::completed("hello\n", "", 0),
        ]);
        let (_root, server) = test_server(executor);

        let result = server.run_python(Parameters(python("print('hello')"))).await.unwrap();

        assert!(!result.is_error.unwrap_or(false));
        let json = text(&result);
        assert_eq!(json["stdout"], "hello\n");
        assert_eq!(json["exit_code"], 0);
        assert!(json["error"].is_null());
    }

    #[tokio::test]
    async fn test_run_python_failure_is_tool_error() {
        let executor = ScriptedExecutor::new([
            PhaseResult::completed("", "", 0),
            PhaseResult::completed("", "ValueError: x\n", 1),
        ]);
        let (_root, server) = test_server(executor);

        let result = server
            .run_python(Parameters(python("raise ValueError('x')")))
            .await
            .unwrap();

        assert!(result.is_error.unwrap_or(false));
        assert_eq!(text(&result)["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_run_python_overrides_reach_docker() {
        let executor = ScriptedExecutor::default();
        let (_root, server) = test_server(executor.clone());

        let params = RunPythonParams {
            timeout: Some(5),
            python_image: Some("python:3.12-slim".into()),
            cpu_limit: Some(0.5),
            memory_limit: Some("512m".into()),
            requirements: vec!["requests".into()],
            ..python("print(1)")
        };
        server.run_python(Parameters(params)).await.unwrap();

        let calls = executor.calls();
        assert!(executor.staged()[0]["Dockerfile"].starts_with("FROM python:3.12-slim\n"));
        assert!(calls[1].args.iter().any(|a| a == "--cpus=0.5"));
        assert!(calls[1].args.iter().any(|a| a == "--memory=512m"));
        assert_eq!(calls[1].timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_docker_memory_forms_accepted() {
        let executor = ScriptedExecutor::default();
        let (_root, server) = test_server(executor.clone());

        for (memory, flag) in [("1.5g", "--memory=1536m"), ("512MiB", "--memory=512m"), ("1t", "--memory=1t")] {
            let params = RunGoParams {
                code: "package main\nfunc main() {}".into(),
                timeout: None,
                go_image: None,
                cpu_limit: None,
                memory_limit: Some(memory.into()),
                stdin: None,
            };
            server.run_go(Parameters(params)).await.unwrap();
            let run = executor
                .calls()
                .into_iter()
                .filter(|c| c.args[0] == "run")
                .last()
                .unwrap();
            assert!(run.args.iter().any(|a| a == flag), "{memory}");
        }
    }

    #[tokio::test]
    async fn test_invalid_params_rejected() {
        let executor = ScriptedExecutor::default();
        let (_root, server) = test_server(executor.clone());

        assert!(server.run_python(Parameters(python("  "))).await.is_err());

        let params = RunPythonParams {
            memory_limit: Some("lots".into()),
            ..python("print(1)")
        };
        assert!(server.run_python(Parameters(params)).await.is_err());

        let params = RunGoParams {
            code: "package main".into(),
            timeout: Some(0),
            go_image: None,
            cpu_limit: None,
            memory_limit: None,
            stdin: None,
        };
        assert!(server.run_go(Parameters(params)).await.is_err());

        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_cpp_unsupported_compiler() {
        let executor = ScriptedExecutor::default();
        let (_root, server) = test_server(executor.clone());

        let params = RunCppParams {
            code: "int main() {}".into(),
            stdin: None,
            compile_timeout: None,
            exec_timeout: None,
            compiler: Some("bogus".into()),
        };
        let result = server.run_cpp(Parameters(params)).await.unwrap();

        assert!(result.is_error.unwrap_or(false));
        let json = text(&result);
        assert_eq!(json["compilation_exit_code"], -100);
        assert_eq!(json["compiler_used"], "none");
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_cpp_success() {
        let executor = ScriptedExecutor::new([
            PhaseResult::completed("", "", 0),
            PhaseResult::completed("42\n", "", 0),
        ]);
        let (_root, server) = test_server(executor);

        let params = RunCppParams {
            code: "int main() {}".into(),
            stdin: Some("42\n".into()),
            compile_timeout: Some(20),
            exec_timeout: None,
            compiler: Some("alternate".into()),
        };
        let result = server.run_cpp(Parameters(params)).await.unwrap();

        assert!(!result.is_error.unwrap_or(false));
        let json = text(&result);
        assert_eq!(json["execution_stdout"], "42\n");
        assert_eq!(json["compiler_used"], "alternate");
    }

    #[test]
    fn test_get_info_names_tools() {
        let (_root, server) = test_server(ScriptedExecutor::default());
        let info = server.get_info();
        assert_eq!(info.server_info.name, "sandbox-runner");
        let instructions = info.instructions.unwrap();
        for tool in ["run_python", "run_cpp", "run_go"] {
            assert!(instructions.contains(tool));
        }
    }
}
