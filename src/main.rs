//! sandbox-runner
//!
//! Runs untrusted Python, C++ and Go code in network-isolated Docker
//! containers, either as an MCP server over stdio or once from the command
//! line. Configuration comes from `--config` or `SANDBOX_RUNNER_CONFIG`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_runner::config::Config;
use sandbox_runner::executor::TokioExecutor;
use sandbox_runner::mcp;
use sandbox_runner::runner::{CppRequest, GoRequest, PythonRequest, SandboxRunner};

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner")]
#[command(about = "Sandboxed multi-language code execution over Docker")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON config file (overrides SANDBOX_RUNNER_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a single source file and print the JSON result
    Run {
        #[arg(long, value_enum)]
        language: Language,

        /// Source file to execute
        file: PathBuf,

        /// File whose contents are passed to the program's stdin
        #[arg(long)]
        stdin_file: Option<PathBuf>,

        /// C++ compiler: primary (g++) or alternate (clang++)
        #[arg(long)]
        compiler: Option<String>,

        /// pip requirement for Python (repeatable)
        #[arg(long = "requirement")]
        requirements: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Language {
    Python,
    Cpp,
    Go,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        docker = %config.backend.docker_binary,
        workspace_root = ?config.workspace_root,
        "Loaded configuration"
    );

    let executor = TokioExecutor::new();

    match args.command {
        Some(Command::Run {
            language,
            file,
            stdin_file,
            compiler,
            requirements,
        }) => {
            let code = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let stdin = match stdin_file {
                Some(path) => Some(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                None => None,
            };
            run_once(&config, executor, language, code, stdin, compiler, requirements).await
        }
        None if args.stdio => mcp::serve_stdio(config, executor).await,
        None => anyhow::bail!("Only --stdio mode is currently supported (or use `run`)"),
    }
}

async fn run_once(
    config: &Config,
    executor: TokioExecutor,
    language: Language,
    code: String,
    stdin: Option<String>,
    compiler: Option<String>,
    requirements: Vec<String>,
) -> Result<()> {
    let runner = SandboxRunner::new(executor, config);

    let (json, succeeded) = match language {
        Language::Python => {
            let mut request = PythonRequest::new(code, &config.python).with_requirements(requirements);
            if let Some(stdin) = stdin {
                request = request.with_stdin(stdin);
            }
            let result = runner.run_python(&request).await;
            (serde_json::to_string_pretty(&result)?, result.succeeded())
        }
        Language::Go => {
            let mut request = GoRequest::new(code, &config.go);
            if let Some(stdin) = stdin {
                request = request.with_stdin(stdin);
            }
            let result = runner.run_go(&request).await;
            (serde_json::to_string_pretty(&result)?, result.succeeded())
        }
        Language::Cpp => {
            let mut request = CppRequest::new(code, &config.cpp);
            if let Some(compiler) = compiler {
                request = request.with_compiler(compiler);
            }
            if let Some(stdin) = stdin {
                request = request.with_stdin(stdin);
            }
            let result = runner.run_cpp(&request).await;
            (serde_json::to_string_pretty(&result)?, result.succeeded())
        }
    };

    println!("{json}");
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
