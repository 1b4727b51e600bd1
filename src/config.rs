//! Runner configuration.
//!
//! Defaults for every runner live here instead of in module-level constants.
//! The binary reads JSON from the `SANDBOX_RUNNER_CONFIG` environment
//! variable or from a `--config` file; every field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::limits::ResourceLimits;
use crate::runner::validate_image;

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV: &str = "SANDBOX_RUNNER_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Container backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Where workspaces are created. Defaults to the system temp dir.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    #[serde(default)]
    pub python: PythonConfig,

    #[serde(default)]
    pub go: GoConfig,

    #[serde(default)]
    pub cpp: CppConfig,
}

/// Docker CLI settings shared by all runners.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Docker executable name or path.
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Ceiling for `docker build` (image-build runners), independent of the
    /// per-request run timeout.
    #[serde(default = "default_build_timeout")]
    pub build_timeout_seconds: u64,

    /// Ceiling for `docker rmi` / `docker rm` during cleanup.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            build_timeout_seconds: default_build_timeout(),
            cleanup_timeout_seconds: default_cleanup_timeout(),
        }
    }
}

impl BackendConfig {
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_seconds)
    }

    pub const fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_seconds)
    }
}

/// Python runner defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct PythonConfig {
    #[serde(default = "default_python_image")]
    pub image: String,

    #[serde(default = "default_run_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            image: default_python_image(),
            timeout_seconds: default_run_timeout(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Go runner defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct GoConfig {
    #[serde(default = "default_go_image")]
    pub image: String,

    #[serde(default = "default_run_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Default for GoConfig {
    fn default() -> Self {
        Self {
            image: default_go_image(),
            timeout_seconds: default_run_timeout(),
            limits: ResourceLimits::default(),
        }
    }
}

/// C++ runner defaults.
///
/// Each toolchain has its own base image, which must already contain the
/// compiler: builds run with networking disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct CppConfig {
    /// Image providing `g++` (the primary compiler).
    #[serde(default = "default_gcc_image")]
    pub gcc_image: String,

    /// Image providing `clang++` (the alternate compiler).
    #[serde(default = "default_clang_image")]
    pub clang_image: String,

    /// Compiler used when a request does not name one.
    #[serde(default = "default_compiler")]
    pub compiler: String,

    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_seconds: u64,

    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_seconds: u64,

    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Default for CppConfig {
    fn default() -> Self {
        Self {
            gcc_image: default_gcc_image(),
            clang_image: default_clang_image(),
            compiler: default_compiler(),
            compile_timeout_seconds: default_compile_timeout(),
            exec_timeout_seconds: default_exec_timeout(),
            limits: ResourceLimits::default(),
        }
    }
}

impl Config {
    /// Load configuration from `SANDBOX_RUNNER_CONFIG`, falling back to
    /// defaults when the variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}")),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {CONFIG_ENV}")),
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Create a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Reject values no execution could succeed with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.backend.docker_binary.trim().is_empty(),
            "backend.docker_binary must not be empty"
        );
        anyhow::ensure!(
            self.backend.build_timeout_seconds > 0,
            "backend.build_timeout_seconds must be greater than zero"
        );
        anyhow::ensure!(
            self.backend.cleanup_timeout_seconds > 0,
            "backend.cleanup_timeout_seconds must be greater than zero"
        );

        for (section, timeout) in [
            ("python", self.python.timeout_seconds),
            ("go", self.go.timeout_seconds),
        ] {
            anyhow::ensure!(timeout > 0, "{section}.timeout_seconds must be greater than zero");
        }

        for (field, image) in [
            ("python.image", &self.python.image),
            ("go.image", &self.go.image),
            ("cpp.gcc_image", &self.cpp.gcc_image),
            ("cpp.clang_image", &self.cpp.clang_image),
        ] {
            validate_image(image).map_err(|reason| anyhow::anyhow!("{field}: {reason}"))?;
        }
        anyhow::ensure!(
            self.cpp.compile_timeout_seconds > 0 && self.cpp.exec_timeout_seconds > 0,
            "cpp timeouts must be greater than zero"
        );
        self.cpp
            .compiler
            .parse::<crate::runner::Compiler>()
            .context("cpp.compiler")?;

        self.python.limits.validate().context("python.limits")?;
        self.go.limits.validate().context("go.limits")?;
        self.cpp.limits.validate().context("cpp.limits")?;
        Ok(())
    }
}

fn default_docker_binary() -> String {
    "docker".into()
}

fn default_python_image() -> String {
    "python:3.10-slim".into()
}

fn default_go_image() -> String {
    "golang:1.21-alpine".into()
}

fn default_gcc_image() -> String {
    "gcc:13".into()
}

fn default_clang_image() -> String {
    "silkeh/clang:17".into()
}

fn default_compiler() -> String {
    "primary".into()
}

const fn default_build_timeout() -> u64 {
    300
}

const fn default_cleanup_timeout() -> u64 {
    30
}

const fn default_run_timeout() -> u64 {
    60
}

const fn default_compile_timeout() -> u64 {
    10
}

const fn default_exec_timeout() -> u64 {
    5
}
