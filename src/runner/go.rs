//! Go runner: compiles `main.go` during the image build and runs the
//! resulting binary.

use std::time::Duration;

use super::image::ImageJob;
use super::{SandboxRunner, ScriptExecution};
use crate::config::GoConfig;
use crate::executor::ProcessExecutor;
use crate::limits::ResourceLimits;

/// A Go execution request. The program must be `package main`.
#[derive(Debug, Clone, PartialEq)]
pub struct GoRequest {
    pub code: String,
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub image: String,
    pub limits: ResourceLimits,
}

impl GoRequest {
    pub fn new(code: impl Into<String>, defaults: &GoConfig) -> Self {
        Self {
            code: code.into(),
            stdin: None,
            timeout: Duration::from_secs(defaults.timeout_seconds),
            image: defaults.image.clone(),
            limits: defaults.limits,
        }
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

    fn dockerfile(&self) -> String {
        format!(
            "FROM {}\nWORKDIR /app\nCOPY main.go .\nRUN go build -o /app/main main.go\nCMD [\"/app/main\"]\n",
            self.image
        )
    }
}

impl<E: ProcessExecutor> SandboxRunner<E> {
    /// Compile and run a Go program in a network-isolated container.
    ///
    /// Compile errors surface as a failed image build.
    pub async fn run_go(&self, request: &GoRequest) -> ScriptExecution {
        self.run_image_job(ImageJob {
            language: "Go",
            tag_prefix: "go-exec",
            workspace_prefix: "gorunner_",
            code: &request.code,
            base_image: &request.image,
            files: vec![("main.go", request.code.clone())],
            dockerfile: request.dockerfile(),
            stdin: request.stdin.as_deref(),
            timeout: request.timeout,
            limits: &request.limits,
        })
        .await
    }
}
