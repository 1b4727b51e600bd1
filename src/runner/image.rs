//! Image-build pipeline shared by the Python and Go runners.
//!
//! The workspace becomes a Docker build context: source file, optional
//! manifest and a generated `Dockerfile`. The image is tagged with the
//! workspace id, run once with networking disabled, then removed.

use std::time::Duration;

use tracing::{error, info, instrument, warn};

use super::{
    normalize_timeout_exit, validate_common, validate_image, SandboxRunner, ScriptExecution,
};
use crate::executor::ProcessExecutor;
use crate::limits::ResourceLimits;
use crate::sandbox::ContainerRun;
use crate::workspace::Workspace;

/// One image-build execution, filled in by a language runner.
pub(super) struct ImageJob<'a> {
    /// Display name used in error messages ("Python").
    pub language: &'static str,
    /// Image tag and container name prefix ("python-exec").
    pub tag_prefix: &'static str,
    /// Workspace directory prefix ("pyrunner_").
    pub workspace_prefix: &'static str,
    pub code: &'a str,
    pub base_image: &'a str,
    /// Files written into the build context, source first.
    pub files: Vec<(&'static str, String)>,
    pub dockerfile: String,
    pub stdin: Option<&'a str>,
    pub timeout: Duration,
    pub limits: &'a ResourceLimits,
}

impl ImageJob<'_> {
    fn validate(&self) -> Result<(), String> {
        validate_common(self.code, self.timeout, self.limits)?;
        validate_image(self.base_image)
    }
}

impl<E: ProcessExecutor> SandboxRunner<E> {
    #[instrument(
        skip(self, job),
        fields(language = job.language, image = job.base_image, timeout = ?job.timeout)
    )]
    pub(super) async fn run_image_job(&self, job: ImageJob<'_>) -> ScriptExecution {
        if let Err(reason) = job.validate() {
            warn!(%reason, "Rejected request");
            return ScriptExecution::rejected(reason);
        }

        let workspace = match self.workspace(job.workspace_prefix) {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %e, "Failed to create workspace");
                return ScriptExecution::infrastructure(format!("Failed to prepare workspace: {e}"));
            }
        };
        let tag = format!("{}-{}", job.tag_prefix, workspace.id());

        let dockerfile = match stage(&workspace, &job).await {
            Ok(path) => path,
            Err(message) => {
                error!(error = %message, "Failed to stage build context");
                return ScriptExecution::infrastructure(message);
            }
        };

        info!(%tag, "Building image");
        let build = self
            .executor
            .execute(&self.docker.build_image(&tag, &dockerfile, workspace.path(), self.build_timeout))
            .await;

        if let Some(launch) = build.launch_error() {
            error!(error = %launch, "Container backend unavailable");
            let error = format!("Sandbox backend unavailable: {launch}");
            return ScriptExecution {
                build,
                run: None,
                error: Some(error),
            };
        }
        if build.timed_out {
            warn!(%tag, "Image build timed out");
            // The daemon may still finish and tag the image.
            self.remove_image(&tag).await;
            let error = format!("Docker image build for {} timed out.", job.language);
            return ScriptExecution {
                build,
                run: None,
                error: Some(error),
            };
        }
        if build.exit_code != 0 {
            info!(%tag, exit_code = build.exit_code, "Image build failed");
            let error = format!("Docker image build for {} failed.", job.language);
            return ScriptExecution {
                build,
                run: None,
                error: Some(error),
            };
        }

        let run_spec = self.docker.run_container(
            &ContainerRun {
                limits: Some(job.limits),
                interactive: job.stdin.is_some(),
                ..ContainerRun::new(&tag, &tag)
            },
            job.timeout,
        );
        let run_spec = match job.stdin {
            Some(input) => run_spec.stdin(input),
            None => run_spec,
        };

        info!(%tag, "Running container");
        let mut run = self.execute_container(&run_spec, &tag).await;
        normalize_timeout_exit(&mut run);

        let error = run
            .launch_error()
            .map(|launch| format!("Sandbox backend unavailable: {launch}"));

        info!(
            %tag,
            exit_code = run.exit_code,
            timed_out = run.timed_out,
            "Run finished"
        );

        self.remove_image(&tag).await;

        ScriptExecution {
            build,
            run: Some(run),
            error,
        }
    }
}

/// Write the job's files and Dockerfile; returns the Dockerfile path.
async fn stage(workspace: &Workspace, job: &ImageJob<'_>) -> Result<std::path::PathBuf, String> {
    for (name, contents) in &job.files {
        workspace
            .write(name, contents)
            .await
            .map_err(|e| format!("Failed to stage {name}: {e}"))?;
    }
    workspace
        .write("Dockerfile", &job.dockerfile)
        .await
        .map_err(|e| format!("Failed to stage Dockerfile: {e}"))
}
