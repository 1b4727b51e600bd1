//! Docker CLI command construction.
//!
//! Isolation (network, CPU, memory, teardown) is done by the container
//! engine; this module only knows how to ask for it. Every method returns a
//! [`CommandSpec`] for a [`ProcessExecutor`](crate::executor::ProcessExecutor).

use std::path::Path;
use std::time::Duration;

use crate::executor::CommandSpec;
use crate::limits::ResourceLimits;

/// A host directory bind-mounted into a container.
#[derive(Debug, Clone, Copy)]
pub struct Mount<'a> {
    pub host: &'a Path,
    pub target: &'a str,
    pub read_only: bool,
}

/// Options for a single `docker run`.
#[derive(Debug, Clone)]
pub struct ContainerRun<'a> {
    /// Container name, so a timed out run can be torn down by name.
    pub name: &'a str,
    pub image: &'a str,
    pub limits: Option<&'a ResourceLimits>,
    /// Keep stdin attached (`-i`).
    pub interactive: bool,
    pub mount: Option<Mount<'a>>,
    pub workdir: Option<&'a str>,
    /// `uid:gid` to run as.
    pub user: Option<&'a str>,
    /// Command override; empty uses the image's `CMD`.
    pub command: Vec<String>,
}

impl<'a> ContainerRun<'a> {
    /// Run of `image` with every option off.
    pub const fn new(name: &'a str, image: &'a str) -> Self {
        Self {
            name,
            image,
            limits: None,
            interactive: false,
            mount: None,
            workdir: None,
            user: None,
            command: Vec::new(),
        }
    }
}

/// Builds `docker` invocations.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `docker build -t <tag> -f <dockerfile> <context>`
    pub fn build_image(
        &self,
        tag: &str,
        dockerfile: &Path,
        context: &Path,
        timeout: Duration,
    ) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .args(["build", "-t", tag, "-f"])
            .arg(dockerfile.to_string_lossy())
            .arg(context.to_string_lossy())
            .timeout(timeout)
    }

    /// `docker run --rm --name <name> --network=none [flags] <image> [command]`
    pub fn run_container(&self, run: &ContainerRun<'_>, timeout: Duration) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.binary).args([
            "run",
            "--rm",
            "--name",
            run.name,
            "--network=none",
        ]);

        if let Some(limits) = run.limits {
            spec = spec.args(limits.docker_flags());
        }
        if let Some(user) = run.user {
            spec = spec.args(["--user", user]);
        }
        if run.interactive {
            spec = spec.arg("-i");
        }
        if let Some(mount) = &run.mount {
            let mut volume = format!("{}:{}", mount.host.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            spec = spec.arg("-v").arg(volume);
        }
        if let Some(dir) = run.workdir {
            spec = spec.args(["-w", dir]);
        }

        spec.arg(run.image)
            .args(run.command.iter().cloned())
            .timeout(timeout)
    }

    /// `docker rmi -f <tag>`
    pub fn remove_image(&self, tag: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .args(["rmi", "-f", tag])
            .timeout(timeout)
    }

    /// `docker rm -f <name>`
    pub fn remove_container(&self, name: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .args(["rm", "-f", name])
            .timeout(timeout)
    }
}
