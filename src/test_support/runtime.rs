//! Container runtime discovery for DB-backed tests.
//!
//! testcontainers speaks the Docker API; when only a Podman socket is
//! around, `DOCKER_HOST` is pointed at it.

use anyhow::{bail, Result};
use std::{
    env,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::OnceLock,
};

/// Ensure a container runtime socket is reachable for testcontainers.
///
/// # Errors
/// Returns an error if no Docker/Podman socket can be found or reached.
pub fn ensure_container_runtime() -> Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    match INIT.get_or_init(init_container_runtime) {
        Ok(()) => Ok(()),
        Err(message) => bail!("{message}"),
    }
}

fn init_container_runtime() -> Result<(), String> {
    if let Ok(docker_host) = env::var("DOCKER_HOST") {
        let socket = docker_host
            .strip_prefix("unix://")
            .or_else(|| docker_host.starts_with('/').then_some(docker_host.as_str()));
        return match socket {
            Some(path) if !socket_connectable(Path::new(path)) => Err(format!(
                "`DOCKER_HOST` points to `{docker_host}`, but the socket is not accepting connections"
            )),
            // TCP endpoints are left for testcontainers to validate.
            _ => Ok(()),
        };
    }

    if socket_connectable(Path::new("/var/run/docker.sock")) {
        return Ok(());
    }

    if let Some(path) = find_podman_socket() {
        if socket_connectable(&path) {
            env::set_var("DOCKER_HOST", format!("unix://{}", path.display()));
            return Ok(());
        }
    }

    Err(
        "no container runtime socket found; start the Docker daemon, `podman.socket`, or set `DOCKER_HOST`"
            .to_string(),
    )
}

fn find_podman_socket() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        candidates.push(PathBuf::from(runtime_dir).join("podman/podman.sock"));
    }
    candidates.push(PathBuf::from("/var/run/podman/podman.sock"));
    candidates.push(PathBuf::from("/run/podman/podman.sock"));

    candidates.into_iter().find(|path| path.exists())
}

fn socket_connectable(path: &Path) -> bool {
    path.exists() && UnixStream::connect(path).is_ok()
}
