//! Linux network-namespace switching primitives.
//!
//! `cni-kindnet` only ever joins a namespace the container runtime already
//! created; it never creates one itself. The core pattern is an RAII
//! restore: save the current namespace, `setns` into the target, run a
//! closure, and restore on every exit path (including a panic) via `Drop`.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sched;

use crate::error::Error;

/// RAII guard that restores the network namespace active when it was
/// created. If restoring fails, the implementation panics: there is no
/// meaningful way to keep running in the wrong namespace.
struct NamespaceGuard(std::fs::File);

impl NamespaceGuard {
    /// Capture the calling thread's current network namespace so it can
    /// be restored later.
    fn from_current() -> Result<NamespaceGuard, Error> {
        let saved = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_CLOEXEC)
            .open("/proc/self/ns/net")
            .map_err(|error| Error::Io {
                context: "could not open current network namespace".into(),
                error,
            })?;
        Ok(NamespaceGuard(saved))
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        sched::setns(self.0.as_raw_fd(), sched::CloneFlags::CLONE_NEWNET)
            .expect("could not restore network namespace!");
    }
}

/// Run `f` after joining the network namespace bound at `netns_path`,
/// restoring the caller's original namespace before returning (on success,
/// on error, or on panic). Intended to be invoked from inside a
/// `tokio::task::spawn_blocking` closure, since `setns` affects the whole
/// calling OS thread and must not bleed into other async work scheduled
/// onto it.
pub fn run_in_namespace<F, R>(netns_path: &Path, f: F) -> Result<R, Error>
where
    F: FnOnce() -> R,
{
    let target = open_namespace_file(netns_path)?;
    let _restore = NamespaceGuard::from_current()?;

    sched::setns(target.as_raw_fd(), sched::CloneFlags::CLONE_NEWNET).map_err(|error| {
        Error::System {
            context: format!("could not join namespace {}", netns_path.display()),
            error,
        }
    })?;

    Ok(f())
}

/// Does the namespace bound at `netns_path` still exist? `DEL` treats a
/// missing namespace as success, so callers check this before attempting
/// any namespace-scoped teardown.
pub fn exists(netns_path: &Path) -> bool {
    netns_path.exists()
}

fn open_namespace_file(netns_path: &Path) -> Result<std::fs::File, Error> {
    OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_CLOEXEC)
        .open(netns_path)
        .map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                Error::NamespaceMissing(netns_path.display().to_string())
            } else {
                Error::Io {
                    context: format!("could not open namespace {}", netns_path.display()),
                    error,
                }
            }
        })
}
