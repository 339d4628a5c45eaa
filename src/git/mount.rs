//! Mount topology synthesis (spec §4.2 "Container filesystem view per
//! repository"): for each mounted repository, the working tree is bound
//! read-write from the host worktree directory, and `.git` is shadowed with
//! a tmpfs mount so the container never sees real git metadata.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// A bind mount of a host directory into the container.
    Bind { read_only: bool },
    /// An empty tmpfs mount shadowing whatever the host side has at this path.
    TmpfsShadow,
}

#[derive(Debug, Clone)]
pub struct ContainerMount {
    pub host_path: Option<PathBuf>,
    pub container_path: PathBuf,
    pub kind: MountKind,
}

/// The two mounts spec §4.2 requires per repository:
/// - `<workdir>/<repo>/...` bound read-write from the host worktree.
/// - `<workdir>/<repo>/.git` shadowed with an empty tmpfs mount so the
///   container can never reach real git metadata directly — only through
///   the wrapper binaries that route to the gateway.
pub fn mounts_for_repo(repo_full_name: &str, host_working_dir: &Path, container_workdir_root: &Path) -> Vec<ContainerMount> {
    let repo_slug = repo_full_name.rsplit('/').next().unwrap_or(repo_full_name);
    let container_repo_path = container_workdir_root.join(repo_slug);

    vec![
        ContainerMount {
            host_path: Some(host_working_dir.to_path_buf()),
            container_path: container_repo_path.clone(),
            kind: MountKind::Bind { read_only: false },
        },
        ContainerMount {
            host_path: None,
            container_path: container_repo_path.join(".git"),
            kind: MountKind::TmpfsShadow,
        },
    ]
}

/// Wrapper-binary mounts: the `git` and code-hosting CLI stand-ins, bound
/// read-only over wherever the real binaries would otherwise live (spec
/// §4.2 "How local git still works", "How code-hosting CLI is forced
/// through the gateway").
pub fn wrapper_mounts(git_wrapper_path: &Path, code_host_wrapper_path: &Path) -> Vec<ContainerMount> {
    vec![
        ContainerMount {
            host_path: Some(git_wrapper_path.to_path_buf()),
            container_path: PathBuf::from("/usr/bin/git"),
            kind: MountKind::Bind { read_only: true },
        },
        ContainerMount {
            host_path: Some(code_host_wrapper_path.to_path_buf()),
            container_path: PathBuf::from("/usr/bin/gh"),
            kind: MountKind::Bind { read_only: true },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounts_shadow_dot_git_under_the_bound_working_tree() {
        let mounts = mounts_for_repo(
            "org/repo-x",
            Path::new("/host/worktrees/org__repo-x/containers/abc123"),
            Path::new("/workdir"),
        );
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].container_path, PathBuf::from("/workdir/repo-x"));
        assert!(matches!(mounts[0].kind, MountKind::Bind { read_only: false }));
        assert_eq!(mounts[1].container_path, PathBuf::from("/workdir/repo-x/.git"));
        assert_eq!(mounts[1].kind, MountKind::TmpfsShadow);
        assert!(mounts[1].host_path.is_none());
    }
}
