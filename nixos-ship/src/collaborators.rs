//! The external collaborators of spec.md §6: narrow contracts this crate
//! consumes but does not own the implementation details of. Build/evaluation
//! collaborators are documented only, per §6's "their precise command lines
//! are out of scope; the core consumes only the resulting StorePaths" — this
//! crate never shells out to evaluate or build a configuration itself.

use std::io;
use std::path::Path;
use std::process::Command;

use nixrs::store_path::StorePath;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{0} failed: {1}")]
    Io(&'static str, #[source] io::Error),
    #[error("{0} exited with status {1}")]
    NonZeroExit(&'static str, std::process::ExitStatus),
    #[error("{0} produced non-UTF-8 output")]
    NotUtf8(&'static str),
}

/// "Evaluate attribute of a configuration manifest at a revision, returning
/// JSON" / "build an attribute and emit a GC-rooted symlink to its top-level
/// StorePath" (§6). Out of scope for this crate's core: a sender is expected
/// to have already built every configuration and obtained its top-level
/// StorePath before invoking the Planner, the same way
/// `nix_utils.create_root_if_path_exists` stays outside the Python original's
/// shipping core.
pub trait BuildCollaborator {
    /// Builds `attribute` of the configuration manifest at `revision`,
    /// returning the GC-rooted top-level StorePath.
    fn build(&self, revision: &str, attribute: &str) -> Result<StorePath, CollaboratorError>;
}

/// "Resolve revision-ish to a commit identifier", "create a worktree at a
/// commit", "prune stale worktrees" (§6).
pub trait RevisionControlCollaborator {
    fn resolve_revision(&self, revision_ish: &str) -> Result<String, CollaboratorError>;
    fn create_worktree(&self, at: &Path, commit: &str) -> Result<(), CollaboratorError>;
    fn prune_worktrees(&self) -> Result<(), CollaboratorError>;
}

/// Shells out to `git`, matching original_source's `git_utils.py` one-to-one:
/// `git rev-parse`, `git worktree add`, `git worktree prune`.
pub struct GitCollaborator {
    pub repo: std::path::PathBuf,
}

impl GitCollaborator {
    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo);
        cmd
    }

    fn run(&self, label: &'static str, mut cmd: Command) -> Result<String, CollaboratorError> {
        let output = cmd.output().map_err(|e| CollaboratorError::Io(label, e))?;
        if !output.status.success() {
            return Err(CollaboratorError::NonZeroExit(label, output.status));
        }
        String::from_utf8(output.stdout).map_err(|_| CollaboratorError::NotUtf8(label))
    }
}

impl RevisionControlCollaborator for GitCollaborator {
    #[instrument(skip(self))]
    fn resolve_revision(&self, revision_ish: &str) -> Result<String, CollaboratorError> {
        let mut cmd = self.git();
        cmd.args(["rev-parse", revision_ish]);
        Ok(self.run("git rev-parse", cmd)?.trim().to_owned())
    }

    #[instrument(skip(self))]
    fn create_worktree(&self, at: &Path, commit: &str) -> Result<(), CollaboratorError> {
        let mut cmd = self.git();
        cmd.args(["worktree", "add", "--detach"])
            .arg(at)
            .arg(commit);
        self.run("git worktree add", cmd)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn prune_worktrees(&self) -> Result<(), CollaboratorError> {
        let mut cmd = self.git();
        cmd.args(["worktree", "prune"]);
        self.run("git worktree prune", cmd)?;
        Ok(())
    }
}

impl crate::workdir::WorktreePruner for GitCollaborator {
    fn prune(&self) -> io::Result<()> {
        self.prune_worktrees()
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// "Atomically set the profile symlink at `<root>/nix/var/nix/profiles/system`
/// to a given StorePath" (§6), invoked on the receiver after a successful
/// import.
pub trait ProfileCollaborator {
    fn set_profile(&self, root: Option<&Path>, target: &StorePath) -> Result<(), CollaboratorError>;
}

/// Swaps the profile symlink by creating a fresh link under the profile's
/// parent directory and renaming it over the existing name — `rename(2)` is
/// atomic within a directory, matching `nix_tools.set_profile_path`'s use of
/// `os.rename` over a freshly `os.symlink`ed temp name.
pub struct SystemProfileCollaborator;

impl ProfileCollaborator for SystemProfileCollaborator {
    #[instrument(skip(self))]
    fn set_profile(&self, root: Option<&Path>, target: &StorePath) -> Result<(), CollaboratorError> {
        let profile = profile_path(root);
        let parent = profile.parent().expect("profile path always has a parent");
        std::fs::create_dir_all(parent).map_err(|e| CollaboratorError::Io("create profile dir", e))?;
        let tmp = parent.join(format!(".nixos-ship-profile-{}", std::process::id()));
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(target.to_string(), &tmp)
            .map_err(|e| CollaboratorError::Io("symlink profile", e))?;
        std::fs::rename(&tmp, &profile).map_err(|e| CollaboratorError::Io("rename profile", e))?;
        debug!(profile = %profile.display(), target = %target, "profile updated");
        Ok(())
    }
}

fn profile_path(root: Option<&Path>) -> std::path::PathBuf {
    let suffix = Path::new("nix/var/nix/profiles/system");
    match root {
        Some(root) => root.join(suffix),
        None => Path::new("/").join(suffix),
    }
}

/// Invokes `<configStorePath>/bin/switch-to-configuration boot`, optionally
/// inside a chroot-like enter tool when an alternate root is set (§6).
pub trait ActivationCollaborator {
    fn activate(
        &self,
        target: &StorePath,
        root: Option<&Path>,
        install_bootloader: bool,
    ) -> Result<(), CollaboratorError>;
}

pub struct SwitchToConfigurationCollaborator;

impl ActivationCollaborator for SwitchToConfigurationCollaborator {
    #[instrument(skip(self))]
    fn activate(
        &self,
        target: &StorePath,
        root: Option<&Path>,
        install_bootloader: bool,
    ) -> Result<(), CollaboratorError> {
        let script = format!("{target}/bin/switch-to-configuration");
        let mut cmd = match root {
            Some(root) => {
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(&script);
                cmd
            }
            None => Command::new(&script),
        };
        cmd.arg("boot");
        if install_bootloader {
            cmd.env("NIXOS_INSTALL_BOOTLOADER", "1");
        }
        let status = cmd.status().map_err(|e| CollaboratorError::Io("switch-to-configuration", e))?;
        if !status.success() {
            return Err(CollaboratorError::NonZeroExit("switch-to-configuration", status));
        }
        Ok(())
    }
}
