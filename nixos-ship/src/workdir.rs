//! Scoped temporary directory with guaranteed cleanup, spec.md §4.6: created
//! at the start of an operation, recursively removed on every exit path, with
//! the interrupt signal masked for the duration of that removal.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::warn;

/// An external collaborator that prunes stale revision-control worktrees
/// (spec.md §6's "prune stale worktrees"); out of scope for this crate's core,
/// modeled as a contract so [`Workdir`]'s `autoprune` mode has something to call.
pub trait WorktreePruner: Send + Sync {
    fn prune(&self) -> io::Result<()>;
}

/// A scoped acquisition whose release step (`Drop`) masks `SIGINT`/`SIGTERM`,
/// removes the directory tree, and — once cleanup ends — lets a fresh
/// interrupt abort the process immediately again, per spec.md §4.6/§9.
///
/// Cleanup is idempotent: `Drop` runs at most once per `Workdir` (ownership
/// guarantees that), and the `cleaning` flag it sets only changes how a
/// *concurrently arriving* signal is handled, not whether cleanup itself runs
/// twice.
pub struct Workdir {
    dir: Option<tempfile::TempDir>,
    cleaning: Arc<AtomicBool>,
    pruner: Option<Box<dyn WorktreePruner>>,
}

impl Workdir {
    pub fn new() -> io::Result<Self> {
        Self::with_pruner(None)
    }

    /// `autoprune` mode: `pruner` is invoked once cleanup completes.
    pub fn with_pruner(pruner: Option<Box<dyn WorktreePruner>>) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("nixos-ship-").tempdir()?;
        let cleaning = Arc::new(AtomicBool::new(false));
        spawn_signal_guard(cleaning.clone());
        Ok(Workdir {
            dir: Some(dir),
            cleaning,
            pruner,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .expect("workdir path queried after it was dropped")
            .path()
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        self.cleaning.store(true, Ordering::SeqCst);

        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_owned();
            if let Err(err) = dir.close() {
                warn!(?path, %err, "failed to remove workdir");
            }
        }
        if let Some(pruner) = &self.pruner {
            if let Err(err) = pruner.prune() {
                warn!(%err, "autoprune failed");
            }
        }

        self.cleaning.store(false, Ordering::SeqCst);
    }
}

/// Spawns a dedicated thread that watches `SIGINT`/`SIGTERM` for the lifetime
/// of the process. While `cleaning` is unset, a signal aborts immediately
/// (spec.md §5: "User-initiated interrupt aborts the operation immediately
/// unless the Workdir's Signal Guard is active"). While set, it prints a
/// "still cleaning up" notice and lets the in-progress removal finish.
fn spawn_signal_guard(cleaning: Arc<AtomicBool>) {
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            warn!(%err, "failed to install signal guard; interrupts will use default handling");
            return;
        }
    };
    thread::spawn(move || {
        for signal in signals.forever() {
            if cleaning.load(Ordering::SeqCst) {
                eprintln!("nixos-ship: still cleaning up, please wait...");
                continue;
            }
            eprintln!("nixos-ship: interrupted");
            std::process::exit(128 + signal);
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn removes_directory_on_drop() {
        let workdir = Workdir::new().unwrap();
        let path = workdir.path().to_owned();
        assert!(path.exists());
        drop(workdir);
        assert!(!path.exists());
    }

    struct RecordingPruner(Arc<Mutex<bool>>);

    impl WorktreePruner for RecordingPruner {
        fn prune(&self) -> io::Result<()> {
            *self.0.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn autoprune_runs_on_drop() {
        let pruned = Arc::new(Mutex::new(false));
        let workdir = Workdir::with_pruner(Some(Box::new(RecordingPruner(pruned.clone())))).unwrap();
        drop(workdir);
        assert!(*pruned.lock().unwrap());
    }
}
