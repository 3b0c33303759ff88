use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use log::{info, warn};
use snafu::ResultExt;

use crate::store::cancel::CancelToken;
use crate::store::consts::{CANCEL_POLL_MILLIS, LOCK_DIR};
use crate::store::error::*;
use crate::store::handler::Handler;

/// A named cross-process lock backed by an advisory file lock under
/// `<store root>/.locks/`. Acquisition is cancellable; after the first
/// failed attempt the handler is told that another process holds the
/// lock so it can surface a "waiting" progress item. The lock is
/// released when the guard is dropped.
#[derive(Debug)]
pub struct NamedLock {
    file: File,
    path: PathBuf,
}

impl NamedLock {
    pub fn acquire<P: AsRef<Path>>(
        store_root: P,
        name: &str,
        handler: &dyn Handler,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let lock_dir = store_root.as_ref().join(LOCK_DIR);
        fs::create_dir_all(&lock_dir).context(IoCreateSnafu { path: &lock_dir })?;

        let path = lock_dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .context(IoCreateSnafu { path: &path })?;

        let mut notified = false;
        loop {
            cancel.check()?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    info!("Acquired lock {name}");
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                // A holder that died without unlocking leaves no state to
                // recover with advisory locks; treat any other failure as
                // contention and keep polling.
                Err(e) => warn!("Lock attempt on {name} failed: {e}"),
            }

            if !notified {
                info!("Waiting for another process holding {name}");
                handler.waiting_for_lock(name);
                notified = true;
            }

            std::thread::sleep(Duration::from_millis(CANCEL_POLL_MILLIS));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::handler::SilentHandler;

    #[test]
    fn acquire_and_reacquire_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();

        let lock = NamedLock::acquire(dir.path(), "test-lock", &SilentHandler, &cancel).unwrap();
        assert!(lock.path().exists());
        drop(lock);

        NamedLock::acquire(dir.path(), "test-lock", &SilentHandler, &cancel).unwrap();
    }

    #[test]
    fn cancelled_acquisition_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = NamedLock::acquire(dir.path(), "test-lock", &SilentHandler, &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn distinct_names_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();

        let _a = NamedLock::acquire(dir.path(), "lock-a", &SilentHandler, &cancel).unwrap();
        let _b = NamedLock::acquire(dir.path(), "lock-b", &SilentHandler, &cancel).unwrap();
    }
}
