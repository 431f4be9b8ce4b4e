use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::Result;

/// Acquire an exclusive advisory lock, blocking until it is available.
/// Used around schema bootstrap so two processes cannot migrate the same
/// database concurrently. The lock is released when the File is dropped.
pub fn acquire_blocking(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt;
    use tempfile::tempdir;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("bootstrap.lock");

        let file = acquire_blocking(&lock_path).unwrap();
        let second = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .unwrap();
        assert!(second.try_lock_exclusive().is_err());

        drop(file);
        assert!(second.try_lock_exclusive().is_ok());
    }
}
