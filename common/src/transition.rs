// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The idempotent directory transition protocol.
//!
//! During finalize the source cluster's data directories are archived out
//! of the way and the target cluster's directories are published into the
//! vacated locations; during revert the moves run the other way. A crash
//! can interrupt these renames at any point, and the orchestrator will run
//! the same transition again on resume, possibly on a host where a prior
//! run already finished. Every operation here is therefore written to be
//! safe to repeat: a rename that finds its work already done is a success,
//! not an error.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::io;

/// A single directory rename, shipped to agents in per-host batches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePair {
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
}

impl RenamePair {
    pub fn new(
        source: impl Into<Utf8PathBuf>,
        destination: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self { source: source.into(), destination: destination.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("failed to rename {source} to {destination}")]
    Rename {
        source: Utf8PathBuf,
        destination: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to inspect {path}")]
    Inspect {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

/// Archives `source` and, if a `target` is given, publishes it into the
/// vacated location.
///
/// The full sequence is `source -> archive` then `target -> source`. With
/// `target` absent this is the pure archival case (e.g. a standby that has
/// no replacement directory to promote).
///
/// Safe to call again after a crash at any point: if the end state is
/// already in place the filesystem is left untouched, and each individual
/// rename tolerates having already been performed by a prior run.
pub fn transition_pair(
    source: &Utf8Path,
    target: Option<&Utf8Path>,
    archive: &Utf8Path,
) -> Result<(), TransitionError> {
    if already_transitioned(source, target, archive)? {
        return Ok(());
    }

    rename_idempotent(source, archive)?;
    if let Some(target) = target {
        rename_idempotent(target, source)?;
    }
    Ok(())
}

/// Returns true if a prior run already completed the whole transition.
fn already_transitioned(
    source: &Utf8Path,
    target: Option<&Utf8Path>,
    archive: &Utf8Path,
) -> Result<bool, TransitionError> {
    let done = !exists(source)?
        && exists(archive)?
        && match target {
            // The target was already moved into the source's old location.
            Some(target) => !exists(target)?,
            None => true,
        };
    Ok(done)
}

/// Renames `source` to `destination`, treating evidence that the rename
/// already happened as success.
///
/// Exactly three failure conditions are classified as "already done": the
/// source no longer exists, the destination already exists, or the
/// destination exists and is non-empty. Anything else is fatal.
fn rename_idempotent(
    source: &Utf8Path,
    destination: &Utf8Path,
) -> Result<(), TransitionError> {
    match std::fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(err) if matches!(
            err.kind(),
            io::ErrorKind::NotFound
                | io::ErrorKind::AlreadyExists
                | io::ErrorKind::DirectoryNotEmpty
        ) =>
        {
            Ok(())
        }
        Err(err) => Err(TransitionError::Rename {
            source: source.to_owned(),
            destination: destination.to_owned(),
            err,
        }),
    }
}

fn exists(path: &Utf8Path) -> Result<bool, TransitionError> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => {
            Err(TransitionError::Inspect { path: path.to_owned(), err })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    struct Dirs {
        _tmp: Utf8TempDir,
        source: Utf8PathBuf,
        target: Utf8PathBuf,
        archive: Utf8PathBuf,
    }

    fn setup() -> Dirs {
        let tmp = Utf8TempDir::new().unwrap();
        let source = tmp.path().join("data");
        let target = tmp.path().join("data.target");
        let archive = tmp.path().join("data.old");
        std::fs::create_dir(&source).unwrap();
        std::fs::create_dir(&target).unwrap();
        std::fs::write(source.join("postgresql.conf"), "old").unwrap();
        std::fs::write(target.join("postgresql.conf"), "new").unwrap();
        Dirs { _tmp: tmp, source, target, archive }
    }

    fn assert_published(dirs: &Dirs) {
        assert!(!dirs.target.exists());
        assert_eq!(
            std::fs::read_to_string(dirs.source.join("postgresql.conf"))
                .unwrap(),
            "new"
        );
        assert_eq!(
            std::fs::read_to_string(dirs.archive.join("postgresql.conf"))
                .unwrap(),
            "old"
        );
    }

    #[test]
    fn archives_and_publishes() {
        let dirs = setup();
        transition_pair(&dirs.source, Some(&dirs.target), &dirs.archive)
            .unwrap();
        assert_published(&dirs);
    }

    #[test]
    fn repeat_call_is_idempotent() {
        let dirs = setup();
        transition_pair(&dirs.source, Some(&dirs.target), &dirs.archive)
            .unwrap();
        // A crash-and-retry reruns the same transition; the end state must
        // be unchanged and the second call must also succeed.
        transition_pair(&dirs.source, Some(&dirs.target), &dirs.archive)
            .unwrap();
        assert_published(&dirs);
    }

    #[test]
    fn resumes_after_partial_completion() {
        let dirs = setup();
        // Simulate a crash after the archive rename but before the publish
        // rename.
        std::fs::rename(&dirs.source, &dirs.archive).unwrap();
        transition_pair(&dirs.source, Some(&dirs.target), &dirs.archive)
            .unwrap();
        assert_published(&dirs);
    }

    #[test]
    fn pure_archival_without_target() {
        let dirs = setup();
        transition_pair(&dirs.source, None, &dirs.archive).unwrap();
        assert!(!dirs.source.exists());
        assert!(dirs.archive.exists());

        transition_pair(&dirs.source, None, &dirs.archive).unwrap();
        assert!(!dirs.source.exists());
        assert!(dirs.archive.exists());
    }

    #[test]
    fn unrelated_rename_failure_is_fatal() {
        let dirs = setup();
        // Renaming a directory on top of a regular file fails with
        // ENOTDIR, which is not one of the classified conditions.
        let file = dirs.source.parent().unwrap().join("occupied");
        std::fs::write(&file, "x").unwrap();
        let err =
            transition_pair(&dirs.source, Some(&dirs.target), &file.join("y"))
                .unwrap_err();
        assert!(matches!(err, TransitionError::Rename { .. }));
    }
}
