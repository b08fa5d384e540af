//! Transacted file operations and the transacted file inbound.
//!
//! Inside a transaction, mutations are journaled and applied in order at
//! commit, after a prepare step that checks every source file will exist at
//! the point its operation runs. Rollback discards the journal. Outside a
//! transaction every operation applies immediately. Reads always see the
//! disk, never pending writes.
//!
//! Commit is all or nothing. A file about to be deleted or overwritten is
//! first moved aside to a hidden backup in its own directory; when a later
//! operation fails, everything already applied is undone in reverse order
//! and the backups are moved back. Backups of a successful commit are
//! removed.
//!
//! [`FileReceiver`] consumes one file per transaction: the file is read and
//! its removal journaled, and the transaction commits only once the
//! component succeeded or the exception strategy handled its failure.

use crate::transaction::{ResourceManager, TransactionError, TransactionStatus, TransactionalSession};
use correlator_core::{
    Event, ExceptionOutcome, FlowIdentity, Message, MessagingError, MessagingExceptionHandler,
    PropertyScope, Processor,
};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use thiserror::Error;

/// File operation errors.
#[derive(Error, Debug)]
pub enum FileError {
    /// Deleting failed
    #[error("Failed to delete {path}: {source}")]
    Delete {
        /// Target path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Copying failed
    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        /// Source path
        from: PathBuf,
        /// Destination path
        to: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Renaming failed
    #[error("Failed to rename {from} to {to}: {source}")]
    Rename {
        /// Source path
        from: PathBuf,
        /// Destination path
        to: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Writing failed
    #[error("Failed to write {path}: {source}")]
    Write {
        /// Target path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Reading failed
    #[error("Failed to read {path}: {source}")]
    Read {
        /// Target path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A journaled operation refers to a file that will not exist
    #[error("Source file {0} does not exist")]
    MissingSource(PathBuf),

    /// Illegal transaction use
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// One journaled file mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    /// Delete a file
    Delete(PathBuf),
    /// Copy a file
    Copy {
        /// Source
        from: PathBuf,
        /// Destination
        to: PathBuf,
    },
    /// Rename a file
    Rename {
        /// Source
        from: PathBuf,
        /// Destination
        to: PathBuf,
    },
    /// Write a file, replacing its content
    Write {
        /// Target
        path: PathBuf,
        /// New content
        contents: Vec<u8>,
    },
}

impl FileOp {
    /// Apply, logging in `undo` how to reverse every step that took effect.
    fn apply_logged(&self, undo: &mut Vec<Undo>) -> Result<(), FileError> {
        match self {
            Self::Delete(path) => {
                let failed = |source: io::Error| FileError::Delete {
                    path: path.clone(),
                    source,
                };
                let backup = displace(path)
                    .map_err(failed)?
                    .ok_or_else(|| failed(io::ErrorKind::NotFound.into()))?;
                undo.push(Undo::Restore {
                    path: path.clone(),
                    backup,
                });
            },
            Self::Copy { from, to } => {
                let failed = |source: io::Error| FileError::Copy {
                    from: from.clone(),
                    to: to.clone(),
                    source,
                };
                stash(to, undo).map_err(failed)?;
                std::fs::copy(from, to).map_err(failed)?;
            },
            Self::Rename { from, to } => {
                let failed = |source: io::Error| FileError::Rename {
                    from: from.clone(),
                    to: to.clone(),
                    source,
                };
                stash(to, undo).map_err(failed)?;
                std::fs::rename(from, to).map_err(failed)?;
                undo.push(Undo::Rename {
                    from: to.clone(),
                    to: from.clone(),
                });
            },
            Self::Write { path, contents } => {
                let failed = |source: io::Error| FileError::Write {
                    path: path.clone(),
                    source,
                };
                stash(path, undo).map_err(failed)?;
                std::fs::write(path, contents).map_err(failed)?;
            },
        }
        Ok(())
    }
}

/// Reverses one applied step of a commit.
#[derive(Debug)]
enum Undo {
    /// Put a file that was moved aside back in place
    Restore { path: PathBuf, backup: TempPath },
    /// Remove a file the commit created
    Remove(PathBuf),
    /// Move a renamed file back
    Rename { from: PathBuf, to: PathBuf },
}

impl Undo {
    fn revert(self) -> io::Result<()> {
        match self {
            Self::Restore { path, backup } => backup.persist(&path).map_err(|err| err.error),
            Self::Remove(path) => match std::fs::remove_file(&path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            },
            Self::Rename { from, to } => std::fs::rename(from, to),
        }
    }
}

/// Move the file at `path` to a fresh hidden sibling. `None` if there is
/// nothing at `path`.
fn displace(path: &Path) -> io::Result<Option<TempPath>> {
    match std::fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
        Ok(_) => {},
    }
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let backup = tempfile::Builder::new()
        .prefix(".txn-")
        .suffix(".bak")
        .tempfile_in(dir)?
        .into_temp_path();
    std::fs::rename(path, &backup)?;
    Ok(Some(backup))
}

/// Clear `path` for a file about to be created there, logging the undo.
fn stash(path: &Path, undo: &mut Vec<Undo>) -> io::Result<()> {
    let step = match displace(path)? {
        Some(backup) => Undo::Restore {
            path: path.to_path_buf(),
            backup,
        },
        None => Undo::Remove(path.to_path_buf()),
    };
    undo.push(step);
    Ok(())
}

/// Apply `ops` in order; on the first failure undo the ones before it.
fn apply_all(ops: &[FileOp]) -> Result<(), FileError> {
    let mut undo = Vec::new();
    for (index, op) in ops.iter().enumerate() {
        if let Err(err) = op.apply_logged(&mut undo) {
            tracing::error!(
                applied = index,
                pending = ops.len() - index,
                error = %err,
                "File operation failed, undoing the ones already applied"
            );
            for step in undo.into_iter().rev() {
                let described = format!("{step:?}");
                if let Err(undo_err) = step.revert() {
                    tracing::error!(step = %described, error = %undo_err, "Could not undo file operation");
                }
            }
            return Err(err);
        }
    }

    for step in undo {
        if let Undo::Restore { path, backup } = step {
            if let Err(err) = backup.close() {
                tracing::warn!(path = %path.display(), error = %err, "Could not remove backup of replaced file");
            }
        }
    }
    Ok(())
}

/// Pending operations of one file transaction.
#[derive(Debug, Default)]
pub struct FileJournal {
    ops: Vec<FileOp>,
}

impl FileJournal {
    /// Journaled operations in order.
    #[must_use]
    pub fn ops(&self) -> &[FileOp] {
        &self.ops
    }
}

/// Tracks which paths exist while a journal is replayed on paper.
#[derive(Default)]
struct Overlay {
    created: HashSet<PathBuf>,
    removed: HashSet<PathBuf>,
}

impl Overlay {
    fn exists(&self, path: &Path) -> bool {
        self.created.contains(path) || (!self.removed.contains(path) && path.is_file())
    }

    fn require(&self, path: &Path) -> Result<(), FileError> {
        if self.exists(path) {
            Ok(())
        } else {
            Err(FileError::MissingSource(path.to_path_buf()))
        }
    }

    fn create(&mut self, path: &Path) {
        self.removed.remove(path);
        self.created.insert(path.to_path_buf());
    }

    fn remove(&mut self, path: &Path) {
        self.created.remove(path);
        self.removed.insert(path.to_path_buf());
    }
}

/// Resource manager for the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileManager;

impl ResourceManager for FileManager {
    type Journal = FileJournal;
    type Error = FileError;

    fn prepare(&self, journal: &FileJournal) -> Result<(), FileError> {
        let mut overlay = Overlay::default();
        for op in &journal.ops {
            match op {
                FileOp::Delete(path) => {
                    overlay.require(path)?;
                    overlay.remove(path);
                },
                FileOp::Copy { from, to } => {
                    overlay.require(from)?;
                    overlay.create(to);
                },
                FileOp::Rename { from, to } => {
                    overlay.require(from)?;
                    overlay.remove(from);
                    overlay.create(to);
                },
                FileOp::Write { path, .. } => overlay.create(path),
            }
        }
        Ok(())
    }

    fn commit(&self, journal: FileJournal) -> Result<(), FileError> {
        apply_all(&journal.ops)?;
        tracing::debug!(operations = journal.ops.len(), "Committed file transaction");
        Ok(())
    }

    fn rollback(&self, journal: FileJournal) -> Result<(), FileError> {
        tracing::debug!(discarded = journal.ops.len(), "Rolled back file transaction");
        Ok(())
    }
}

/// File session with optional transaction.
#[derive(Debug)]
pub struct TransactedFileSession {
    tx: TransactionalSession<FileManager>,
}

impl Default for TransactedFileSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactedFileSession {
    /// Create a session with no transaction.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tx: TransactionalSession::new(FileManager),
        }
    }

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Transaction`] if one is already active.
    pub fn begin(&mut self) -> Result<(), FileError> {
        Ok(self.tx.begin()?)
    }

    /// Validate and apply the journal.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::MissingSource`] when validation fails, the I/O
    /// error of the first failing operation (the ones before it are undone),
    /// or [`FileError::Transaction`] if no transaction is active.
    pub fn commit(&mut self) -> Result<(), FileError> {
        self.tx.commit()
    }

    /// Discard the journal.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Transaction`] if no transaction is active.
    pub fn rollback(&mut self) -> Result<(), FileError> {
        self.tx.rollback()
    }

    /// Transaction state.
    #[must_use]
    pub const fn status(&self) -> TransactionStatus {
        self.tx.status()
    }

    /// Whether a transaction is in progress.
    #[must_use]
    pub const fn is_transacted(&self) -> bool {
        self.tx.is_active()
    }

    /// Delete `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Delete`] when applied immediately and it fails.
    pub fn delete(&mut self, path: impl Into<PathBuf>) -> Result<(), FileError> {
        self.run(FileOp::Delete(path.into()))
    }

    /// Copy `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Copy`] when applied immediately and it fails.
    pub fn copy(&mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Result<(), FileError> {
        self.run(FileOp::Copy {
            from: from.into(),
            to: to.into(),
        })
    }

    /// Rename `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Rename`] when applied immediately and it fails.
    pub fn rename(
        &mut self,
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
    ) -> Result<(), FileError> {
        self.run(FileOp::Rename {
            from: from.into(),
            to: to.into(),
        })
    }

    /// Write `contents` to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Write`] when applied immediately and it fails.
    pub fn write(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Result<(), FileError> {
        self.run(FileOp::Write {
            path: path.into(),
            contents: contents.into(),
        })
    }

    /// Read `path` from disk.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Read`] if the file cannot be read.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, FileError> {
        let path = path.as_ref();
        std::fs::read(path).map_err(|source| FileError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Operations journaled in the active transaction.
    #[must_use]
    pub fn pending(&mut self) -> Vec<FileOp> {
        self.tx
            .with_journal(|journal| journal.ops().to_vec())
            .unwrap_or_default()
    }

    fn run(&mut self, op: FileOp) -> Result<(), FileError> {
        let journaled = self
            .tx
            .with_journal(|journal| journal.ops.push(op.clone()));
        match journaled {
            Some(()) => Ok(()),
            None => apply_all(std::slice::from_ref(&op)),
        }
    }
}

/// What became of a file handed to [`FileReceiver::receive`].
#[derive(Debug)]
pub enum FileDelivery {
    /// Processed, or its failure handled; the file was removed or archived.
    /// Carries the component's result.
    Consumed(Option<Event>),
    /// The component failed unhandled; the file is left in place for the
    /// next poll.
    Restored(MessagingError),
}

impl FileDelivery {
    /// Whether the file was consumed.
    #[must_use]
    pub const fn is_consumed(&self) -> bool {
        matches!(self, Self::Consumed(_))
    }
}

/// Transacted file inbound.
///
/// Each file is read, turned into an event and run through the component
/// inside its own file transaction, together with the deletion of the file
/// (or its move into the archive directory).
pub struct FileReceiver {
    name: String,
    component: Arc<dyn Processor>,
    exception_handler: Option<Arc<dyn MessagingExceptionHandler>>,
    move_to: Option<PathBuf>,
}

impl FileReceiver {
    /// Receiver `name` feeding `component`.
    #[must_use]
    pub fn new(name: impl Into<String>, component: Arc<dyn Processor>) -> Self {
        Self {
            name: name.into(),
            component,
            exception_handler: None,
            move_to: None,
        }
    }

    /// Decide which component failures count as handled. Without one every
    /// failure is unhandled.
    #[must_use]
    pub fn with_exception_handler(mut self, handler: Arc<dyn MessagingExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Archive consumed files into `dir`, keeping their names, instead of
    /// deleting them.
    #[must_use]
    pub fn with_move_to_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.move_to = Some(dir.into());
        self
    }

    /// Consume the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Read`] if the file cannot be read, or the error
    /// of a commit that failed; the file is untouched in both cases.
    pub async fn receive(&self, path: impl AsRef<Path>) -> Result<FileDelivery, FileError> {
        let path = path.as_ref();
        let mut session = TransactedFileSession::new();
        session.begin()?;
        let contents = session.read(path)?;
        match &self.move_to {
            Some(dir) => {
                let name = path
                    .file_name()
                    .ok_or_else(|| FileError::MissingSource(path.to_path_buf()))?;
                session.rename(path, dir.join(name))?;
            },
            None => session.delete(path)?,
        }

        let endpoint = format!("file://{}", path.display());
        let message = Message::new(contents).with_property(
            PropertyScope::Inbound,
            "originalFilename",
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        );
        let event = Event::new(message).with_flow(FlowIdentity::new(&self.name, endpoint));

        let outcome = match self.component.process(event.clone()).await {
            Ok(result) => Ok(result),
            Err(error) => match self.classify(&error, event) {
                ExceptionOutcome::Handled(substitute) => {
                    tracing::debug!(receiver = %self.name, path = %path.display(), %error, "Failure handled, consuming file");
                    Ok(Some(substitute))
                },
                ExceptionOutcome::Unhandled(failed) => Err(error.with_event(failed)),
            },
        };

        match outcome {
            Ok(result) => {
                session.commit()?;
                tracing::debug!(receiver = %self.name, path = %path.display(), "File consumed");
                Ok(FileDelivery::Consumed(result))
            },
            Err(error) => {
                session.rollback()?;
                tracing::warn!(receiver = %self.name, path = %path.display(), %error, "Unhandled failure, leaving file for redelivery");
                Ok(FileDelivery::Restored(error))
            },
        }
    }

    fn classify(&self, error: &MessagingError, event: Event) -> ExceptionOutcome {
        match &self.exception_handler {
            Some(handler) => handler.handle_exception(error, event),
            None => ExceptionOutcome::Unhandled(event),
        }
    }
}

impl std::fmt::Debug for FileReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReceiver")
            .field("name", &self.name)
            .field("move_to", &self.move_to)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_operations_without_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let mut session = TransactedFileSession::new();

        session.write(&a, "hello").unwrap();
        session.rename(&a, &b).unwrap();

        assert!(!a.exists());
        assert_eq!(session.read(&b).unwrap(), b"hello");
    }

    #[test]
    fn test_transacted_operations_deferred_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, "payload").unwrap();

        let mut session = TransactedFileSession::new();
        session.begin().unwrap();
        session.copy(&src, &dst).unwrap();
        session.delete(&src).unwrap();

        assert!(src.exists());
        assert!(!dst.exists());
        assert_eq!(session.pending().len(), 2);

        session.commit().unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn test_rollback_discards_operations() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keep.txt");
        std::fs::write(&file, "original").unwrap();

        let mut session = TransactedFileSession::new();
        session.begin().unwrap();
        session.write(&file, "changed").unwrap();
        session.delete(&file).unwrap();
        session.rollback().unwrap();

        assert_eq!(std::fs::read(&file).unwrap(), b"original");
        assert_eq!(session.status(), TransactionStatus::RolledBack);
    }

    #[test]
    fn test_prepare_rejects_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let written = dir.path().join("new.txt");
        let moved = dir.path().join("moved.txt");

        let mut session = TransactedFileSession::new();
        session.begin().unwrap();
        session.write(&written, "x").unwrap();
        session.rename(&written, &moved).unwrap();
        // Source was renamed away earlier in the same transaction
        session.delete(&written).unwrap();

        assert!(matches!(session.commit(), Err(FileError::MissingSource(_))));
        assert!(!written.exists());
        assert!(!moved.exists());
        assert_eq!(session.status(), TransactionStatus::RolledBack);
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_failed_copy_undoes_earlier_delete() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.xml");
        let b = dir.path().join("b.xml");
        std::fs::write(&a, "<a/>").unwrap();
        std::fs::write(&b, "<b/>").unwrap();

        let mut session = TransactedFileSession::new();
        session.begin().unwrap();
        session.delete(&a).unwrap();
        session.copy(&b, dir.path().join("missing-dir").join("b.xml")).unwrap();

        assert!(matches!(session.commit(), Err(FileError::Copy { .. })));
        assert_eq!(std::fs::read(&a).unwrap(), b"<a/>");
        assert_eq!(listing(dir.path()), vec!["a.xml", "b.xml"]);
    }

    #[test]
    fn test_failed_rename_restores_overwritten_file() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.txt");
        let staged = dir.path().join("staged.txt");
        std::fs::write(&report, "v1").unwrap();
        std::fs::write(&staged, "draft").unwrap();

        let mut session = TransactedFileSession::new();
        session.begin().unwrap();
        session.write(&report, "v2").unwrap();
        session.rename(&staged, dir.path().join("out.txt")).unwrap();
        session
            .rename(&report, dir.path().join("nowhere").join("report.txt"))
            .unwrap();

        assert!(matches!(session.commit(), Err(FileError::Rename { .. })));
        assert_eq!(std::fs::read(&report).unwrap(), b"v1");
        assert_eq!(std::fs::read(&staged).unwrap(), b"draft");
        assert_eq!(listing(dir.path()), vec!["report.txt", "staged.txt"]);
    }

    #[test]
    fn test_successful_commit_leaves_no_backups() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.txt");
        let gone = dir.path().join("gone.txt");
        std::fs::write(&target, "old").unwrap();
        std::fs::write(&gone, "bye").unwrap();

        let mut session = TransactedFileSession::new();
        session.begin().unwrap();
        session.write(&target, "new").unwrap();
        session.delete(&gone).unwrap();
        session.commit().unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert_eq!(listing(dir.path()), vec!["target.txt"]);
    }

    #[test]
    fn test_immediate_error_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = TransactedFileSession::new();
        let result = session.delete(dir.path().join("absent"));
        assert!(matches!(result, Err(FileError::Delete { .. })));
    }
}
