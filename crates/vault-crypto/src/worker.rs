//! Background jobs on tokio's blocking pool.
//!
//! Each job runs one file operation off the async executor and exposes its
//! cancellation token, an ordered progress channel, and the join handle. The
//! calling task never touches key material or does cipher work.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CipherError, Result};
use crate::file::{decrypt_file, encrypt_file, FileOptions};
use crate::keys::{ContentKey, KeyProvider, KeySource};
use crate::progress::{Monitor, Progress};
use crate::Summary;

/// Owned form of [`KeySource`] that can move onto a worker thread.
#[derive(Clone)]
pub enum OwnedKeySource {
    Wrapped(Arc<dyn KeyProvider>),
    External(ContentKey),
}

impl OwnedKeySource {
    pub fn as_source(&self) -> KeySource<'_> {
        match self {
            OwnedKeySource::Wrapped(provider) => KeySource::Wrapped(provider.as_ref()),
            OwnedKeySource::External(key) => KeySource::External(key),
        }
    }
}

impl std::fmt::Debug for OwnedKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.as_source(), f)
    }
}

/// A running encrypt or decrypt job.
#[derive(Debug)]
pub struct JobHandle {
    pub cancel: CancellationToken,
    /// Progress in emission order; closes when the job ends.
    pub progress: mpsc::UnboundedReceiver<Progress>,
    pub task: JoinHandle<Result<Summary>>,
}

impl JobHandle {
    /// Request cancellation. Takes effect at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job's outcome.
    pub async fn join(self) -> Result<Summary> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(CipherError::Io(std::io::Error::other(e))),
        }
    }
}

fn spawn_job<F>(op: &'static str, job: F) -> JobHandle
where
    F: FnOnce(&mut Monitor<'static>) -> Result<Summary> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (tx, progress) = mpsc::unbounded_channel();
    let mut monitor = Monitor::new(cancel.clone()).on_progress(move |p| {
        // A dropped receiver just means nobody is watching.
        let _ = tx.send(p);
    });

    let task = tokio::task::spawn_blocking(move || {
        let result = job(&mut monitor);
        debug!(op, ok = result.is_ok(), "background job finished");
        result
    });

    JobHandle {
        cancel,
        progress,
        task,
    }
}

/// Run [`encrypt_file`] on the blocking pool. Must be called within a tokio runtime.
pub fn spawn_encrypt(
    src: PathBuf,
    dst: PathBuf,
    options: FileOptions,
    keys: OwnedKeySource,
) -> JobHandle {
    spawn_job("encrypt", move |monitor| {
        encrypt_file(&src, &dst, &options, keys.as_source(), monitor)
    })
}

/// Run [`decrypt_file`] on the blocking pool. Must be called within a tokio runtime.
pub fn spawn_decrypt(src: PathBuf, dst: PathBuf, keys: OwnedKeySource) -> JobHandle {
    spawn_job("decrypt", move |monitor| {
        decrypt_file(&src, &dst, keys.as_source(), monitor)
    })
}
