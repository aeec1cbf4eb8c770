use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::content::{account_path, FileContentStore};
use crate::store::{Store, StoreError};

/// One reconciliation pass: for every tombstoned row, delete the content,
/// then the metadata, then the row itself. Files are processed independently;
/// a failure leaves that file's tombstone for the next pass and never aborts
/// the rest of the batch.
pub fn sweep(store: &dyn Store, content: &dyn FileContentStore) {
    let deleted = match store.get_deleted_files() {
        Ok(deleted) => deleted,
        Err(e) => {
            warn!(error = %e, "sweep: cannot list deleted files");
            return;
        }
    };

    for file in deleted {
        let path = account_path(&file.username, &file.filepath);
        // The content store treats an absent object as deleted; anything else
        // is a real failure that must block the row cleanup for retry.
        if let Err(e) = content.delete(&file.filename, &path) {
            warn!(error = %e, id = file.id, filename = %file.filename, "sweep: content delete failed, keeping tombstone");
            continue;
        }
        if let Err(e) = store.delete_file_metadata(file.id) {
            warn!(error = %e, id = file.id, "sweep: metadata delete failed, keeping tombstone");
            continue;
        }
        match store.delete_file_by_id(file.id) {
            Ok(()) => debug!(id = file.id, filename = %file.filename, "sweep: reclaimed file"),
            // Already gone: reclaimed by some other path.
            Err(StoreError::NotFound) => {}
            Err(e) => warn!(error = %e, id = file.id, "sweep: row delete failed"),
        }
    }
}

/// Spawn the background reclamation task, one per server. Runs a pass every
/// `interval` until `shutdown` fires, then exits cleanly.
pub fn spawn_sweep(
    store: Arc<dyn Store>,
    content: Arc<dyn FileContentStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("sweep: shutting down");
                    return;
                }
                _ = ticker.tick() => sweep(store.as_ref(), content.as_ref()),
            }
        }
    })
}
