//! Content-addressed blob storage for attachment/page bodies.
//!
//! Large or binary payloads (attachment bytes, page bodies above some
//! threshold) are stored once, keyed by their [`ContentHash`], with a
//! reference count incremented on every entity that cites the hash and
//! decremented when that entity is deleted or edited away from it. A blob is
//! only actually removed once its count reaches zero — the redb analogue of
//! the teacher's `events_missing`/GC lifecycle, generalized from events to
//! arbitrary content blobs.

use snafu::{ResultExt as _, Snafu};

use crate::tables;
use crate::WriteTransactionCtx;

#[derive(Debug, Snafu)]
pub enum ContentDedupError {
    #[snafu(transparent)]
    Storage { source: redb::StorageError },
}
pub type ContentDedupResult<T> = std::result::Result<T, ContentDedupError>;

/// Store `bytes` under their content hash, bumping the refcount if it is
/// already present. Returns the hash to be cited from a companion row.
pub fn insert(tx: &WriteTransactionCtx, bytes: &[u8]) -> ContentDedupResult<spaces_core::ContentHash> {
    let hash = spaces_core::ContentHash::of(bytes);

    let mut store = tx.open_table(&tables::content_store::TABLE)?;
    let mut rc = tx.open_table(&tables::content_rc::TABLE)?;

    if store.get(&hash)?.is_none() {
        store.insert(&hash, &bytes.to_vec())?;
    }
    let count = rc.get(&hash)?.map(|g| g.value()).unwrap_or(0);
    rc.insert(&hash, &(count + 1))?;

    Ok(hash)
}

/// Drop one reference to `hash`, removing the blob once the count reaches
/// zero.
pub fn release(tx: &WriteTransactionCtx, hash: &spaces_core::ContentHash) -> ContentDedupResult<()> {
    let mut rc = tx.open_table(&tables::content_rc::TABLE)?;
    let Some(count) = rc.get(hash)?.map(|g| g.value()) else {
        return Ok(());
    };
    if count <= 1 {
        rc.remove(hash)?;
        tx.open_table(&tables::content_store::TABLE)?.remove(hash)?;
    } else {
        rc.insert(hash, &(count - 1))?;
    }
    Ok(())
}

pub fn get(tx: &redb_bincode::ReadTransaction, hash: &spaces_core::ContentHash) -> ContentDedupResult<Option<Vec<u8>>> {
    let table = tx.open_table(&tables::content_store::TABLE).context(StorageSnafu)?;
    Ok(table.get(hash)?.map(|g| g.value()))
}
