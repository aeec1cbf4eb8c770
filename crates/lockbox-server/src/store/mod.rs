pub mod db;
pub mod mem;
pub mod model;

use tokio::sync::oneshot;

pub use db::RedbStore;
pub use mem::{InMemoryAccountStore, MemStore};
pub use model::{
    Account, CreateAccountParams, CreateFileParams, CreateSecretParams, DeletedFile, FileRecord,
    MetadataPair, SecretRecord,
};

/// Failures surfaced by [`Store`] implementations. Services map these to the
/// RPC status taxonomy at the boundary: `NotFound` and `AlreadyExists` keep
/// their meaning, everything under `Other` becomes Internal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    AlreadyExists,
    /// The caller signalled rollback on a pending create; the caller already
    /// holds the error it wants to report.
    #[error("transaction rolled back")]
    RolledBack,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Other(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        Self::Other(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        Self::Other(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        Self::Other(e.into())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Other(e.into())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Other(e.into())
    }
}

/// Resolution of a pending two-phase file create, sent once over the
/// per-request handoff channel. The final size rides along with the commit
/// because the row is inserted before any chunk has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit { filesize: u64 },
    Rollback,
}

/// Account lookup/creation capability. Implemented by the full [`Store`]
/// backends and by [`InMemoryAccountStore`] for backend-less operation.
pub trait AccountStore: Send + Sync {
    /// `AlreadyExists` if the username is taken.
    fn create_account(&self, params: CreateAccountParams) -> Result<Account, StoreError>;
    /// `NotFound` if the username is unknown.
    fn get_account(&self, username: &str) -> Result<Account, StoreError>;
}

/// The storage capability consumed by the services. One production
/// implementation ([`RedbStore`]) and one in-memory double ([`MemStore`]).
///
/// Methods are synchronous; callers on the async runtime either accept the
/// short blocking window (point reads/writes) or move to a blocking task
/// ([`Store::create_file_tx`], which parks until its handoff resolves).
pub trait Store: AccountStore {
    // ── Secrets ──────────────────────────────────────────────────────────

    /// `AlreadyExists` on a `(account_id, key)` collision.
    fn create_secret(&self, params: CreateSecretParams) -> Result<SecretRecord, StoreError>;
    fn get_secret(&self, account_id: u64, key: &str) -> Result<SecretRecord, StoreError>;
    fn list_secrets(&self, account_id: u64) -> Result<Vec<SecretRecord>, StoreError>;
    /// Replaces the ciphertext of an existing secret. `NotFound` if absent.
    fn update_secret(
        &self,
        account_id: u64,
        key: &str,
        ciphertext: &str,
    ) -> Result<SecretRecord, StoreError>;
    /// Removes the secret row. Its metadata must already be gone.
    fn delete_secret(&self, account_id: u64, key: &str) -> Result<(), StoreError>;

    fn upsert_secret_metadata(
        &self,
        secret_id: u64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;
    fn list_secret_metadata(&self, secret_id: u64) -> Result<Vec<MetadataPair>, StoreError>;
    fn delete_secret_metadata(&self, secret_id: u64) -> Result<(), StoreError>;

    // ── Files ────────────────────────────────────────────────────────────

    /// Two-phase create: inserts the file row inside a write transaction,
    /// then **blocks** on `outcome` until the caller reports whether the
    /// out-of-band content write succeeded. Commits on [`TxOutcome::Commit`],
    /// rolls back on [`TxOutcome::Rollback`] or a dropped sender.
    ///
    /// Must be called from a blocking context. `AlreadyExists` if a live row
    /// occupies `(account_id, filename, filepath)`; `RolledBack` when the
    /// caller signalled rollback.
    fn create_file_tx(
        &self,
        params: CreateFileParams,
        outcome: oneshot::Receiver<TxOutcome>,
    ) -> Result<FileRecord, StoreError>;

    /// Live rows only; a tombstoned file is `NotFound`.
    fn get_file(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
    ) -> Result<FileRecord, StoreError>;
    fn list_files(&self, account_id: u64) -> Result<Vec<FileRecord>, StoreError>;
    /// `NotFound` if no live row matches; `AlreadyExists` if the new name is
    /// already occupied.
    fn update_file_name(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
        new_filename: &str,
    ) -> Result<FileRecord, StoreError>;
    /// Soft delete: sets the tombstone, leaving content and metadata for the
    /// GC sweep. `NotFound` if no live row matches.
    fn delete_file(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
    ) -> Result<(), StoreError>;
    /// All tombstoned rows joined with their owning username.
    fn get_deleted_files(&self) -> Result<Vec<DeletedFile>, StoreError>;
    /// Physically removes a row, tombstoned or not. Used by the GC sweep.
    fn delete_file_by_id(&self, id: u64) -> Result<(), StoreError>;

    fn upsert_file_metadata(&self, file_id: u64, key: &str, value: &str)
        -> Result<(), StoreError>;
    fn list_file_metadata(&self, file_id: u64) -> Result<Vec<MetadataPair>, StoreError>;
    fn delete_file_metadata(&self, file_id: u64) -> Result<(), StoreError>;
}
