use serde::{Deserialize, Serialize};

/// A tenant identity. `password_hash` is an Argon2id PHC string and never
/// leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub username: String,
    pub password_hash: String,
    pub blocked: bool,
}

/// Stored in redb as bincode-encoded bytes. `ciphertext` is the text-encoded
/// AEAD output produced by [`crate::crypto`]; it is opaque to storage and is
/// never decrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: u64,
    pub account_id: u64,
    pub key: String,
    pub ciphertext: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// A stored file row. `deleted` is a tombstone: set by a soft delete, cleared
/// only by the GC sweep physically removing the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub account_id: u64,
    pub filename: String,
    pub filepath: String,
    pub filesize: u64,
    pub deleted: bool,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// A key/value metadata pair attached to a secret or a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPair {
    pub key: String,
    pub value: String,
}

/// A tombstoned file joined with its owning account, as consumed by the GC
/// sweep.
#[derive(Debug, Clone)]
pub struct DeletedFile {
    pub id: u64,
    pub filename: String,
    pub filepath: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct CreateAccountParams {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct CreateSecretParams {
    pub account_id: u64,
    pub key: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone)]
pub struct CreateFileParams {
    pub account_id: u64,
    pub filename: String,
    pub filepath: String,
}
