use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use super::model::{
    Account, CreateAccountParams, CreateFileParams, CreateSecretParams, DeletedFile, FileRecord,
    MetadataPair, SecretRecord,
};
use super::{AccountStore, Store, StoreError, TxOutcome};

const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
// id → username, so the GC join does not scan the accounts table.
const ACCOUNT_NAMES: TableDefinition<u64, &str> = TableDefinition::new("account_names");
const SECRETS: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("secrets");
const SECRET_META: TableDefinition<(u64, &str), &str> = TableDefinition::new("secret_metadata");
const FILES: TableDefinition<u64, &[u8]> = TableDefinition::new("files");
// (account_id, filename, filepath) → file id, live rows only. Tombstoned rows
// leave the index so the triple can be reused while the GC catches up.
const FILE_INDEX: TableDefinition<(u64, &str, &str), u64> = TableDefinition::new("file_index");
const FILE_META: TableDefinition<(u64, &str), &str> = TableDefinition::new("file_metadata");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const ACCOUNT_SEQ: &str = "account_seq";
const SECRET_SEQ: &str = "secret_seq";
const FILE_SEQ: &str = "file_seq";

/// Thread-safe handle to the redb-backed store.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(ACCOUNTS)?;
        write_txn.open_table(ACCOUNT_NAMES)?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(SECRET_META)?;
        write_txn.open_table(FILES)?;
        write_txn.open_table(FILE_INDEX)?;
        write_txn.open_table(FILE_META)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Allocate the next value of a named monotonic counter within `txn`.
fn next_id(txn: &redb::WriteTransaction, counter: &str) -> Result<u64, StoreError> {
    let mut table = txn.open_table(COUNTERS)?;
    let next = table.get(counter)?.map(|g| g.value()).unwrap_or(0) + 1;
    table.insert(counter, next)?;
    Ok(next)
}

impl AccountStore for RedbStore {
    fn create_account(&self, params: CreateAccountParams) -> Result<Account, StoreError> {
        let txn = self.db.begin_write()?;
        let taken = {
            let table = txn.open_table(ACCOUNTS)?;
            let found = table.get(params.username.as_str())?.is_some();
            found
        };
        if taken {
            txn.abort()?;
            return Err(StoreError::AlreadyExists);
        }

        let id = next_id(&txn, ACCOUNT_SEQ)?;
        let account = Account {
            id,
            username: params.username,
            password_hash: params.password_hash,
            blocked: false,
        };
        {
            let mut table = txn.open_table(ACCOUNTS)?;
            table.insert(account.username.as_str(), encode(&account)?.as_slice())?;
            let mut names = txn.open_table(ACCOUNT_NAMES)?;
            names.insert(id, account.username.as_str())?;
        }
        txn.commit()?;

        debug!(username = %account.username, "created account");
        Ok(account)
    }

    fn get_account(&self, username: &str) -> Result<Account, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        let bytes: Vec<u8> = table
            .get(username)?
            .map(|g| g.value().to_vec())
            .ok_or(StoreError::NotFound)?;
        decode(&bytes)
    }
}

impl Store for RedbStore {
    // ── Secrets ──────────────────────────────────────────────────────────

    fn create_secret(&self, params: CreateSecretParams) -> Result<SecretRecord, StoreError> {
        let txn = self.db.begin_write()?;
        let taken = {
            let table = txn.open_table(SECRETS)?;
            let found = table
                .get((params.account_id, params.key.as_str()))?
                .is_some();
            found
        };
        if taken {
            txn.abort()?;
            return Err(StoreError::AlreadyExists);
        }

        let record = SecretRecord {
            id: next_id(&txn, SECRET_SEQ)?,
            account_id: params.account_id,
            key: params.key,
            ciphertext: params.ciphertext,
            created_at: Self::now(),
        };
        {
            let mut table = txn.open_table(SECRETS)?;
            table.insert(
                (record.account_id, record.key.as_str()),
                encode(&record)?.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(record)
    }

    fn get_secret(&self, account_id: u64, key: &str) -> Result<SecretRecord, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let bytes: Vec<u8> = table
            .get((account_id, key))?
            .map(|g| g.value().to_vec())
            .ok_or(StoreError::NotFound)?;
        decode(&bytes)
    }

    fn list_secrets(&self, account_id: u64) -> Result<Vec<SecretRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;

        let mut records = Vec::new();
        for item in table.range((account_id, "")..)? {
            let (k, v) = item?;
            if k.value().0 != account_id {
                break;
            }
            records.push(decode(v.value())?);
        }
        Ok(records)
    }

    fn update_secret(
        &self,
        account_id: u64,
        key: &str,
        ciphertext: &str,
    ) -> Result<SecretRecord, StoreError> {
        let txn = self.db.begin_write()?;
        let record = {
            let mut table = txn.open_table(SECRETS)?;
            let bytes: Vec<u8> = table
                .get((account_id, key))?
                .map(|g| g.value().to_vec())
                .ok_or(StoreError::NotFound)?;
            let mut record: SecretRecord = decode(&bytes)?;
            record.ciphertext = ciphertext.to_owned();
            table.insert((account_id, key), encode(&record)?.as_slice())?;
            record
        };
        txn.commit()?;
        Ok(record)
    }

    fn delete_secret(&self, account_id: u64, key: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(SECRETS)?;
            let found = table.remove((account_id, key))?.is_some();
            found
        };
        txn.commit()?;
        if existed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    fn upsert_secret_metadata(
        &self,
        secret_id: u64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SECRET_META)?;
            table.insert((secret_id, key), value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn list_secret_metadata(&self, secret_id: u64) -> Result<Vec<MetadataPair>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRET_META)?;

        let mut pairs = Vec::new();
        for item in table.range((secret_id, "")..)? {
            let (k, v) = item?;
            let (owner, key) = k.value();
            if owner != secret_id {
                break;
            }
            pairs.push(MetadataPair {
                key: key.to_owned(),
                value: v.value().to_owned(),
            });
        }
        Ok(pairs)
    }

    fn delete_secret_metadata(&self, secret_id: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SECRET_META)?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for item in table.range((secret_id, "")..)? {
                    let (k, _v) = item?;
                    let (owner, key) = k.value();
                    if owner != secret_id {
                        break;
                    }
                    keys.push(key.to_owned());
                }
                keys
            };
            for key in &keys {
                table.remove((secret_id, key.as_str()))?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    // ── Files ────────────────────────────────────────────────────────────

    fn create_file_tx(
        &self,
        params: CreateFileParams,
        outcome: oneshot::Receiver<TxOutcome>,
    ) -> Result<FileRecord, StoreError> {
        let txn = self.db.begin_write()?;
        let taken = {
            let index = txn.open_table(FILE_INDEX)?;
            let found = index
                .get((
                    params.account_id,
                    params.filename.as_str(),
                    params.filepath.as_str(),
                ))?
                .is_some();
            found
        };
        if taken {
            txn.abort()?;
            return Err(StoreError::AlreadyExists);
        }

        let mut record = FileRecord {
            id: next_id(&txn, FILE_SEQ)?,
            account_id: params.account_id,
            filename: params.filename,
            filepath: params.filepath,
            filesize: 0,
            deleted: false,
            created_at: Self::now(),
        };
        {
            let mut files = txn.open_table(FILES)?;
            files.insert(record.id, encode(&record)?.as_slice())?;
            let mut index = txn.open_table(FILE_INDEX)?;
            index.insert(
                (
                    record.account_id,
                    record.filename.as_str(),
                    record.filepath.as_str(),
                ),
                record.id,
            )?;
        }

        // Park until the content write reports its outcome. The transaction
        // stays open, so the row is invisible to readers and the triple is
        // reserved against concurrent creates until the handoff resolves.
        match outcome.blocking_recv() {
            Ok(TxOutcome::Commit { filesize }) => {
                record.filesize = filesize;
                {
                    let mut files = txn.open_table(FILES)?;
                    files.insert(record.id, encode(&record)?.as_slice())?;
                }
                txn.commit()?;
                debug!(id = record.id, filename = %record.filename, "committed file row");
                Ok(record)
            }
            Ok(TxOutcome::Rollback) | Err(_) => {
                txn.abort()?;
                Err(StoreError::RolledBack)
            }
        }
    }

    fn get_file(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
    ) -> Result<FileRecord, StoreError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(FILE_INDEX)?;
        let id = index
            .get((account_id, filename, filepath))?
            .map(|g| g.value())
            .ok_or(StoreError::NotFound)?;

        let files = read_txn.open_table(FILES)?;
        let bytes: Vec<u8> = files
            .get(id)?
            .map(|g| g.value().to_vec())
            .ok_or(StoreError::NotFound)?;
        let record: FileRecord = decode(&bytes)?;
        if record.deleted {
            return Err(StoreError::NotFound);
        }
        Ok(record)
    }

    fn list_files(&self, account_id: u64) -> Result<Vec<FileRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record: FileRecord = decode(v.value())?;
            if record.account_id == account_id && !record.deleted {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn update_file_name(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
        new_filename: &str,
    ) -> Result<FileRecord, StoreError> {
        let txn = self.db.begin_write()?;
        let result = {
            let mut index = txn.open_table(FILE_INDEX)?;
            let id = index
                .get((account_id, filename, filepath))?
                .map(|g| g.value());
            match id {
                None => Err(StoreError::NotFound),
                Some(id) => {
                    if index.get((account_id, new_filename, filepath))?.is_some() {
                        Err(StoreError::AlreadyExists)
                    } else {
                        let mut files = txn.open_table(FILES)?;
                        let bytes: Vec<u8> = files
                            .get(id)?
                            .map(|g| g.value().to_vec())
                            .ok_or(StoreError::NotFound)?;
                        let mut record: FileRecord = decode(&bytes)?;
                        record.filename = new_filename.to_owned();
                        files.insert(id, encode(&record)?.as_slice())?;
                        index.remove((account_id, filename, filepath))?;
                        index.insert((account_id, new_filename, filepath), id)?;
                        Ok(record)
                    }
                }
            }
        };
        match result {
            Ok(record) => {
                txn.commit()?;
                Ok(record)
            }
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
        }
    }

    fn delete_file(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        let result = {
            let mut index = txn.open_table(FILE_INDEX)?;
            let id = index
                .get((account_id, filename, filepath))?
                .map(|g| g.value());
            match id {
                None => Err(StoreError::NotFound),
                Some(id) => {
                    let mut files = txn.open_table(FILES)?;
                    let bytes: Vec<u8> = files
                        .get(id)?
                        .map(|g| g.value().to_vec())
                        .ok_or(StoreError::NotFound)?;
                    let mut record: FileRecord = decode(&bytes)?;
                    record.deleted = true;
                    files.insert(id, encode(&record)?.as_slice())?;
                    index.remove((account_id, filename, filepath))?;
                    Ok(())
                }
            }
        };
        match result {
            Ok(()) => {
                txn.commit()?;
                Ok(())
            }
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
        }
    }

    fn get_deleted_files(&self) -> Result<Vec<DeletedFile>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let files = read_txn.open_table(FILES)?;
        let names = read_txn.open_table(ACCOUNT_NAMES)?;

        let mut deleted = Vec::new();
        for item in files.iter()? {
            let (_k, v) = item?;
            let record: FileRecord = decode(v.value())?;
            if !record.deleted {
                continue;
            }
            let username = match names.get(record.account_id)? {
                Some(g) => g.value().to_owned(),
                None => continue,
            };
            deleted.push(DeletedFile {
                id: record.id,
                filename: record.filename,
                filepath: record.filepath,
                username,
            });
        }
        Ok(deleted)
    }

    fn delete_file_by_id(&self, id: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        let result = {
            let mut files = txn.open_table(FILES)?;
            let removed: Option<Vec<u8>> = files.remove(id)?.map(|g| g.value().to_vec());
            match removed {
                None => Err(StoreError::NotFound),
                Some(bytes) => {
                    let record: FileRecord = decode(&bytes)?;
                    if !record.deleted {
                        let mut index = txn.open_table(FILE_INDEX)?;
                        index.remove((
                            record.account_id,
                            record.filename.as_str(),
                            record.filepath.as_str(),
                        ))?;
                    }
                    Ok(())
                }
            }
        };
        match result {
            Ok(()) => {
                txn.commit()?;
                Ok(())
            }
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
        }
    }

    fn upsert_file_metadata(
        &self,
        file_id: u64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FILE_META)?;
            table.insert((file_id, key), value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn list_file_metadata(&self, file_id: u64) -> Result<Vec<MetadataPair>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FILE_META)?;

        let mut pairs = Vec::new();
        for item in table.range((file_id, "")..)? {
            let (k, v) = item?;
            let (owner, key) = k.value();
            if owner != file_id {
                break;
            }
            pairs.push(MetadataPair {
                key: key.to_owned(),
                value: v.value().to_owned(),
            });
        }
        Ok(pairs)
    }

    fn delete_file_metadata(&self, file_id: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FILE_META)?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for item in table.range((file_id, "")..)? {
                    let (k, _v) = item?;
                    let (owner, key) = k.value();
                    if owner != file_id {
                        break;
                    }
                    keys.push(key.to_owned());
                }
                keys
            };
            for key in &keys {
                table.remove((file_id, key.as_str()))?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = RedbStore::open(&path).unwrap();
        (store, dir)
    }

    fn make_account(store: &RedbStore, username: &str) -> Account {
        store
            .create_account(CreateAccountParams {
                username: username.into(),
                password_hash: "$argon2id$stub".into(),
            })
            .unwrap()
    }

    fn file_params(account_id: u64, filename: &str, filepath: &str) -> CreateFileParams {
        CreateFileParams {
            account_id,
            filename: filename.into(),
            filepath: filepath.into(),
        }
    }

    const COMMIT: TxOutcome = TxOutcome::Commit { filesize: 42 };

    /// Run a create through the two-phase protocol, resolving it with `outcome`.
    fn create_resolved(
        store: &RedbStore,
        params: CreateFileParams,
        outcome: TxOutcome,
    ) -> Result<FileRecord, StoreError> {
        let (tx, rx) = oneshot::channel();
        let store = store.clone();
        let handle = std::thread::spawn(move || store.create_file_tx(params, rx));
        tx.send(outcome).unwrap();
        handle.join().unwrap()
    }

    #[test]
    fn account_create_get_and_duplicate() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");
        assert_eq!(acc.id, 1);
        assert!(!acc.blocked);

        let found = s.get_account("alice").unwrap();
        assert_eq!(found.username, "alice");
        assert_eq!(found.password_hash, "$argon2id$stub");

        let err = s
            .create_account(CreateAccountParams {
                username: "alice".into(),
                password_hash: "other".into(),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));

        assert!(matches!(
            s.get_account("bob").unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[test]
    fn secret_crud() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");

        let secret = s
            .create_secret(CreateSecretParams {
                account_id: acc.id,
                key: "db_password".into(),
                ciphertext: "sealed-1".into(),
            })
            .unwrap();
        assert_eq!(secret.key, "db_password");

        let err = s
            .create_secret(CreateSecretParams {
                account_id: acc.id,
                key: "db_password".into(),
                ciphertext: "sealed-2".into(),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));

        // Same key under another account is fine.
        let bob = make_account(&s, "bob");
        s.create_secret(CreateSecretParams {
            account_id: bob.id,
            key: "db_password".into(),
            ciphertext: "sealed-3".into(),
        })
        .unwrap();

        let got = s.get_secret(acc.id, "db_password").unwrap();
        assert_eq!(got.ciphertext, "sealed-1");

        let updated = s.update_secret(acc.id, "db_password", "sealed-4").unwrap();
        assert_eq!(updated.ciphertext, "sealed-4");
        assert_eq!(updated.id, secret.id);

        assert_eq!(s.list_secrets(acc.id).unwrap().len(), 1);
        assert_eq!(s.list_secrets(bob.id).unwrap().len(), 1);

        s.delete_secret(acc.id, "db_password").unwrap();
        assert!(matches!(
            s.get_secret(acc.id, "db_password").unwrap_err(),
            StoreError::NotFound
        ));
        assert!(matches!(
            s.delete_secret(acc.id, "db_password").unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[test]
    fn secret_metadata_upsert_list_delete() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");
        let secret = s
            .create_secret(CreateSecretParams {
                account_id: acc.id,
                key: "k".into(),
                ciphertext: "c".into(),
            })
            .unwrap();

        s.upsert_secret_metadata(secret.id, "env", "prod").unwrap();
        s.upsert_secret_metadata(secret.id, "team", "core").unwrap();
        s.upsert_secret_metadata(secret.id, "env", "staging").unwrap();

        let pairs = s.list_secret_metadata(secret.id).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&MetadataPair {
            key: "env".into(),
            value: "staging".into(),
        }));

        s.delete_secret_metadata(secret.id).unwrap();
        assert!(s.list_secret_metadata(secret.id).unwrap().is_empty());
    }

    #[test]
    fn file_create_commit_makes_row_visible() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");

        let record =
            create_resolved(&s, file_params(acc.id, "notes.txt", "docs"), COMMIT)
                .unwrap();
        assert_eq!(record.filesize, 42);
        assert!(!record.deleted);

        let found = s.get_file(acc.id, "notes.txt", "docs").unwrap();
        assert_eq!(found.id, record.id);
    }

    #[test]
    fn file_create_rollback_leaves_no_row() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");

        let err = create_resolved(
            &s,
            file_params(acc.id, "notes.txt", "docs"),
            TxOutcome::Rollback,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::RolledBack));
        assert!(matches!(
            s.get_file(acc.id, "notes.txt", "docs").unwrap_err(),
            StoreError::NotFound
        ));

        // The triple is free again.
        create_resolved(&s, file_params(acc.id, "notes.txt", "docs"), COMMIT).unwrap();
    }

    #[test]
    fn file_create_dropped_sender_rolls_back() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");

        let (tx, rx) = oneshot::channel::<TxOutcome>();
        drop(tx);
        let err = s
            .create_file_tx(file_params(acc.id, "a.bin", "x"), rx)
            .unwrap_err();
        assert!(matches!(err, StoreError::RolledBack));
        assert!(matches!(
            s.get_file(acc.id, "a.bin", "x").unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[test]
    fn file_create_duplicate_fails_before_waiting() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");
        create_resolved(&s, file_params(acc.id, "a.bin", "x"), COMMIT).unwrap();

        // Never send on the channel: a duplicate must fail without blocking.
        let (_tx, rx) = oneshot::channel::<TxOutcome>();
        let err = s
            .create_file_tx(file_params(acc.id, "a.bin", "x"), rx)
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[test]
    fn concurrent_duplicate_creates_resolve_to_one_winner() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let s1 = s.clone();
        let s2 = s.clone();
        let p1 = file_params(acc.id, "f", "p");
        let p2 = file_params(acc.id, "f", "p");
        let h1 = std::thread::spawn(move || s1.create_file_tx(p1, rx1));
        let h2 = std::thread::spawn(move || s2.create_file_tx(p2, rx2));

        // Whichever task got the write transaction first is parked on its
        // handoff; the other is queued behind it. Resolve both.
        tx1.send(COMMIT).ok();
        tx2.send(COMMIT).ok();
        let r1 = h1.join().unwrap();
        let r2 = h2.join().unwrap();

        let oks = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
        assert_eq!(oks, 1);
        assert!([r1, r2]
            .into_iter()
            .any(|r| matches!(r, Err(StoreError::AlreadyExists))));
    }

    #[test]
    fn soft_delete_hides_row_and_feeds_gc() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");
        let record =
            create_resolved(&s, file_params(acc.id, "notes.txt", "docs"), COMMIT)
                .unwrap();

        s.delete_file(acc.id, "notes.txt", "docs").unwrap();

        assert!(matches!(
            s.get_file(acc.id, "notes.txt", "docs").unwrap_err(),
            StoreError::NotFound
        ));
        assert!(s.list_files(acc.id).unwrap().is_empty());
        assert!(matches!(
            s.delete_file(acc.id, "notes.txt", "docs").unwrap_err(),
            StoreError::NotFound
        ));

        let deleted = s.get_deleted_files().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, record.id);
        assert_eq!(deleted[0].username, "alice");

        // The triple can be reused while the tombstone waits for the GC.
        create_resolved(&s, file_params(acc.id, "notes.txt", "docs"), COMMIT).unwrap();

        s.delete_file_by_id(record.id).unwrap();
        assert!(s.get_deleted_files().unwrap().is_empty());
        // The re-created live row is untouched.
        s.get_file(acc.id, "notes.txt", "docs").unwrap();
    }

    #[test]
    fn update_file_name_moves_index() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");
        create_resolved(&s, file_params(acc.id, "old.txt", "docs"), COMMIT).unwrap();
        create_resolved(&s, file_params(acc.id, "taken.txt", "docs"), COMMIT).unwrap();

        let err = s
            .update_file_name(acc.id, "old.txt", "docs", "taken.txt")
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));

        let renamed = s
            .update_file_name(acc.id, "old.txt", "docs", "new.txt")
            .unwrap();
        assert_eq!(renamed.filename, "new.txt");
        assert!(matches!(
            s.get_file(acc.id, "old.txt", "docs").unwrap_err(),
            StoreError::NotFound
        ));
        s.get_file(acc.id, "new.txt", "docs").unwrap();

        assert!(matches!(
            s.update_file_name(acc.id, "ghost.txt", "docs", "x.txt")
                .unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[test]
    fn file_metadata_roundtrip() {
        let (s, _dir) = make_store();
        let acc = make_account(&s, "alice");
        let record =
            create_resolved(&s, file_params(acc.id, "a.bin", "x"), COMMIT).unwrap();

        s.upsert_file_metadata(record.id, "mime", "text/plain").unwrap();
        s.upsert_file_metadata(record.id, "mime", "application/json")
            .unwrap();
        let pairs = s.list_file_metadata(record.id).unwrap();
        assert_eq!(
            pairs,
            vec![MetadataPair {
                key: "mime".into(),
                value: "application/json".into(),
            }]
        );

        s.delete_file_metadata(record.id).unwrap();
        assert!(s.list_file_metadata(record.id).unwrap().is_empty());
    }
}
