use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use super::model::{
    Account, CreateAccountParams, CreateFileParams, CreateSecretParams, DeletedFile, FileRecord,
    MetadataPair, SecretRecord,
};
use super::{AccountStore, Store, StoreError, TxOutcome};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Account store for running without a database backend. One reader/writer
/// lock; every value crossing the boundary is cloned on both store and
/// retrieve so callers can never alias internal state.
#[derive(Default)]
pub struct InMemoryAccountStore {
    inner: RwLock<AccountsInner>,
}

#[derive(Default)]
struct AccountsInner {
    accounts: HashMap<String, Account>,
    seq: u64,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn create_account(&self, params: CreateAccountParams) -> Result<Account, StoreError> {
        let mut inner = self.inner.write().expect("account store lock poisoned");
        if inner.accounts.contains_key(&params.username) {
            return Err(StoreError::AlreadyExists);
        }
        inner.seq += 1;
        let account = Account {
            id: inner.seq,
            username: params.username,
            password_hash: params.password_hash,
            blocked: false,
        };
        inner
            .accounts
            .insert(account.username.clone(), account.clone());
        Ok(account)
    }

    fn get_account(&self, username: &str) -> Result<Account, StoreError> {
        let inner = self.inner.read().expect("account store lock poisoned");
        inner
            .accounts
            .get(username)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

/// In-memory [`Store`] double mirroring [`super::RedbStore`] semantics,
/// including the two-phase create: a pending reservation holds the
/// `(account, filename, filepath)` triple while the caller's content write is
/// in flight, without making any row visible.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    secrets: HashMap<(u64, String), SecretRecord>,
    secret_meta: HashMap<u64, BTreeMap<String, String>>,
    files: HashMap<u64, FileRecord>,
    file_meta: HashMap<u64, BTreeMap<String, String>>,
    pending: HashSet<(u64, String, String)>,
    account_seq: u64,
    secret_seq: u64,
    file_seq: u64,
}

impl Inner {
    fn live_file(&self, account_id: u64, filename: &str, filepath: &str) -> Option<&FileRecord> {
        self.files.values().find(|f| {
            f.account_id == account_id
                && f.filename == filename
                && f.filepath == filepath
                && !f.deleted
        })
    }

    fn triple_taken(&self, account_id: u64, filename: &str, filepath: &str) -> bool {
        self.live_file(account_id, filename, filepath).is_some()
            || self
                .pending
                .contains(&(account_id, filename.to_owned(), filepath.to_owned()))
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("store lock poisoned")
    }
}

impl AccountStore for MemStore {
    fn create_account(&self, params: CreateAccountParams) -> Result<Account, StoreError> {
        let mut inner = self.write();
        if inner.accounts.contains_key(&params.username) {
            return Err(StoreError::AlreadyExists);
        }
        inner.account_seq += 1;
        let account = Account {
            id: inner.account_seq,
            username: params.username,
            password_hash: params.password_hash,
            blocked: false,
        };
        inner
            .accounts
            .insert(account.username.clone(), account.clone());
        Ok(account)
    }

    fn get_account(&self, username: &str) -> Result<Account, StoreError> {
        self.read()
            .accounts
            .get(username)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

impl Store for MemStore {
    fn create_secret(&self, params: CreateSecretParams) -> Result<SecretRecord, StoreError> {
        let mut inner = self.write();
        let slot = (params.account_id, params.key.clone());
        if inner.secrets.contains_key(&slot) {
            return Err(StoreError::AlreadyExists);
        }
        inner.secret_seq += 1;
        let record = SecretRecord {
            id: inner.secret_seq,
            account_id: params.account_id,
            key: params.key,
            ciphertext: params.ciphertext,
            created_at: now(),
        };
        inner.secrets.insert(slot, record.clone());
        Ok(record)
    }

    fn get_secret(&self, account_id: u64, key: &str) -> Result<SecretRecord, StoreError> {
        self.read()
            .secrets
            .get(&(account_id, key.to_owned()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn list_secrets(&self, account_id: u64) -> Result<Vec<SecretRecord>, StoreError> {
        let inner = self.read();
        let mut records: Vec<SecretRecord> = inner
            .secrets
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    fn update_secret(
        &self,
        account_id: u64,
        key: &str,
        ciphertext: &str,
    ) -> Result<SecretRecord, StoreError> {
        let mut inner = self.write();
        let record = inner
            .secrets
            .get_mut(&(account_id, key.to_owned()))
            .ok_or(StoreError::NotFound)?;
        record.ciphertext = ciphertext.to_owned();
        Ok(record.clone())
    }

    fn delete_secret(&self, account_id: u64, key: &str) -> Result<(), StoreError> {
        self.write()
            .secrets
            .remove(&(account_id, key.to_owned()))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn upsert_secret_metadata(
        &self,
        secret_id: u64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.write()
            .secret_meta
            .entry(secret_id)
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn list_secret_metadata(&self, secret_id: u64) -> Result<Vec<MetadataPair>, StoreError> {
        Ok(self
            .read()
            .secret_meta
            .get(&secret_id)
            .map(|m| {
                m.iter()
                    .map(|(k, v)| MetadataPair {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_secret_metadata(&self, secret_id: u64) -> Result<(), StoreError> {
        self.write().secret_meta.remove(&secret_id);
        Ok(())
    }

    fn create_file_tx(
        &self,
        params: CreateFileParams,
        outcome: oneshot::Receiver<TxOutcome>,
    ) -> Result<FileRecord, StoreError> {
        let triple = (
            params.account_id,
            params.filename.clone(),
            params.filepath.clone(),
        );
        let record = {
            let mut inner = self.write();
            if inner.triple_taken(params.account_id, &params.filename, &params.filepath) {
                return Err(StoreError::AlreadyExists);
            }
            inner.file_seq += 1;
            inner.pending.insert(triple.clone());
            FileRecord {
                id: inner.file_seq,
                account_id: params.account_id,
                filename: params.filename,
                filepath: params.filepath,
                filesize: 0,
                deleted: false,
                created_at: now(),
            }
        };

        // Lock released: readers proceed, the reservation holds the triple.
        let resolution = outcome.blocking_recv();

        let mut inner = self.write();
        inner.pending.remove(&triple);
        match resolution {
            Ok(TxOutcome::Commit { filesize }) => {
                let mut record = record;
                record.filesize = filesize;
                inner.files.insert(record.id, record.clone());
                Ok(record)
            }
            Ok(TxOutcome::Rollback) | Err(_) => Err(StoreError::RolledBack),
        }
    }

    fn get_file(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
    ) -> Result<FileRecord, StoreError> {
        self.read()
            .live_file(account_id, filename, filepath)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn list_files(&self, account_id: u64) -> Result<Vec<FileRecord>, StoreError> {
        let inner = self.read();
        let mut records: Vec<FileRecord> = inner
            .files
            .values()
            .filter(|f| f.account_id == account_id && !f.deleted)
            .cloned()
            .collect();
        records.sort_by_key(|f| f.id);
        Ok(records)
    }

    fn update_file_name(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
        new_filename: &str,
    ) -> Result<FileRecord, StoreError> {
        let mut inner = self.write();
        let id = inner
            .live_file(account_id, filename, filepath)
            .map(|f| f.id)
            .ok_or(StoreError::NotFound)?;
        if inner.triple_taken(account_id, new_filename, filepath) {
            return Err(StoreError::AlreadyExists);
        }
        let record = inner.files.get_mut(&id).ok_or(StoreError::NotFound)?;
        record.filename = new_filename.to_owned();
        Ok(record.clone())
    }

    fn delete_file(
        &self,
        account_id: u64,
        filename: &str,
        filepath: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.write();
        let id = inner
            .live_file(account_id, filename, filepath)
            .map(|f| f.id)
            .ok_or(StoreError::NotFound)?;
        inner
            .files
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?
            .deleted = true;
        Ok(())
    }

    fn get_deleted_files(&self) -> Result<Vec<DeletedFile>, StoreError> {
        let inner = self.read();
        let mut deleted = Vec::new();
        for record in inner.files.values().filter(|f| f.deleted) {
            let username = match inner
                .accounts
                .values()
                .find(|a| a.id == record.account_id)
            {
                Some(a) => a.username.clone(),
                None => continue,
            };
            deleted.push(DeletedFile {
                id: record.id,
                filename: record.filename.clone(),
                filepath: record.filepath.clone(),
                username,
            });
        }
        deleted.sort_by_key(|f| f.id);
        Ok(deleted)
    }

    fn delete_file_by_id(&self, id: u64) -> Result<(), StoreError> {
        self.write()
            .files
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn upsert_file_metadata(
        &self,
        file_id: u64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.write()
            .file_meta
            .entry(file_id)
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn list_file_metadata(&self, file_id: u64) -> Result<Vec<MetadataPair>, StoreError> {
        Ok(self
            .read()
            .file_meta
            .get(&file_id)
            .map(|m| {
                m.iter()
                    .map(|(k, v)| MetadataPair {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_file_metadata(&self, file_id: u64) -> Result<(), StoreError> {
        self.write().file_meta.remove(&file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_values_are_copied_at_the_boundary() {
        let store = InMemoryAccountStore::new();
        let mut created = store
            .create_account(CreateAccountParams {
                username: "alice".into(),
                password_hash: "h1".into(),
            })
            .unwrap();

        // Mutating the returned copy must not reach the stored account.
        created.password_hash = "tampered".into();
        assert_eq!(store.get_account("alice").unwrap().password_hash, "h1");

        assert!(matches!(
            store
                .create_account(CreateAccountParams {
                    username: "alice".into(),
                    password_hash: "h2".into(),
                })
                .unwrap_err(),
            StoreError::AlreadyExists
        ));
    }

    #[test]
    fn pending_reservation_blocks_duplicates_without_exposing_a_row() {
        let store = std::sync::Arc::new(MemStore::new());
        let acc = store
            .create_account(CreateAccountParams {
                username: "alice".into(),
                password_hash: "h".into(),
            })
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let s = store.clone();
        let params = CreateFileParams {
            account_id: acc.id,
            filename: "a.bin".into(),
            filepath: "x".into(),
        };
        let pending_params = params.clone();
        let handle = std::thread::spawn(move || s.create_file_tx(pending_params, rx));

        // Wait until the reservation is in place.
        while store.read().pending.is_empty() {
            std::thread::yield_now();
        }

        // Invisible to readers, but the triple is taken.
        assert!(matches!(
            store.get_file(acc.id, "a.bin", "x").unwrap_err(),
            StoreError::NotFound
        ));
        let (_tx2, rx2) = oneshot::channel();
        assert!(matches!(
            store.create_file_tx(params, rx2).unwrap_err(),
            StoreError::AlreadyExists
        ));

        tx.send(TxOutcome::Commit { filesize: 1 }).unwrap();
        handle.join().unwrap().unwrap();
        store.get_file(acc.id, "a.bin", "x").unwrap();
    }

    #[test]
    fn rollback_releases_the_reservation() {
        let store = std::sync::Arc::new(MemStore::new());
        let acc = store
            .create_account(CreateAccountParams {
                username: "alice".into(),
                password_hash: "h".into(),
            })
            .unwrap();
        let params = CreateFileParams {
            account_id: acc.id,
            filename: "a.bin".into(),
            filepath: "x".into(),
        };

        let (tx, rx) = oneshot::channel();
        let s = store.clone();
        let p = params.clone();
        let handle = std::thread::spawn(move || s.create_file_tx(p, rx));
        tx.send(TxOutcome::Rollback).unwrap();
        assert!(matches!(
            handle.join().unwrap().unwrap_err(),
            StoreError::RolledBack
        ));

        // Triple free again.
        let (tx2, rx2) = oneshot::channel();
        let s = store.clone();
        let p = params.clone();
        let handle = std::thread::spawn(move || s.create_file_tx(p, rx2));
        tx2.send(TxOutcome::Commit { filesize: 1 }).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn tombstone_flow_matches_production_store() {
        let store = std::sync::Arc::new(MemStore::new());
        let acc = store
            .create_account(CreateAccountParams {
                username: "alice".into(),
                password_hash: "h".into(),
            })
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let s = store.clone();
        let handle = std::thread::spawn(move || {
            s.create_file_tx(
                CreateFileParams {
                    account_id: 1,
                    filename: "a.bin".into(),
                    filepath: "x".into(),
                },
                rx,
            )
        });
        tx.send(TxOutcome::Commit { filesize: 1 }).unwrap();
        let record = handle.join().unwrap().unwrap();

        store.delete_file(acc.id, "a.bin", "x").unwrap();
        assert!(store.list_files(acc.id).unwrap().is_empty());
        let deleted = store.get_deleted_files().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].username, "alice");

        store.delete_file_by_id(record.id).unwrap();
        assert!(store.get_deleted_files().unwrap().is_empty());
    }
}
