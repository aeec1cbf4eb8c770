use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::crypto::{CryptoError, CryptoService};
use crate::pb::secret_server::Secret;
use crate::pb::{
    CreateSecretRequest, CreateSecretResponse, DeleteSecretRequest, DeleteSecretResponse,
    GetSecretRequest, GetSecretResponse, ListSecretRequest, ListSecretResponse, Metadata,
    SecretData, SecretMessage, UpdateSecretRequest, UpdateSecretResponse,
};
use crate::store::{CreateSecretParams, MetadataPair, Store, StoreError};
use crate::{account_from_metadata, log_status};

/// CRUD over encrypted secrets and their metadata for the calling account.
/// Every lookup is parameterized by `(account_id, key)`, so one account can
/// never reach another's secrets.
pub struct SecretService {
    store: Arc<dyn Store>,
    crypto: Arc<CryptoService>,
}

impl SecretService {
    pub fn new(store: Arc<dyn Store>, crypto: Arc<CryptoService>) -> Self {
        Self { store, crypto }
    }

    fn decrypt_status(e: CryptoError) -> Status {
        match e {
            CryptoError::Auth => Status::invalid_argument("masterkey is not correct"),
            other => Status::internal(format!("cannot decrypt the secret: {other}")),
        }
    }

    fn metadata_for(&self, secret_id: u64) -> Result<Vec<Metadata>, Status> {
        let pairs = self.store.list_secret_metadata(secret_id).map_err(|e| {
            log_status(Status::internal(format!(
                "cannot collect secret metadata: {e}"
            )))
        })?;
        Ok(pairs.into_iter().map(to_pb_metadata).collect())
    }

    fn attach_metadata(&self, secret_id: u64, metadata: &[Metadata]) -> Result<(), Status> {
        for md in metadata {
            self.store
                .upsert_secret_metadata(secret_id, &md.key, &md.value)
                .map_err(|e| {
                    log_status(Status::internal(format!(
                        "failed to create secret metadata: {e}"
                    )))
                })?;
        }
        Ok(())
    }
}

fn to_pb_metadata(pair: MetadataPair) -> Metadata {
    Metadata {
        key: pair.key,
        value: pair.value,
    }
}

fn required_data(data: Option<SecretData>) -> Result<SecretData, Status> {
    data.ok_or_else(|| log_status(Status::invalid_argument("secret data is not provided")))
}

#[tonic::async_trait]
impl Secret for SecretService {
    async fn create_secret(
        &self,
        request: Request<CreateSecretRequest>,
    ) -> Result<Response<CreateSecretResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let data = required_data(request.into_inner().data)?;
        info!(username = %account.username, key = %data.key, "create secret request");

        let ciphertext = self
            .crypto
            .encrypt(&data.value, &data.masterkey)
            .map_err(|e| log_status(Status::internal(format!("cannot encrypt the secret: {e}"))))?;

        let record = self
            .store
            .create_secret(CreateSecretParams {
                account_id: account.id,
                key: data.key.clone(),
                ciphertext,
            })
            .map_err(|e| {
                log_status(match e {
                    StoreError::AlreadyExists => Status::already_exists("secret already exists"),
                    other => Status::internal(format!("failed to create secret: {other}")),
                })
            })?;

        self.attach_metadata(record.id, &data.metadata)?;

        Ok(Response::new(CreateSecretResponse {
            data: Some(SecretMessage {
                key: record.key,
                value: data.value,
                metadata: data.metadata,
                created_at: record.created_at,
            }),
        }))
    }

    async fn get_secret(
        &self,
        request: Request<GetSecretRequest>,
    ) -> Result<Response<GetSecretResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let req = request.into_inner();
        info!(username = %account.username, key = %req.key, "get secret request");

        let record = self.store.get_secret(account.id, &req.key).map_err(|e| {
            log_status(match e {
                StoreError::NotFound => Status::not_found("cannot find secret"),
                other => Status::internal(format!("cannot get secret: {other}")),
            })
        })?;

        let value = self
            .crypto
            .decrypt(&record.ciphertext, &req.masterkey)
            .map_err(|e| log_status(Self::decrypt_status(e)))?;

        let metadata = self.metadata_for(record.id)?;
        Ok(Response::new(GetSecretResponse {
            data: Some(SecretMessage {
                key: record.key,
                value,
                metadata,
                created_at: record.created_at,
            }),
        }))
    }

    async fn list_secret(
        &self,
        request: Request<ListSecretRequest>,
    ) -> Result<Response<ListSecretResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let req = request.into_inner();
        info!(username = %account.username, "list secret request");

        let records = self.store.list_secrets(account.id).map_err(|e| {
            log_status(Status::internal(format!("cannot get secrets: {e}")))
        })?;

        // One derivation covers the whole listing.
        let key = self
            .crypto
            .derive_key(&req.masterkey)
            .map_err(|e| log_status(Status::internal(format!("cannot derive key: {e}"))))?;

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            let value = self
                .crypto
                .open(&key, &record.ciphertext)
                .map_err(|e| log_status(Self::decrypt_status(e)))?;
            let metadata = self.metadata_for(record.id)?;
            messages.push(SecretMessage {
                key: record.key,
                value,
                metadata,
                created_at: record.created_at,
            });
        }

        Ok(Response::new(ListSecretResponse { data: messages }))
    }

    async fn update_secret(
        &self,
        request: Request<UpdateSecretRequest>,
    ) -> Result<Response<UpdateSecretResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let data = required_data(request.into_inner().data)?;
        info!(username = %account.username, key = %data.key, "update secret request");

        let ciphertext = self
            .crypto
            .encrypt(&data.value, &data.masterkey)
            .map_err(|e| log_status(Status::internal(format!("cannot encrypt the secret: {e}"))))?;

        let record = self
            .store
            .update_secret(account.id, &data.key, &ciphertext)
            .map_err(|e| {
                log_status(match e {
                    StoreError::NotFound => Status::not_found("cannot find secret"),
                    other => Status::internal(format!("cannot update the secret: {other}")),
                })
            })?;

        self.attach_metadata(record.id, &data.metadata)?;

        Ok(Response::new(UpdateSecretResponse {
            data: Some(SecretMessage {
                key: record.key,
                value: data.value,
                metadata: data.metadata,
                created_at: record.created_at,
            }),
        }))
    }

    async fn delete_secret(
        &self,
        request: Request<DeleteSecretRequest>,
    ) -> Result<Response<DeleteSecretResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let req = request.into_inner();
        info!(username = %account.username, key = %req.key, "delete secret request");

        let record = self.store.get_secret(account.id, &req.key).map_err(|e| {
            log_status(match e {
                StoreError::NotFound => Status::not_found("cannot find secret"),
                other => Status::internal(format!("cannot get secret: {other}")),
            })
        })?;

        // Metadata first: it must never outlive its secret.
        self.store.delete_secret_metadata(record.id).map_err(|e| {
            log_status(Status::internal(format!(
                "cannot delete secret metadata: {e}"
            )))
        })?;
        self.store.delete_secret(account.id, &req.key).map_err(|e| {
            log_status(Status::internal(format!("cannot delete secret: {e}")))
        })?;

        Ok(Response::new(DeleteSecretResponse { key: record.key }))
    }
}
