use std::sync::Arc;

use anyhow::Result;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use tonic::{Request, Response, Status};
use tracing::info;

use crate::log_status;
use crate::pb::authentication_server::Authentication;
use crate::pb::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use crate::store::{CreateAccountParams, Store, StoreError};
use crate::token::TokenManager;

/// Hash a password into an Argon2id PHC string with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Constant-time check of `password` against a stored PHC string.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Register/Login surface. Both methods are open (unlisted in the protected
/// set) and both hand out a fresh bearer token.
pub struct AuthService {
    store: Arc<dyn Store>,
    tokens: Arc<TokenManager>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, tokens: Arc<TokenManager>) -> Self {
        Self { store, tokens }
    }
}

#[tonic::async_trait]
impl Authentication for AuthService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        info!(login = %req.login, "register request");

        if req.login.is_empty() || req.password.is_empty() {
            return Err(log_status(Status::invalid_argument(
                "login and password must not be empty",
            )));
        }

        let password_hash = hash_password(&req.password)
            .map_err(|e| log_status(Status::internal(format!("cannot hash password: {e}"))))?;

        let account = self
            .store
            .create_account(CreateAccountParams {
                username: req.login,
                password_hash,
            })
            .map_err(|e| {
                log_status(match e {
                    StoreError::AlreadyExists => {
                        Status::already_exists("username already exists")
                    }
                    other => Status::internal(format!("failed to create account: {other}")),
                })
            })?;

        let (token, expires_at) = self
            .tokens
            .issue(&account)
            .map_err(|_| log_status(Status::internal("cannot generate access token")))?;

        Ok(Response::new(RegisterResponse {
            login: account.username,
            token,
            token_expires_at: expires_at,
        }))
    }

    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        info!(login = %req.login, "login request");

        let account = self.store.get_account(&req.login).map_err(|e| {
            log_status(match e {
                StoreError::NotFound => Status::not_found("username/password incorrect"),
                other => Status::internal(format!("cannot find account: {other}")),
            })
        })?;

        if !verify_password(&req.password, &account.password_hash) {
            return Err(log_status(Status::not_found("username/password incorrect")));
        }
        if account.blocked {
            return Err(log_status(Status::unauthenticated("account is blocked")));
        }

        let (token, expires_at) = self
            .tokens
            .issue(&account)
            .map_err(|_| log_status(Status::internal("cannot generate access token")))?;

        Ok(Response::new(LoginResponse {
            login: account.username,
            token,
            token_expires_at: expires_at,
        }))
    }
}
