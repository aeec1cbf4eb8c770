pub mod auth;
pub mod content;
pub mod crypto;
pub mod dirs;
pub mod file;
pub mod gc;
pub mod identity;
pub mod secret;
pub mod server;
pub mod store;
pub mod token;

/// Generated wire types for the `lockbox.v1` protobuf package.
pub mod pb {
    tonic::include_proto!("lockbox.v1");
}

use tonic::metadata::MetadataMap;
use tonic::Status;

use store::{Account, Store, StoreError};

pub use server::{resolve_data_dir, run, ServerConfig};

/// Log a classified error at the service boundary before it is returned.
/// Logging never changes the status handed to the caller.
pub fn log_status(status: Status) -> Status {
    tracing::error!(code = ?status.code(), message = status.message(), "request failed");
    status
}

/// Resolve the acting account from the identity entry injected by
/// [`auth::AuthMiddleware`]. An absent entry means the call reached a handler
/// without passing the gate, which the protected set rules out.
pub fn account_from_metadata(store: &dyn Store, metadata: &MetadataMap) -> Result<Account, Status> {
    let username = metadata
        .get(auth::USERNAME_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| log_status(Status::internal("identity metadata is missing")))?;

    store.get_account(username).map_err(|e| {
        log_status(match e {
            StoreError::NotFound => Status::not_found("cannot find account"),
            other => Status::internal(format!("cannot find account: {other}")),
        })
    })
}
