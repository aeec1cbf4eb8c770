use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use crate::auth::{protected_methods, AuthGate, AuthLayer};
use crate::content::DiskContentStore;
use crate::crypto::CryptoService;
use crate::file::FileService;
use crate::gc;
use crate::identity::AuthService;
use crate::pb::authentication_server::AuthenticationServer;
use crate::pb::file_server::FileServer;
use crate::pb::secret_server::SecretServer;
use crate::secret::SecretService;
use crate::store::RedbStore;
use crate::token::TokenManager;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Symmetric server secret. Signs access tokens and salts the
    /// master-key derivation, so changing it invalidates both.
    pub secret: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub token_lifetime: Duration,
    /// Upload cap in bytes, enforced while chunks are received.
    pub max_file_size: u64,
    pub gc_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("LOCKBOX_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("LOCKBOX_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(50051),
            secret: std::env::var("LOCKBOX_SECRET").ok(),
            data_dir: std::env::var("LOCKBOX_DATA_DIR").ok().map(PathBuf::from),
            token_lifetime: env_secs("LOCKBOX_TOKEN_LIFETIME_SECS", 3600),
            max_file_size: std::env::var("LOCKBOX_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
            gc_interval: env_secs("LOCKBOX_GC_INTERVAL_SECS", 300),
        }
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

/// Resolve the data directory, creating it if needed. Public so the CLI can
/// reuse the resolution logic.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let secret = cfg
        .secret
        .context("LOCKBOX_SECRET environment variable is required")?;

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = Arc::new(RedbStore::open(&data_dir.join("lockbox.db")).context("open store")?);
    let content =
        Arc::new(DiskContentStore::new(data_dir.join("content")).context("open content store")?);

    let tokens = Arc::new(TokenManager::new(&secret, cfg.token_lifetime));
    let crypto = Arc::new(CryptoService::new(&secret));

    // One cancellation signal covers the transport and the sweep.
    let shutdown = CancellationToken::new();
    let sweep = gc::spawn_sweep(
        store.clone(),
        content.clone(),
        cfg.gc_interval,
        shutdown.clone(),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let auth = AuthService::new(store.clone(), tokens.clone());
    let secrets = SecretService::new(store.clone(), crypto);
    let files = FileService::new(store.clone(), content, cfg.max_file_size);

    let gate = AuthGate::new(tokens, protected_methods());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    info!(%addr, "lockbox server listening");

    let served = Server::builder()
        .layer(AuthLayer::new(gate))
        .add_service(AuthenticationServer::new(auth))
        .add_service(SecretServer::new(secrets))
        .add_service(FileServer::new(files))
        .serve_with_shutdown(addr, shutdown.clone().cancelled_owned())
        .await;

    // The transport is down; the sweep exits on the same signal.
    shutdown.cancel();
    sweep.await.context("join sweep task")?;
    served.context("server error")
}
