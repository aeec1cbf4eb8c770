use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::Request;
use tracing_subscriber::EnvFilter;

use lockbox_server::pb::authentication_client::AuthenticationClient;
use lockbox_server::pb::file_client::FileClient;
use lockbox_server::pb::secret_client::SecretClient;
use lockbox_server::pb::{
    create_file_request, CreateFileRequest, CreateSecretRequest, DeleteFileRequest,
    DeleteSecretRequest, DownloadFileRequest, FileInfo, GetSecretRequest, ListFilesRequest,
    ListSecretRequest, LoginRequest, Metadata, RegisterRequest, SecretData, UpdateFileNameRequest,
    UpdateSecretRequest,
};

const UPLOAD_CHUNK_SIZE: usize = 1024;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "lockbox", about = "Lockbox — multi-tenant secrets-and-files vault", version)]
struct Cli {
    /// Lockbox server URL (default: http://localhost:50051 or $LOCKBOX_SERVER)
    #[arg(long, env = "LOCKBOX_SERVER", default_value = "http://localhost:50051")]
    server: String,

    /// Bearer token from `register`/`login` ($LOCKBOX_TOKEN)
    #[arg(long, env = "LOCKBOX_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the lockbox gRPC server
    Serve {
        /// Host to bind (default: $LOCKBOX_HOST or 0.0.0.0)
        #[arg(long, env = "LOCKBOX_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on (default: $LOCKBOX_PORT or 50051)
        #[arg(long, env = "LOCKBOX_PORT", default_value = "50051")]
        port: u16,
        /// Data directory (default: $LOCKBOX_DATA_DIR or the platform dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Create an account and print a fresh token
    Register {
        login: String,
        password: String,
    },
    /// Log in and print a fresh token
    Login {
        login: String,
        password: String,
    },
    /// Key/value secrets of the calling account
    #[command(subcommand)]
    Secret(SecretCommands),
    /// Files of the calling account
    #[command(subcommand)]
    File(FileCommands),
}

#[derive(Subcommand)]
enum SecretCommands {
    /// Store a value under KEY, sealed with the master key
    Put {
        key: String,
        value: String,
        /// Master key the value is sealed under ($LOCKBOX_MASTER_KEY)
        #[arg(long, env = "LOCKBOX_MASTER_KEY")]
        masterkey: String,
        /// Metadata pairs, e.g. --meta env=prod
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },
    /// Print the plaintext value of KEY
    Get {
        key: String,
        #[arg(long, env = "LOCKBOX_MASTER_KEY")]
        masterkey: String,
    },
    /// List all secrets with their values
    List {
        #[arg(long, env = "LOCKBOX_MASTER_KEY")]
        masterkey: String,
    },
    /// Re-encrypt KEY with a new value (and possibly a new master key)
    Set {
        key: String,
        value: String,
        #[arg(long, env = "LOCKBOX_MASTER_KEY")]
        masterkey: String,
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },
    /// Delete KEY and its metadata
    Rm {
        key: String,
    },
}

#[derive(Subcommand)]
enum FileCommands {
    /// Upload a local file
    Push {
        /// Local file to upload
        path: PathBuf,
        /// Remote directory inside the account namespace
        #[arg(long, default_value = "")]
        dir: String,
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },
    /// Download a file
    Pull {
        filename: String,
        #[arg(long, default_value = "")]
        dir: String,
        /// Local path to write (default: the remote filename)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List stored files
    Ls,
    /// Soft-delete a file
    Rm {
        filename: String,
        #[arg(long, default_value = "")]
        dir: String,
    },
    /// Rename a file
    Mv {
        filename: String,
        new_filename: String,
        #[arg(long, default_value = "")]
        dir: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOCKBOX_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            data_dir,
        } => {
            let cfg = lockbox_server::ServerConfig {
                host,
                port,
                data_dir: data_dir.or_else(|| {
                    std::env::var("LOCKBOX_DATA_DIR").ok().map(Into::into)
                }),
                ..Default::default()
            };
            lockbox_server::run(cfg).await
        }

        Commands::Register { login, password } => cmd_register(&cli.server, login, password).await,
        Commands::Login { login, password } => cmd_login(&cli.server, login, password).await,

        Commands::Secret(command) => {
            let token = require_token(&cli.token)?;
            cmd_secret(&cli.server, &token, command).await
        }
        Commands::File(command) => {
            let token = require_token(&cli.token)?;
            cmd_file(&cli.server, &token, command).await
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("a token is required: pass --token or set LOCKBOX_TOKEN (see `lockbox login`)")
}

async fn connect(server: &str) -> Result<Channel> {
    Channel::from_shared(server.to_owned())
        .context("invalid server URL")?
        .connect()
        .await
        .with_context(|| format!("connect to {server}"))
}

/// Wrap `message` in a request carrying the bearer token.
fn authed<T>(message: T, token: &str) -> Result<Request<T>> {
    let mut request = Request::new(message);
    let value: MetadataValue<_> = token.parse().context("token is not metadata-safe")?;
    request.metadata_mut().insert("authorization", value);
    Ok(request)
}

fn parse_metadata(pairs: &[String]) -> Result<Vec<Metadata>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("expected KEY=VALUE metadata, got {pair:?}"))?;
            Ok(Metadata {
                key: key.to_owned(),
                value: value.to_owned(),
            })
        })
        .collect()
}

fn print_file_info(info: &FileInfo) {
    let path = if info.filepath.is_empty() {
        info.filename.clone()
    } else {
        format!("{}/{}", info.filepath, info.filename)
    };
    println!("{path}\t{} bytes", info.size);
    for md in &info.metadata {
        println!("  {} = {}", md.key, md.value);
    }
}

// ── Identity commands ─────────────────────────────────────────────────────────

async fn cmd_register(server: &str, login: String, password: String) -> Result<()> {
    let mut client = AuthenticationClient::new(connect(server).await?);
    let resp = client
        .register(RegisterRequest { login, password })
        .await?
        .into_inner();
    println!("✓ registered {}", resp.login);
    println!("{}", resp.token);
    println!("expires at {}", resp.token_expires_at);
    Ok(())
}

async fn cmd_login(server: &str, login: String, password: String) -> Result<()> {
    let mut client = AuthenticationClient::new(connect(server).await?);
    let resp = client
        .login(LoginRequest { login, password })
        .await?
        .into_inner();
    println!("{}", resp.token);
    println!("expires at {}", resp.token_expires_at);
    Ok(())
}

// ── Secret commands ───────────────────────────────────────────────────────────

async fn cmd_secret(server: &str, token: &str, command: SecretCommands) -> Result<()> {
    let mut client = SecretClient::new(connect(server).await?);

    match command {
        SecretCommands::Put {
            key,
            value,
            masterkey,
            metadata,
        } => {
            let request = CreateSecretRequest {
                data: Some(SecretData {
                    key: key.clone(),
                    value,
                    masterkey,
                    metadata: parse_metadata(&metadata)?,
                }),
            };
            client.create_secret(authed(request, token)?).await?;
            println!("✓ stored {key}");
        }
        SecretCommands::Get { key, masterkey } => {
            let resp = client
                .get_secret(authed(GetSecretRequest { key, masterkey }, token)?)
                .await?
                .into_inner();
            if let Some(data) = resp.data {
                println!("{}", data.value);
            }
        }
        SecretCommands::List { masterkey } => {
            let resp = client
                .list_secret(authed(ListSecretRequest { masterkey }, token)?)
                .await?
                .into_inner();
            for secret in resp.data {
                println!("{}={}", secret.key, secret.value);
            }
        }
        SecretCommands::Set {
            key,
            value,
            masterkey,
            metadata,
        } => {
            let request = UpdateSecretRequest {
                data: Some(SecretData {
                    key: key.clone(),
                    value,
                    masterkey,
                    metadata: parse_metadata(&metadata)?,
                }),
            };
            client.update_secret(authed(request, token)?).await?;
            println!("✓ updated {key}");
        }
        SecretCommands::Rm { key } => {
            client
                .delete_secret(authed(DeleteSecretRequest { key: key.clone() }, token)?)
                .await?;
            println!("✓ deleted {key}");
        }
    }
    Ok(())
}

// ── File commands ─────────────────────────────────────────────────────────────

async fn cmd_file(server: &str, token: &str, command: FileCommands) -> Result<()> {
    let mut client = FileClient::new(connect(server).await?);

    match command {
        FileCommands::Push {
            path,
            dir,
            metadata,
        } => {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("no file name in {}", path.display()))?
                .to_owned();
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("read {}", path.display()))?;

            let mut messages = vec![CreateFileRequest {
                data: Some(create_file_request::Data::Info(FileInfo {
                    filename,
                    filepath: dir,
                    size: 0,
                    metadata: parse_metadata(&metadata)?,
                    created_at: 0,
                })),
            }];
            messages.extend(data.chunks(UPLOAD_CHUNK_SIZE).map(|chunk| CreateFileRequest {
                data: Some(create_file_request::Data::Chunk(chunk.to_vec())),
            }));

            let resp = client
                .create_file(authed(tokio_stream::iter(messages), token)?)
                .await?
                .into_inner();
            let info = resp.info.unwrap_or_default();
            println!("✓ pushed {} ({} bytes)", info.filename, info.size);
        }
        FileCommands::Pull { filename, dir, out } => {
            let request = DownloadFileRequest {
                filename: filename.clone(),
                filepath: dir,
            };
            let mut stream = client
                .download_file(authed(request, token)?)
                .await?
                .into_inner();

            let mut data = Vec::new();
            while let Some(message) = stream.message().await? {
                data.extend_from_slice(&message.chunk);
            }

            let target = out.unwrap_or_else(|| PathBuf::from(&filename));
            tokio::fs::write(&target, &data)
                .await
                .with_context(|| format!("write {}", target.display()))?;
            println!("✓ pulled {} ({} bytes)", target.display(), data.len());
        }
        FileCommands::Ls => {
            let resp = client
                .list_files(authed(ListFilesRequest {}, token)?)
                .await?
                .into_inner();
            for info in &resp.info {
                print_file_info(info);
            }
        }
        FileCommands::Rm { filename, dir } => {
            client
                .delete_file(authed(
                    DeleteFileRequest {
                        filename: filename.clone(),
                        filepath: dir,
                    },
                    token,
                )?)
                .await?;
            println!("✓ deleted {filename}");
        }
        FileCommands::Mv {
            filename,
            new_filename,
            dir,
        } => {
            client
                .update_file_name(authed(
                    UpdateFileNameRequest {
                        filename: filename.clone(),
                        filepath: dir,
                        new_filename: new_filename.clone(),
                        metadata: vec![],
                    },
                    token,
                )?)
                .await?;
            println!("✓ renamed {filename} -> {new_filename}");
        }
    }
    Ok(())
}
