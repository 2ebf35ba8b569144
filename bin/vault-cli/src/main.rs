//! Vault CLI - command line interface to the deterministic vault.

mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vault_common::VaultConfig;
use vault_engine::{Engine, FolderEntry, MetaNode};

use transport::FsServiceFactory;

#[derive(Parser, Debug)]
#[command(name = "vault-cli")]
#[command(about = "Deterministic vault storage CLI")]
#[command(version)]
struct Args {
    /// Directory holding the vault's catalog and (for this CLI's
    /// filesystem transport) blob store.
    #[arg(long, env = "VAULT_BASE_DIR", default_value = "./vault-data")]
    base_dir: PathBuf,

    /// Optional JSON/TOML file overriding `VaultConfig` defaults.
    #[arg(long, env = "VAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Storage code identifying the vault's keyspace (see `init`).
    #[arg(long, env = "VAULT_STORAGE_CODE")]
    storage_code: String,

    /// Vault password.
    #[arg(long, env = "VAULT_PASSWORD")]
    password: String,

    /// Log level, honored unless `RUST_LOG` is set.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Uploads a local file to a remote vault path.
    Upload {
        local_path: PathBuf,
        remote_path: String,
    },
    /// Downloads a remote vault path to a local file.
    Download {
        remote_path: String,
        local_path: PathBuf,
    },
    /// Lists a folder's children, or shows a file's size and block count.
    Ls {
        #[arg(default_value = "/")]
        remote_path: String,
    },
    /// Creates an empty remote directory (and any missing ancestors).
    Mkdir { remote_path: String },
    /// Flushes pending parity, assurance and meta writes to the
    /// transport. Run after one or more uploads/mkdirs to make them
    /// durable and visible to other clients.
    Flush,
}

/// `vault-cli init` has no vault to open yet, so it is handled before
/// `Args::parse()` would otherwise demand `--storage-code`.
fn maybe_handle_init() -> bool {
    let mut raw = std::env::args().skip(1);
    if raw.next().as_deref() != Some("init") {
        return false;
    }
    println!("{}", vault_crypto::kdf::generate_storage_code());
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    if maybe_handle_init() {
        return Ok(());
    }

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_deref())?;

    let blobs_dir = args.base_dir.join("blobs");
    let factory = Arc::new(FsServiceFactory::new(blobs_dir));
    let engine = Engine::open(&args.base_dir, &args.storage_code, &args.password, config, factory)
        .context("opening vault")?;

    info!(public_hash = %engine.public_hash(), "vault opened");
    engine.load().await.context("loading assurance log")?;

    match args.command {
        Commands::Upload { local_path, remote_path } => {
            engine
                .upload_file(&local_path, &remote_path)
                .await
                .with_context(|| format!("uploading {} to {remote_path}", local_path.display()))?;
            println!("uploaded {} -> {remote_path}", local_path.display());
        }
        Commands::Download { remote_path, local_path } => {
            download_file(&engine, &remote_path, &local_path).await?;
            println!("downloaded {remote_path} -> {}", local_path.display());
        }
        Commands::Ls { remote_path } => ls(&engine, &remote_path).await?,
        Commands::Mkdir { remote_path } => {
            engine
                .new_directory(&remote_path)
                .await
                .with_context(|| format!("creating directory {remote_path}"))?;
            engine.flush_meta().await.context("flushing meta")?;
            println!("created {remote_path}");
        }
        Commands::Flush => {
            engine.force_flush_parity().await.context("flushing parity")?;
            engine.flush_assurances().await.context("flushing assurances")?;
            engine.flush_meta().await.context("flushing meta")?;
            println!("flushed");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<VaultConfig> {
    let Some(path) = path else {
        return Ok(VaultConfig::default());
    };
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .with_context(|| format!("reading config file {}", path.display()))?;
    let cfg: VaultConfig = settings
        .try_deserialize()
        .with_context(|| format!("parsing config file {}", path.display()))?;
    cfg.validate().map_err(anyhow::Error::msg)?;
    Ok(cfg)
}

async fn download_file(engine: &Engine, remote_path: &str, local_path: &Path) -> Result<()> {
    let node = engine
        .download_meta_for_path(remote_path)
        .await
        .with_context(|| format!("resolving {remote_path}"))?
        .with_context(|| format!("no such path: {remote_path}"))?;
    let MetaNode::File { size, blocks } = node else {
        bail!("'{remote_path}' is a folder, not a file");
    };

    let mut buf = vec![0u8; size as usize];
    for block in blocks {
        let id = engine.generator().raw_or_parity_id(block.hash);
        let bytes = engine
            .download_chunk(id, true)
            .await
            .with_context(|| format!("downloading block at offset {}", block.start))?;
        let start = block.start as usize;
        buf[start..start + bytes.len()].copy_from_slice(&bytes);
    }

    if let Some(parent) = local_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
    }
    tokio::fs::write(local_path, &buf)
        .await
        .with_context(|| format!("writing {}", local_path.display()))?;
    Ok(())
}

async fn ls(engine: &Engine, remote_path: &str) -> Result<()> {
    let node = engine
        .download_meta_for_path(remote_path)
        .await
        .with_context(|| format!("resolving {remote_path}"))?
        .with_context(|| format!("no such path: {remote_path}"))?;

    match node {
        MetaNode::Folder { mut children } => {
            children.sort_by(|a, b| name_of(a).cmp(name_of(b)));
            for child in &children {
                match child {
                    FolderEntry::Folder(name) => println!("{name}/"),
                    FolderEntry::File { name, size } => println!("{name}\t{size}"),
                }
            }
        }
        MetaNode::File { size, blocks } => {
            println!("{remote_path}\t{size} bytes in {} blocks", blocks.len());
        }
    }
    Ok(())
}

fn name_of(entry: &FolderEntry) -> &str {
    match entry {
        FolderEntry::Folder(name) | FolderEntry::File { name, .. } => name,
    }
}
