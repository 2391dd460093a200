//! `CloakDB` CLI tool for key management.

#![warn(clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use cloakdb::prelude::*;
use cloakdb_key_file::FileMasterKey;
use cloakdb_kms_aws::AwsKmsMasterKey;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloakdb")]
#[command(about = "CloakDB key management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Master-key provider, selected once at startup.
#[derive(Clone, Copy, ValueEnum)]
enum ProviderKind {
    /// Local master key read from a key file
    Local,
    /// AWS KMS key referenced by id, ARN, or alias
    Aws,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new local master key file
    Keygen {
        /// Output path for the key file
        #[arg(short, long, default_value = "master-key.txt")]
        output: PathBuf,
    },
    /// Find or create the application data key and print its base64 id
    MakeDataKey {
        /// Master-key provider to wrap the data key with
        #[arg(long, value_enum, default_value = "local")]
        provider: ProviderKind,
        /// Path to the local master key file (local provider)
        #[arg(long, default_value = "master-key.txt")]
        key_file: PathBuf,
        /// KMS key id, ARN, or alias (aws provider)
        #[arg(long)]
        key_arn: Option<String>,
        /// Path to the store file holding the key vault
        #[arg(long, default_value = "cloakdb-store.json")]
        store: PathBuf,
        /// Key vault namespace
        #[arg(long, default_value = "encryption.__keyVault")]
        key_vault: String,
        /// Application identity marker for the data key
        #[arg(long, default_value = "demo-data-key")]
        name: String,
    },
}

fn build_provider(
    kind: ProviderKind,
    key_file: &PathBuf,
    key_arn: Option<String>,
) -> anyhow::Result<Arc<dyn MasterKeyProvider>> {
    match kind {
        ProviderKind::Local => {
            let provider = FileMasterKey::load(key_file)
                .with_context(|| format!("loading master key from {}", key_file.display()))?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Aws => {
            let key_arn =
                key_arn.context("--key-arn is required with the aws provider")?;
            let provider =
                AwsKmsMasterKey::new(key_arn).context("initializing AWS KMS provider")?;
            Ok(Arc::new(provider))
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output } => {
            FileMasterKey::init(&output)
                .with_context(|| format!("generating master key at {}", output.display()))?;
            println!("Master key written to {}", output.display());
        }
        Commands::MakeDataKey { provider, key_file, key_arn, store, key_vault, name } => {
            let provider = build_provider(provider, &key_file, key_arn)?;
            let store: Arc<dyn DocumentStore> = Arc::new(
                FileStore::open(&store)
                    .with_context(|| format!("opening store at {}", store.display()))?,
            );

            let namespace: Namespace = key_vault.parse()?;
            let vault = KeyVault::new(store, namespace)?;
            let manager = DataKeyManager::new(vault, provider, name);
            let key_id = manager.find_or_create_data_key()?;

            // base64 form, ready to paste into application configuration
            println!("{}", key_id.to_base64());
        }
    }

    Ok(())
}
