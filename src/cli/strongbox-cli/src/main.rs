//! Strongbox CLI - Envelope encryption from the command line.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strongbox_crypto::MasterKey;
use strongbox_envelope::{Actor, EncryptedData, EngineConfig, EnvelopeEngine};
use strongbox_keyservice::{KeyService, LocalKeyService};
use strongbox_storage::KeyRegistry;
use strongbox_storage_sqlite::SqliteRegistry;

/// Registry database name inside the data directory.
const REGISTRY_NAME: &str = "strongbox";

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "strongbox")]
#[command(about = "Strongbox - Envelope encryption with KEK/DEK hierarchy and audited key usage")]
#[command(version)]
struct Cli {
    /// Directory holding the key registry
    #[arg(long, default_value = "./data", env = "STRONGBOX_DATA_DIR")]
    data_dir: PathBuf,

    /// Master key of the software key service (64 hex characters)
    #[arg(long, env = "STRONGBOX_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Local secret for fallback wrapping
    #[arg(long, env = "STRONGBOX_LOCAL_SECRET", hide_env_values = true)]
    local_secret: Option<String>,

    /// Deadline for key service and registry calls, in seconds
    #[arg(long, default_value = "10", env = "STRONGBOX_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// Identity recorded in the audit log
    #[arg(long, default_value = "cli", env = "STRONGBOX_ACTOR")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine mode and active KEK
    Status,
    /// KEK administration
    Kek {
        #[command(subcommand)]
        command: KekCommands,
    },
    /// Encrypt text and print the JSON envelope
    Encrypt {
        /// Data domain
        #[arg(long)]
        domain: String,
        /// Tenant scope
        #[arg(long)]
        tenant: Option<String>,
        /// Text to encrypt
        text: String,
    },
    /// Decrypt a JSON envelope (or read it from stdin with "-")
    Decrypt {
        /// Envelope JSON
        envelope: String,
    },
    /// Re-wrap the DEKs of a domain under another KEK
    Rotate {
        /// Data domain
        #[arg(long)]
        domain: String,
        /// Target KEK identifier
        #[arg(long)]
        kek: String,
    },
    /// List the active DEKs of a domain
    Deks {
        /// Data domain
        #[arg(long)]
        domain: String,
    },
    /// Audit log commands
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
enum KekCommands {
    /// Register a new active KEK
    Create {
        /// Key name inside the key service
        key_name: String,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Verify the hash chain
    Verify {
        /// Also recompute every entry hash from its content
        #[arg(long)]
        contents: bool,
    },
    /// List audit entries
    List,
}

// ============================================================================
// Setup
// ============================================================================

async fn build_engine(cli: &Cli) -> Result<EnvelopeEngine> {
    let registry = SqliteRegistry::open(&cli.data_dir, REGISTRY_NAME)
        .await
        .with_context(|| format!("Failed to open registry in {}", cli.data_dir.display()))?;
    let registry: Arc<dyn KeyRegistry> = Arc::new(registry);

    let key_service = match &cli.master_key {
        Some(hex) => {
            let master = MasterKey::from_hex(hex.trim()).context("Invalid master key")?;
            Some(Arc::new(LocalKeyService::new(master)) as Arc<dyn KeyService>)
        },
        None => None,
    };

    let mut config =
        EngineConfig::new().with_call_timeout(Duration::from_secs(cli.timeout_secs.max(1)));
    if let Some(secret) = &cli.local_secret {
        config = config.with_local_secret(secret.clone());
    }

    let engine = EnvelopeEngine::new(registry, key_service, config)
        .await
        .context("Failed to initialize envelope engine")?;

    tracing::debug!(
        data_dir = %cli.data_dir.display(),
        fallback = engine.is_fallback_mode(),
        "Engine ready"
    );
    Ok(engine)
}

fn read_envelope(arg: &str) -> Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(input)
}

// ============================================================================
// Command Handlers
// ============================================================================

async fn cmd_status(engine: &EnvelopeEngine) -> Result<()> {
    println!("Strongbox status:");
    println!(
        "  Mode:       {}",
        if engine.is_fallback_mode() {
            "fallback (local wrapping)"
        } else {
            "key service"
        }
    );
    match engine.active_kek().await? {
        Some(kek) => println!("  Active KEK: {} ({})", kek.id, kek.key_name),
        None => println!("  Active KEK: none"),
    }
    Ok(())
}

async fn cmd_kek_create(engine: &EnvelopeEngine, actor: &Actor, key_name: &str) -> Result<()> {
    let kek = engine.create_kek(key_name, actor).await?;
    println!("KEK registered: {} ({})", kek.id, kek.key_name);
    Ok(())
}

async fn cmd_encrypt(
    engine: &EnvelopeEngine,
    actor: &Actor,
    domain: &str,
    tenant: Option<&str>,
    text: &str,
) -> Result<()> {
    let encrypted = engine.encrypt_str(text, domain, tenant, Some(actor)).await?;
    println!("{}", encrypted.to_json()?);
    Ok(())
}

async fn cmd_decrypt(engine: &EnvelopeEngine, actor: &Actor, envelope: &str) -> Result<()> {
    let data = EncryptedData::from_json(read_envelope(envelope)?.trim())?;
    let plaintext = engine.decrypt_to_string(&data, Some(actor)).await?;
    println!("{}", plaintext);
    Ok(())
}

async fn cmd_rotate(engine: &EnvelopeEngine, actor: &Actor, domain: &str, kek: &str) -> Result<()> {
    let report = engine.rotate_deks_report(domain, kek, actor).await?;

    println!("Rotated {} DEK(s) in '{}' onto KEK {}", report.count(), domain, kek);
    for failure in &report.failed {
        println!("  FAILED {}: {}", failure.dek_id, failure.reason);
    }

    if !report.is_complete() {
        bail!("{} DEK(s) could not be rotated", report.failed.len());
    }
    Ok(())
}

async fn cmd_deks(engine: &EnvelopeEngine, domain: &str) -> Result<()> {
    let deks = engine.list_deks(domain).await?;

    if deks.is_empty() {
        println!("No active DEKs in '{}'", domain);
        return Ok(());
    }

    println!("Active DEKs in '{}':", domain);
    for dek in &deks {
        println!(
            "  {}  tenant={}  kek={}  uses={}",
            dek.id,
            dek.tenant_id.as_deref().unwrap_or("-"),
            dek.wrapping.kek_id(),
            dek.usage_count
        );
    }
    Ok(())
}

async fn cmd_audit_verify(engine: &EnvelopeEngine, contents: bool) -> Result<()> {
    let result = if contents {
        engine.audit().verify_contents().await?
    } else {
        engine.audit().verify().await?
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.valid {
        bail!("Audit chain is broken");
    }
    Ok(())
}

async fn cmd_audit_list(engine: &EnvelopeEngine) -> Result<()> {
    let entries = engine.audit().entries().await?;

    if entries.is_empty() {
        println!("No audit entries");
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{:>6}  {}  {:<8} {:<4} {}  actor={}  status={}{}",
            entry.sequence,
            entry.timestamp,
            entry.operation,
            entry.resource_type,
            entry.resource_id,
            entry.actor,
            entry.status,
            if entry.signature.is_some() { "  signed" } else { "" }
        );
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let engine = build_engine(&cli).await?;
    let actor = Actor::new(cli.actor.clone());

    match cli.command {
        Commands::Status => cmd_status(&engine).await,
        Commands::Kek { command } => match command {
            KekCommands::Create { key_name } => cmd_kek_create(&engine, &actor, &key_name).await,
        },
        Commands::Encrypt {
            domain,
            tenant,
            text,
        } => cmd_encrypt(&engine, &actor, &domain, tenant.as_deref(), &text).await,
        Commands::Decrypt { envelope } => cmd_decrypt(&engine, &actor, &envelope).await,
        Commands::Rotate { domain, kek } => cmd_rotate(&engine, &actor, &domain, &kek).await,
        Commands::Deks { domain } => cmd_deks(&engine, &domain).await,
        Commands::Audit { command } => match command {
            AuditCommands::Verify { contents } => cmd_audit_verify(&engine, contents).await,
            AuditCommands::List => cmd_audit_list(&engine).await,
        },
    }
}
