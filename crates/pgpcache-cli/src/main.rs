//! pgpcache: inspect and maintain the OpenPGP secure cache
//!
//! Commands:
//!   config show                      - display current configuration
//!   scope list [--scope NAME]        - list the entries of a scope
//!   secret add|read|unlink NAME      - raw secrets in the session scope
//!   passphrase remember|forget KEYID - cached key passphrases
//!   key import [FILE] [--armor]      - import keys from FILE or stdin
//!   key forget KEYID [--private-only] - drop stored key material
//!   decrypt [FILE]                   - decrypt a message to stdout

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use std::io::{self, Read, Write};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use pgpcache_core::config::{default_config_path, CacheBackend, PgpCacheConfig};
use pgpcache_core::KeyId;
use pgpcache_secrets::{keychain, open_cache, Scope, SecureCache};
use pgpcache_store::{KeyStore, PassphraseKeyring, Rpgp, TerminalPrompter};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "pgpcache",
    version,
    about = "OpenPGP key and passphrase cache",
    long_about = "pgpcache: inspect and maintain keys, passphrases and secrets held in the secure cache"
)]
struct Cli {
    /// Path to config.toml (default: ~/.config/pgpcache/config.toml)
    #[arg(long, short = 'c', env = "PGPCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides [log] level
    #[arg(long, env = "PGPCACHE_LOG")]
    log: Option<String>,

    /// Log format; overrides [log] format
    #[arg(long, env = "PGPCACHE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Inspect cache scopes
    Scope {
        #[command(subcommand)]
        action: ScopeAction,
    },

    /// Raw secrets in the session scope
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },

    /// Cached key passphrases
    Passphrase {
        #[command(subcommand)]
        action: PassphraseAction,
    },

    /// Stored OpenPGP keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Decrypt a message with the stored keys, writing the plaintext to stdout
    Decrypt {
        /// Message file (default: stdin); armored input is detected
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum ScopeAction {
    /// List the objects linked into a scope
    List {
        /// Scope name searched from the session scope (default: the session scope)
        #[arg(long)]
        scope: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SecretAction {
    /// Store stdin under NAME
    Add { name: String },
    /// Write the payload of NAME to stdout
    Read { name: String },
    /// Unlink NAME from the scope it is linked into
    Unlink { name: String },
}

#[derive(Subcommand, Debug)]
enum PassphraseAction {
    /// Prompt for a passphrase and cache it for KEYID
    Remember { key_id: KeyId },
    /// Drop the cached passphrase for KEYID
    Forget { key_id: KeyId },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Import a keyring; prints the primary ids that were stored
    Import {
        /// Keyring file (default: stdin)
        file: Option<PathBuf>,
        /// Input is ASCII-armored
        #[arg(long)]
        armor: bool,
    },
    /// Remove the stored entries of KEYID
    Forget {
        key_id: KeyId,
        /// Keep the public entry
        #[arg(long)]
        private_only: bool,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::from_str(&config.log.format, true).unwrap_or(LogFormat::Text));
    init_logging(&level, format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        backend = ?config.cache.backend,
        "pgpcache starting"
    );

    let stdout = &mut io::stdout().lock();
    match cli.command {
        Commands::Config { action: ConfigAction::Show } => {
            cmd_config_show(&config, &config_path, stdout)
        }
        command => {
            let cache = open_cache(&config.cache).context("opening secure cache")?;
            run(&config, &config_path, cache, command, &mut io::stdin().lock(), stdout)
        }
    }
}

fn run(
    config: &PgpCacheConfig,
    config_path: &Path,
    cache: Arc<dyn SecureCache>,
    command: Commands,
    input: &mut dyn Read,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Config { action: ConfigAction::Show } => {
            cmd_config_show(config, config_path, out)
        }
        Commands::Scope { action: ScopeAction::List { scope } } => {
            cmd_scope_list(cache, scope.as_deref(), out)
        }
        Commands::Secret { action } => cmd_secret(cache, action, input, out),
        Commands::Passphrase { action: PassphraseAction::Remember { key_id } } => {
            let pass = SecretString::from(
                rpassword::prompt_password(format!("Passphrase for key {} : ", key_id.short()))
                    .context("reading passphrase")?,
            );
            let keyring = open_keyring(config, cache)?;
            keyring
                .remember(key_id, pass.expose_secret().as_bytes())
                .with_context(|| format!("caching passphrase for {key_id}"))?;
            writeln!(out, "cached passphrase for {key_id}")?;
            Ok(())
        }
        Commands::Passphrase { action: PassphraseAction::Forget { key_id } } => {
            let keyring = open_keyring(config, cache)?;
            let existed = keyring
                .forget(key_id)
                .with_context(|| format!("forgetting passphrase for {key_id}"))?;
            report(out, existed, &format!("passphrase for {key_id}"))
        }
        Commands::Key { action: KeyAction::Forget { key_id, private_only } } => {
            let store = KeyStore::open(cache, &config.store).context("opening key store")?;
            let existed = if private_only {
                store.forget_private(key_id)
            } else {
                store.forget(key_id)
            }
            .with_context(|| format!("forgetting key {key_id}"))?;
            report(out, existed, &format!("key {key_id}"))
        }
        Commands::Key { action: KeyAction::Import { file, armor } } => {
            let store = KeyStore::open(cache, &config.store).context("opening key store")?;
            let keyring = read_source(file.as_deref(), input)?;
            let ids = if armor {
                store.import_armored(&Rpgp, &keyring[..])
            } else {
                store.import(&Rpgp, &keyring[..])
            }
            .context("importing keys")?;
            for id in &ids {
                writeln!(out, "imported {id}")?;
            }
            info!(keys = ids.len(), "key import finished");
            Ok(())
        }
        Commands::Decrypt { file } => {
            let store = KeyStore::open(cache.clone(), &config.store).context("opening key store")?;
            let keyring = open_keyring(config, cache)?;
            let message = read_source(file.as_deref(), input)?;
            let details = keyring
                .read_message(&Rpgp, &mut &message[..], &store.key_source(&Rpgp), None)
                .context("decrypting message")?;
            if let Some(id) = details.decrypted_with {
                info!(key_id = %id, "decrypted message");
            }
            out.write_all(&details.body)?;
            Ok(())
        }
    }
}

/// The contents of `file`, or all of `input` when no file is given.
fn read_source(file: Option<&Path>, input: &mut dyn Read) -> Result<Zeroizing<Vec<u8>>> {
    match file {
        Some(path) => fs::read(path)
            .map(Zeroizing::new)
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut data = Zeroizing::new(Vec::new());
            input.read_to_end(&mut data).context("reading stdin")?;
            Ok(data)
        }
    }
}

fn report(out: &mut dyn Write, existed: bool, what: &str) -> Result<()> {
    if existed {
        writeln!(out, "removed {what}")?;
    } else {
        writeln!(out, "no cached {what}")?;
    }
    Ok(())
}

fn open_keyring(config: &PgpCacheConfig, cache: Arc<dyn SecureCache>) -> Result<PassphraseKeyring> {
    PassphraseKeyring::open(cache, &config.passphrase, Arc::new(TerminalPrompter))
        .context("opening passphrase scope")
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<PgpCacheConfig> {
    PgpCacheConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

// ── `pgpcache config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &PgpCacheConfig, config_path: &Path, out: &mut dyn Write) -> Result<()> {
    if config_path.exists() {
        writeln!(out, "# Configuration from: {}", config_path.display())?;
    } else {
        writeln!(out, "# Configuration: defaults (no file at {})", config_path.display())?;
    }
    if config.cache.backend == CacheBackend::Keychain {
        let available = keychain::is_available(&config.cache.service);
        writeln!(out, "# Platform keychain available: {available}")?;
    }
    writeln!(out)?;
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    write!(out, "{rendered}")?;
    Ok(())
}

// ── `pgpcache scope list` ─────────────────────────────────────────────────────

fn cmd_scope_list(cache: Arc<dyn SecureCache>, name: Option<&str>, out: &mut dyn Write) -> Result<()> {
    let session = Scope::session(cache).context("opening session scope")?;
    let scope = match name {
        Some(name) => Scope::open(&session, name).with_context(|| format!("scope {name:?}"))?,
        None => session,
    };

    for mut r in scope.list().context("listing scope")? {
        let id = r.id();
        match r.info() {
            Ok(info) => writeln!(out, "{id}\t{}\t{}\t{}", info.kind, info.perm, info.name)?,
            Err(e) => tracing::debug!(serial = %id, "skipping stale reference: {e}"),
        }
    }
    Ok(())
}

// ── `pgpcache secret` ─────────────────────────────────────────────────────────

fn cmd_secret(
    cache: Arc<dyn SecureCache>,
    action: SecretAction,
    input: &mut dyn Read,
    out: &mut dyn Write,
) -> Result<()> {
    let session = Scope::session(cache).context("opening session scope")?;
    match action {
        SecretAction::Add { name } => {
            let mut payload = Zeroizing::new(Vec::new());
            input.read_to_end(&mut payload).context("reading stdin")?;
            let key = session
                .add(&name, &payload)
                .with_context(|| format!("adding {name:?}"))?;
            writeln!(out, "{}", key.id())?;
        }
        SecretAction::Read { name } => {
            let key = session.search(&name).with_context(|| format!("finding {name:?}"))?;
            let payload = key.get().with_context(|| format!("reading {name:?}"))?;
            out.write_all(&payload)?;
        }
        SecretAction::Unlink { name } => {
            let key = session.search(&name).with_context(|| format!("finding {name:?}"))?;
            key.unlink().with_context(|| format!("unlinking {name:?}"))?;
            info!(name = %name, serial = %key.id(), "unlinked secret");
        }
    }
    Ok(())
}
