//! vault: encrypted file container CLI
//!
//! Commands:
//!   encrypt <file>   - seal a file into a chunked (or legacy) container
//!   decrypt <file>   - authenticate and restore a container
//!   cat <file>       - stream plaintext (optionally a byte range) to stdout
//!   inspect <file>   - print the header and chunk table (no key needed)
//!   keygen <out>     - create a wrapped content key for external-key mode
//!   config show      - display current configuration

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use vault_core::VaultConfig;
use vault_crypto::format::RECORD_OVERHEAD;
use vault_crypto::{
    detect_format, spawn_decrypt, spawn_encrypt, ChunkIndex, ContainerKind, FileMode,
    FileOptions, JobHandle, KeyProvider, Monitor, OwnedKeySource, Progress, RandomAccessReader,
    Summary, NONCE_SIZE, TAG_SIZE,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "vault",
    version,
    about = "Tamper-evident, seekable encrypted file containers"
)]
struct Cli {
    /// Path to vault.toml configuration file
    #[arg(long, short = 'c', env = "VAULT_CONFIG", default_value = "~/.config/vault/vault.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(long, env = "VAULT_LOG")]
    log: Option<String>,

    /// Log format; defaults to the config value
    #[arg(long, env = "VAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file into a container
    Encrypt {
        input: PathBuf,
        /// Output path (default: <input>.vault)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Plaintext bytes per chunk (overrides config)
        #[arg(long)]
        chunk_size: Option<u32>,
        /// Write the single-stream legacy format (requires --key-file)
        #[arg(long)]
        legacy: bool,
        /// Wrapped content key from `vault keygen`; the header then carries no key
        #[arg(long, env = "VAULT_KEY_FILE")]
        key_file: Option<PathBuf>,
    },

    /// Decrypt a container (chunked or legacy, detected automatically)
    Decrypt {
        input: PathBuf,
        /// Output path (default: <input> without .vault)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        #[arg(long, env = "VAULT_KEY_FILE")]
        key_file: Option<PathBuf>,
    },

    /// Write plaintext to stdout, optionally only a byte range
    Cat {
        input: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to read (default: to the end)
        #[arg(long)]
        length: Option<usize>,
        #[arg(long, env = "VAULT_KEY_FILE")]
        key_file: Option<PathBuf>,
    },

    /// Show header fields and the chunk table
    Inspect {
        input: PathBuf,
        /// List every chunk record
        #[arg(long)]
        chunks: bool,
    },

    /// Generate a content key wrapped under the device master key
    Keygen { output: PathBuf },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = vault_core::config::expand_tilde(&cli.config);
    let config = VaultConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "vault starting"
    );

    match cli.command {
        Commands::Encrypt { input, output, chunk_size, legacy, key_file } => {
            cmd_encrypt(&config, &input, output, chunk_size, legacy, key_file.as_deref()).await
        }
        Commands::Decrypt { input, output, key_file } => {
            cmd_decrypt(&config, &input, output, key_file.as_deref()).await
        }
        Commands::Cat { input, offset, length, key_file } => {
            cmd_cat(&config, &input, offset, length, key_file.as_deref())
        }
        Commands::Inspect { input, chunks } => cmd_inspect(&input, chunks),
        Commands::Keygen { output } => cmd_keygen(&config, &output),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

fn read_passphrase() -> anyhow::Result<SecretString> {
    if let Ok(pass) = std::env::var("VAULT_PASSPHRASE") {
        return Ok(SecretString::from(pass));
    }
    let pass = rpassword::prompt_password("Key file passphrase: ")
        .context("reading passphrase from terminal")?;
    Ok(SecretString::from(pass))
}

fn key_provider(config: &VaultConfig) -> Result<Arc<dyn KeyProvider>> {
    vault_secrets::provider_from_config(&config.keys, read_passphrase)
        .context("opening key provider")
}

/// External content key from `key_file`, else the configured provider.
fn resolve_keys(config: &VaultConfig, key_file: Option<&Path>) -> Result<OwnedKeySource> {
    let provider = key_provider(config)?;
    let Some(path) = key_file else {
        return Ok(OwnedKeySource::Wrapped(provider));
    };
    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file: {}", path.display()))?;
    let wrapped = STANDARD
        .decode(encoded.trim())
        .with_context(|| format!("key file is not base64: {}", path.display()))?;
    let key = provider
        .unwrap_key(&wrapped)
        .with_context(|| format!("unwrapping content key: {}", path.display()))?;
    Ok(OwnedKeySource::External(key))
}

// ── Progress ──────────────────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Render a job's progress until it ends; Ctrl-C cancels it.
async fn drive(mut job: JobHandle, prefix: &str) -> Result<Summary> {
    let pb = make_progress_bar(prefix);
    let cancel = job.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    while let Some(progress) = job.progress.recv().await {
        match progress {
            Progress::Fraction(f) => pb.set_position((f * 1000.0) as u64),
            Progress::Indeterminate => pb.set_message("(length unknown)"),
        }
    }
    interrupt.abort();

    match job.join().await {
        Ok(summary) => {
            pb.finish_with_message("done");
            Ok(summary)
        }
        Err(e) if e.is_cancelled() => {
            pb.abandon_with_message("cancelled");
            Err(e.into())
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(e.into())
        }
    }
}

// ── `vault encrypt` ───────────────────────────────────────────────────────────

async fn cmd_encrypt(
    config: &VaultConfig,
    input: &Path,
    output: Option<PathBuf>,
    chunk_size: Option<u32>,
    legacy: bool,
    key_file: Option<&Path>,
) -> Result<()> {
    if !input.is_file() {
        anyhow::bail!("not a file: {}", input.display());
    }
    if key_file.is_none() && (legacy || !config.codec.embed_wrapped_key) {
        anyhow::bail!(
            "an external content key is required here; create one with `vault keygen` and pass --key-file"
        );
    }
    let chunk_size = chunk_size.unwrap_or(config.codec.chunk_size_bytes);
    if chunk_size == 0 {
        anyhow::bail!("--chunk-size must be greater than zero");
    }

    let output = output.unwrap_or_else(|| default_sealed_path(input));
    let keys = resolve_keys(config, key_file)?;
    let options = FileOptions {
        mode: if legacy { FileMode::Legacy } else { FileMode::Chunked },
        chunk_size,
    };

    info!(input = %input.display(), output = %output.display(), mode = ?options.mode, "encrypting");
    let job = spawn_encrypt(input.to_path_buf(), output.clone(), options, keys);
    let summary = drive(job, "encrypt")
        .await
        .with_context(|| format!("encrypting {}", input.display()))?;

    println!("  output:  {}", output.display());
    println!("  format:  {}", kind_name(summary.kind));
    if summary.kind == ContainerKind::Chunked {
        println!("  chunks:  {}", summary.chunks);
    }
    println!("  bytes:   {}", fmt_bytes(summary.plaintext_bytes));
    Ok(())
}

// ── `vault decrypt` ───────────────────────────────────────────────────────────

async fn cmd_decrypt(
    config: &VaultConfig,
    input: &Path,
    output: Option<PathBuf>,
    key_file: Option<&Path>,
) -> Result<()> {
    let output = output.unwrap_or_else(|| default_plain_path(input));
    let keys = resolve_keys(config, key_file)?;

    info!(input = %input.display(), output = %output.display(), "decrypting");
    let job = spawn_decrypt(input.to_path_buf(), output.clone(), keys);
    let summary = drive(job, "decrypt")
        .await
        .with_context(|| format!("decrypting {}", input.display()))?;

    println!("  output:  {}", output.display());
    println!("  format:  {}", kind_name(summary.kind));
    println!("  bytes:   {}", fmt_bytes(summary.plaintext_bytes));
    Ok(())
}

// ── `vault cat` ───────────────────────────────────────────────────────────────

fn cmd_cat(
    config: &VaultConfig,
    input: &Path,
    offset: u64,
    length: Option<usize>,
    key_file: Option<&Path>,
) -> Result<()> {
    let keys = resolve_keys(config, key_file)?;
    let mut file =
        File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if detect_format(&mut file)? == ContainerKind::Legacy {
        if offset != 0 || length.is_some() {
            anyhow::bail!("legacy containers have no random access; drop --offset/--length");
        }
        let mut source = std::io::BufReader::new(file);
        vault_crypto::decrypt_any(&mut source, &mut out, keys.as_source(), &mut Monitor::silent())
            .context("decrypting legacy container")?;
        return Ok(());
    }

    let mut reader = RandomAccessReader::open(file, keys.as_source())
        .with_context(|| format!("opening container {}", input.display()))?;
    match length {
        Some(len) => {
            let bytes = reader.read_at(offset, len)?;
            out.write_all(&bytes)?;
        }
        None => {
            use std::io::{Seek, SeekFrom};
            let mut cursor = reader.cursor();
            cursor.seek(SeekFrom::Start(offset))?;
            std::io::copy(&mut cursor, &mut out)?;
        }
    }
    out.flush()?;
    reader.close();
    Ok(())
}

// ── `vault inspect` ───────────────────────────────────────────────────────────

fn cmd_inspect(input: &Path, list_chunks: bool) -> Result<()> {
    let mut file =
        File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let size = file.metadata()?.len();

    if detect_format(&mut file)? == ContainerKind::Legacy {
        println!("format:     legacy (single AES-GCM stream)");
        println!("size:       {}", fmt_bytes(size));
        println!(
            "plaintext:  {}",
            fmt_bytes(size.saturating_sub((NONCE_SIZE + TAG_SIZE) as u64))
        );
        return Ok(());
    }

    let index = ChunkIndex::scan(&mut file)
        .with_context(|| format!("reading container {}", input.display()))?;
    let header = index.header();
    println!("format:     chunked v{}", header.version);
    println!("chunk size: {}", fmt_bytes(u64::from(header.chunk_size)));
    match header.total_plaintext {
        Some(total) => println!("plaintext:  {} ({total} bytes)", fmt_bytes(total)),
        None => println!(
            "plaintext:  {} (declared unknown)",
            fmt_bytes(index.plaintext_len())
        ),
    }
    match &header.wrapped_key {
        Some(key) => println!("key:        wrapped in header ({} bytes)", key.len()),
        None => println!("key:        external"),
    }
    println!("chunks:     {}", index.len());
    println!("size:       {}", fmt_bytes(size));
    if index.container_len() > index.entries().last().map_or(header.encoded_len() as u64, |e| {
        e.record_offset + RECORD_OVERHEAD as u64 + u64::from(e.ciphertext_len)
    }) {
        println!("note:       trailing bytes after the last record");
    }

    if list_chunks {
        println!();
        println!("{:>8}  {:>14}  {:>10}", "chunk", "offset", "length");
        for (i, entry) in index.entries().iter().enumerate() {
            println!(
                "{:>8}  {:>14}  {:>10}",
                i, entry.record_offset, entry.ciphertext_len
            );
        }
    }
    Ok(())
}

// ── `vault keygen` ────────────────────────────────────────────────────────────

fn cmd_keygen(config: &VaultConfig, output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!("refusing to overwrite {}", output.display());
    }
    let provider = key_provider(config)?;
    let key = provider.generate_content_key()?;
    let wrapped = provider.wrap_key(&key).context("wrapping content key")?;

    let mut file = File::create(output)
        .with_context(|| format!("creating {}", output.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    writeln!(file, "{}", STANDARD.encode(&wrapped))?;

    println!("wrapped content key written to {}", output.display());
    Ok(())
}

// ── `vault config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &VaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn default_sealed_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".vault");
    PathBuf::from(name)
}

fn default_plain_path(input: &Path) -> PathBuf {
    if input.extension().is_some_and(|ext| ext == "vault") {
        input.with_extension("")
    } else {
        let mut name = input.as_os_str().to_owned();
        name.push(".out");
        PathBuf::from(name)
    }
}

fn kind_name(kind: ContainerKind) -> &'static str {
    match kind {
        ContainerKind::Chunked => "chunked",
        ContainerKind::Legacy => "legacy",
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        assert_eq!(
            default_sealed_path(Path::new("/tmp/a.jpg")),
            PathBuf::from("/tmp/a.jpg.vault")
        );
        assert_eq!(
            default_plain_path(Path::new("/tmp/a.jpg.vault")),
            PathBuf::from("/tmp/a.jpg")
        );
        assert_eq!(
            default_plain_path(Path::new("/tmp/blob")),
            PathBuf::from("/tmp/blob.out")
        );
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(1536), "1.5 KB");
        assert_eq!(fmt_bytes(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn test_cli_parses_encrypt_flags() {
        let cli = Cli::try_parse_from([
            "vault",
            "--log-format",
            "json",
            "encrypt",
            "movie.mp4",
            "--chunk-size",
            "262144",
            "--legacy",
            "--key-file",
            "k.b64",
        ])
        .unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Commands::Encrypt { input, chunk_size, legacy, key_file, .. } => {
                assert_eq!(input, PathBuf::from("movie.mp4"));
                assert_eq!(chunk_size, Some(262144));
                assert!(legacy);
                assert_eq!(key_file, Some(PathBuf::from("k.b64")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_keygen_then_external_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VaultConfig::default();
        config.keys.backend = "file".into();
        config.keys.key_file = dir.path().join("master.key");
        config.keys.argon2_mem_cost_kib = 1024;
        config.keys.argon2_time_cost = 1;
        config.keys.argon2_parallelism = 1;
        std::env::set_var("VAULT_PASSPHRASE", "cli test passphrase");

        let out = dir.path().join("content.key");
        cmd_keygen(&config, &out).unwrap();
        assert!(cmd_keygen(&config, &out).is_err(), "overwrote an existing key");

        match resolve_keys(&config, Some(&out)).unwrap() {
            OwnedKeySource::External(_) => {}
            other => panic!("expected an external key, got {other:?}"),
        }
        assert!(matches!(
            resolve_keys(&config, None).unwrap(),
            OwnedKeySource::Wrapped(_)
        ));

        std::fs::write(&out, "not base64 !!").unwrap();
        assert!(resolve_keys(&config, Some(&out)).is_err());
    }

    #[test]
    fn test_cli_parses_cat_range() {
        let cli = Cli::try_parse_from([
            "vault", "cat", "x.vault", "--offset", "5500000", "--length", "100",
        ])
        .unwrap();
        match cli.command {
            Commands::Cat { offset, length, .. } => {
                assert_eq!(offset, 5_500_000);
                assert_eq!(length, Some(100));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
