//! ctrv: encrypted drive CLI
//!
//! Commands:
//!   keygen                       - generate a drive key
//!   config show                  - display current configuration
//!   seq create|init|next|show|revoke|set-max|split
//!                                - manage this device's nonce range
//!   encrypt <input> <output>     - import a file into a drive
//!   decrypt <input> <output>     - export a file from a drive

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ctrv_core::config::CtrvConfig;
use ctrv_crypto::{create_provider, generate_drive_key, nonce_from_u64, nonce_to_u64, DriveKey};
use ctrv_sequence::{FileSequencer, NonceSequence, NonceSequencer};
use ctrv_storage::{LocalFile, RealFile};
use ctrv_transfer::{FileExporter, FileImporter, ProgressFn, TransferEngine};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ctrv",
    version,
    about = "Encrypted drive tool",
    long_about = "ctrv: AES-256-CTR file encryption with per-chunk HMAC integrity and durable nonce sequencing"
)]
struct Cli {
    /// Path to ctrv.toml configuration file
    #[arg(long, short = 'c', env = "CTRV_CONFIG", default_value = "~/.config/ctrv/ctrv.toml")]
    config: PathBuf,

    /// Log level (overrides config)
    #[arg(long, env = "CTRV_LOG")]
    log_level: Option<String>,

    /// Log format: "text" or "json" (overrides config)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a random drive key (base64, 64 bytes)
    Keygen {
        /// Write the key to this file instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Nonce sequence management
    Seq {
        /// Sequence store (overrides config)
        #[arg(long, env = "CTRV_SEQUENCER")]
        store: Option<PathBuf>,

        #[command(subcommand)]
        action: SeqAction,
    },

    /// Encrypt a file into a drive
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        /// Drive whose nonce sequence supplies the file nonce
        #[arg(long, short = 'd')]
        drive: String,
        /// Sequence store (overrides config)
        #[arg(long, env = "CTRV_SEQUENCER")]
        store: Option<PathBuf>,
        #[command(flatten)]
        transfer: TransferArgs,
        /// Integrity chunk size in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Write raw ciphertext without chunk hashes
        #[arg(long)]
        no_integrity: bool,
    },

    /// Decrypt a file out of a drive
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        transfer: TransferArgs,
        /// Skip chunk hash verification
        #[arg(long)]
        no_verify: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum SeqAction {
    /// Register this device for a drive
    Create { drive: String, auth: String },
    /// Assign the device's nonce range
    Init {
        drive: String,
        auth: String,
        #[arg(long)]
        start: u64,
        #[arg(long)]
        max: u64,
    },
    /// Allocate the next nonce
    Next { drive: String },
    /// Show the open sequence for a drive
    Show { drive: String },
    /// Revoke the open sequence for a drive
    Revoke { drive: String },
    /// Lower the range's upper bound
    SetMax { drive: String, auth: String, max: u64 },
    /// Hand the upper half of the remaining range to another device
    Split { drive: String, auth: String },
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// File holding the base64 drive key
    #[arg(long, short = 'k', env = "CTRV_KEY_FILE")]
    key_file: PathBuf,
}

#[derive(clap::Args, Debug)]
struct TransferArgs {
    /// Worker threads (overrides config, 0 = cpu count)
    #[arg(long, short = 't')]
    threads: Option<usize>,
    /// Delete the input after a successful transfer
    #[arg(long)]
    delete_source: bool,
    /// Hide the progress bar
    #[arg(long, short = 'q')]
    quiet: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    let format = cli.log_format.as_deref().unwrap_or(&config.log.format);
    init_logging(level, format);

    match cli.command {
        Commands::Keygen { out } => cmd_keygen(out.as_deref()),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        Commands::Seq { store, action } => {
            let sequencer = open_sequencer(&config, store.as_deref())?;
            cmd_seq(&sequencer, action)
        }
        Commands::Encrypt {
            input,
            output,
            key,
            drive,
            store,
            transfer,
            chunk_size,
            no_integrity,
        } => {
            let sequencer = open_sequencer(&config, store.as_deref())?;
            cmd_encrypt(
                &config,
                &sequencer,
                &input,
                &output,
                &key,
                &drive,
                &transfer,
                chunk_size,
                no_integrity,
            )
        }
        Commands::Decrypt {
            input,
            output,
            key,
            transfer,
            no_verify,
        } => cmd_decrypt(&config, &input, &output, &key, &transfer, no_verify),
    }
}

// ── Config, logging, and shared helpers ──────────────────────────────────────

fn load_config(path: &Path) -> Result<CtrvConfig> {
    CtrvConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

fn open_sequencer(config: &CtrvConfig, override_path: Option<&Path>) -> Result<FileSequencer> {
    let path = expand_tilde(override_path.unwrap_or(&config.sequencer.path));
    let sequencer = FileSequencer::json(Arc::new(LocalFile::new(&path)));
    sequencer
        .initialize()
        .with_context(|| format!("opening sequence store: {}", path.display()))?;
    Ok(sequencer)
}

fn read_key(args: &KeyArgs) -> Result<DriveKey> {
    let path = expand_tilde(&args.key_file);
    let encoded = std::fs::read_to_string(&path)
        .with_context(|| format!("reading key file: {}", path.display()))?;
    DriveKey::from_base64(encoded.trim())
        .with_context(|| format!("parsing key file: {}", path.display()))
}

fn engine_for(config: &CtrvConfig, args: &TransferArgs) -> Result<TransferEngine> {
    let mut transfer = config.transfer.clone();
    if let Some(threads) = args.threads {
        transfer.threads = threads;
    }
    TransferEngine::from_config(&transfer).context("starting transfer engine")
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Workers report out of order; the bar only moves forward.
fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    let high = AtomicU64::new(0);
    Box::new(move |done, _total| {
        if high.fetch_max(done, Ordering::Relaxed) < done {
            pb.set_position(done);
        }
    })
}

fn transfer_bar(args: &TransferArgs, total: u64, prefix: &str) -> ProgressBar {
    if args.quiet {
        ProgressBar::hidden()
    } else {
        make_progress_bar(total, prefix)
    }
}

fn report_outcome(
    pb: &ProgressBar,
    outcome: Option<Arc<dyn RealFile>>,
    output: &Path,
) -> Result<()> {
    match outcome {
        Some(_) => {
            pb.finish_and_clear();
            println!("wrote {}", output.display());
            Ok(())
        }
        None => {
            pb.abandon_with_message("cancelled");
            anyhow::bail!("transfer cancelled")
        }
    }
}

// ── `ctrv keygen` ─────────────────────────────────────────────────────────────

fn cmd_keygen(out: Option<&Path>) -> Result<()> {
    let encoded = generate_drive_key().to_base64();
    match out {
        Some(path) => {
            let path = expand_tilde(path);
            if path.exists() {
                anyhow::bail!("refusing to overwrite existing key file: {}", path.display());
            }
            LocalFile::new(&path)
                .replace_contents(format!("{encoded}\n").as_bytes())
                .with_context(|| format!("writing key file: {}", path.display()))?;
            println!("wrote drive key to {}", path.display());
        }
        None => println!("{encoded}"),
    }
    Ok(())
}

// ── `ctrv config show` ────────────────────────────────────────────────────────

fn cmd_config_show(config: &CtrvConfig, config_path: &Path) -> Result<()> {
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

// ── `ctrv seq` ────────────────────────────────────────────────────────────────

fn cmd_seq(sequencer: &FileSequencer, action: SeqAction) -> Result<()> {
    match action {
        SeqAction::Create { drive, auth } => {
            sequencer
                .create_sequence(&drive, &auth)
                .with_context(|| format!("creating sequence for {drive}"))?;
            println!("created sequence {drive}:{auth}");
        }
        SeqAction::Init {
            drive,
            auth,
            start,
            max,
        } => {
            sequencer
                .initialize_sequence(&drive, &auth, &nonce_from_u64(start), &nonce_from_u64(max))
                .with_context(|| format!("initializing sequence for {drive}"))?;
            println!("initialized {drive}:{auth} with nonces {start}..={max}");
        }
        SeqAction::Next { drive } => {
            let nonce = sequencer
                .next_nonce(&drive)
                .with_context(|| format!("allocating nonce for {drive}"))?;
            println!("{}", hex::encode(nonce));
        }
        SeqAction::Show { drive } => match sequencer.get_sequence(&drive)? {
            Some(seq) => print_sequence(&seq),
            None => println!("no open sequence for {drive}"),
        },
        SeqAction::Revoke { drive } => {
            sequencer
                .revoke_sequence(&drive)
                .with_context(|| format!("revoking sequence for {drive}"))?;
            println!("revoked {drive}");
        }
        SeqAction::SetMax { drive, auth, max } => {
            sequencer
                .set_max_nonce(&drive, &auth, &nonce_from_u64(max))
                .with_context(|| format!("lowering max nonce for {drive}"))?;
            println!("max nonce for {drive}:{auth} is now {max}");
        }
        SeqAction::Split { drive, auth } => {
            let (start, max) = sequencer
                .split_range(&drive, &auth)
                .with_context(|| format!("splitting range for {drive}"))?;
            println!(
                "new device range: start={} max={}",
                nonce_to_u64(&start)?,
                nonce_to_u64(&max)?
            );
        }
    }
    Ok(())
}

fn print_sequence(seq: &NonceSequence) {
    let show = |n: &Option<Vec<u8>>| match n {
        Some(bytes) => hex::encode(bytes),
        None => "-".to_string(),
    };
    println!("drive:  {}", seq.drive_id);
    println!("auth:   {}", seq.auth_id);
    println!("status: {:?}", seq.status);
    println!("next:   {}", show(&seq.next_nonce));
    println!("max:    {}", show(&seq.max_nonce));
}

// ── `ctrv encrypt` ────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn cmd_encrypt(
    config: &CtrvConfig,
    sequencer: &dyn NonceSequencer,
    input: &Path,
    output: &Path,
    key: &KeyArgs,
    drive: &str,
    transfer: &TransferArgs,
    chunk_size: Option<usize>,
    no_integrity: bool,
) -> Result<()> {
    let source = Arc::new(LocalFile::new(input));
    let total = source
        .length()
        .with_context(|| format!("reading input: {}", input.display()))?;

    let importer = FileImporter::new(
        read_key(key)?,
        create_provider(config.crypto.provider),
        config.integrity.enabled && !no_integrity,
        chunk_size.unwrap_or(config.integrity.chunk_size),
    )?;
    let engine = engine_for(config, transfer)?;
    tracing::info!(
        input = %input.display(),
        threads = engine.threads(),
        chunk_size = importer.chunk_size(),
        "encrypting"
    );

    let pb = transfer_bar(transfer, total, "encrypt");
    let progress = progress_callback(&pb);
    let outcome = importer
        .import(
            &engine,
            sequencer,
            drive,
            source,
            Arc::new(LocalFile::new(output)),
            transfer.delete_source || config.transfer.delete_source,
            Some(&progress),
        )
        .map_err(|e| {
            pb.abandon();
            if e.requires_authorization() {
                anyhow::anyhow!("{e}\nthis device needs a nonce range: run `ctrv seq create` and `ctrv seq init`")
            } else {
                anyhow::Error::new(e)
            }
        })
        .with_context(|| format!("encrypting {}", input.display()))?;
    report_outcome(&pb, outcome, output)
}

// ── `ctrv decrypt` ────────────────────────────────────────────────────────────

fn cmd_decrypt(
    config: &CtrvConfig,
    input: &Path,
    output: &Path,
    key: &KeyArgs,
    transfer: &TransferArgs,
    no_verify: bool,
) -> Result<()> {
    let source = Arc::new(LocalFile::new(input));
    let physical = source
        .length()
        .with_context(|| format!("reading input: {}", input.display()))?;

    let exporter = FileExporter::new(
        read_key(key)?,
        create_provider(config.crypto.provider),
        !no_verify,
    );
    let engine = engine_for(config, transfer)?;

    let pb = transfer_bar(transfer, physical, "decrypt");
    let length_pb = pb.clone();
    let progress: ProgressFn = {
        let inner = progress_callback(&pb);
        Box::new(move |done, total| {
            if length_pb.length() != Some(total) {
                length_pb.set_length(total);
            }
            inner(done, total);
        })
    };
    let outcome = exporter
        .export(
            &engine,
            source,
            Arc::new(LocalFile::new(output)),
            transfer.delete_source || config.transfer.delete_source,
            Some(&progress),
        )
        .map_err(|e| {
            pb.abandon();
            anyhow::Error::new(e)
        })
        .with_context(|| format!("decrypting {}", input.display()))?;
    report_outcome(&pb, outcome, output)
}
