use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process;

use shardline_core::codec::{pack, unpack};
use shardline_core::transaction::CompressionType;
use shardline_core::{Config, Name, PackedTransaction, Scenario, SignedTransaction};

/// Shardline - action execution over a sharded object store
///
/// Pack and inspect transactions, check node configuration, and run
/// scenarios against a fresh in-memory chain.
#[derive(Parser)]
#[command(name = "shardline", version, about, long_about = None)]
struct Cli {
    /// Suppress human-readable output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log execution at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Compression {
    None,
    Zlib,
}

impl From<Compression> for CompressionType {
    fn from(c: Compression) -> Self {
        match c {
            Compression::None => CompressionType::None,
            Compression::Zlib => CompressionType::Zlib,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a JSON transaction into its packed wire form (hex)
    Pack {
        /// Path to a signed transaction in JSON
        file: PathBuf,
        #[arg(long, value_enum, default_value = "none")]
        compression: Compression,
    },

    /// Decode a packed transaction (hex) back to JSON
    Unpack {
        /// Path to a file holding the hex encoding
        file: PathBuf,
    },

    /// Print the id of a JSON transaction
    Id {
        /// Path to a signed transaction in JSON
        file: PathBuf,
    },

    /// Convert between a name and its 64-bit value
    Name {
        /// Name to encode, or a number with --decode
        value: String,
        #[arg(long)]
        decode: bool,
    },

    /// Validate a node configuration and print the effective settings
    Config {
        /// Path to a JSON configuration (defaults when omitted)
        file: Option<PathBuf>,
    },

    /// Run a scenario: genesis accounts plus transactions in order
    Run {
        /// Path to a scenario in JSON
        file: PathBuf,
        /// Output traces as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match cli.command {
        Commands::Pack { file, compression } => cmd_pack(&file, compression.into()),
        Commands::Unpack { file } => cmd_unpack(&file),
        Commands::Id { file } => cmd_id(&file),
        Commands::Name { value, decode } => cmd_name(&value, decode),
        Commands::Config { file } => cmd_config(file.as_deref(), cli.quiet),
        Commands::Run { file, json } => cmd_run(&file, json, cli.quiet),
        Commands::Version => {
            println!(
                "shardline {} (shardline-core {})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_VERSION")
            );
            0
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Helpers ───────────────────────────────────────────────

fn read_file(path: &Path) -> Result<String, i32> {
    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("{} cannot read {}: {}", "error:".red().bold(), path.display(), e);
        2
    })
}

fn fail(err: impl std::fmt::Display) -> i32 {
    eprintln!("{} {}", "error:".red().bold(), err);
    2
}

fn load_transaction(path: &Path) -> Result<SignedTransaction, i32> {
    let text = read_file(path)?;
    serde_json::from_str(&text).map_err(|e| fail(format!("invalid transaction: {}", e)))
}

// ── Commands ──────────────────────────────────────────────

fn cmd_pack(file: &Path, compression: CompressionType) -> i32 {
    let trx = match load_transaction(file) {
        Ok(trx) => trx,
        Err(code) => return code,
    };
    match PackedTransaction::new(trx, compression) {
        Ok(packed) => {
            println!("{}", hex::encode(pack(&packed)));
            0
        }
        Err(e) => fail(e),
    }
}

fn cmd_unpack(file: &Path) -> i32 {
    let text = match read_file(file) {
        Ok(text) => text,
        Err(code) => return code,
    };
    let bytes = match hex::decode(text.trim()) {
        Ok(bytes) => bytes,
        Err(e) => return fail(format!("invalid hex: {}", e)),
    };
    let packed: PackedTransaction = match unpack(&bytes) {
        Ok(packed) => packed,
        Err(e) => return fail(e),
    };
    let out = serde_json::json!({
        "id": packed.id().to_string(),
        "compression": packed.compression(),
        "transaction": packed.signed_transaction(),
    });
    match serde_json::to_string_pretty(&out) {
        Ok(s) => {
            println!("{}", s);
            0
        }
        Err(e) => fail(e),
    }
}

fn cmd_id(file: &Path) -> i32 {
    match load_transaction(file) {
        Ok(trx) => {
            println!("{}", trx.transaction.id());
            0
        }
        Err(code) => code,
    }
}

fn cmd_name(value: &str, decode: bool) -> i32 {
    if decode {
        match value.parse::<u64>() {
            Ok(raw) => {
                println!("{}", Name::from_raw(raw));
                0
            }
            Err(e) => fail(format!("invalid number '{}': {}", value, e)),
        }
    } else {
        match value.parse::<Name>() {
            Ok(name) => {
                println!("{}", u64::from(name));
                0
            }
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                1
            }
        }
    }
}

fn cmd_config(file: Option<&Path>, quiet: bool) -> i32 {
    let config = match file {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => return fail(e),
        },
        None => Config::default(),
    };
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "error:".red().bold(), e);
        return 1;
    }
    if !quiet {
        match serde_json::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => return fail(e),
        }
    }
    0
}

fn cmd_run(file: &Path, json: bool, quiet: bool) -> i32 {
    let text = match read_file(file) {
        Ok(text) => text,
        Err(code) => return code,
    };
    let scenario = match Scenario::from_json_str(&text) {
        Ok(scenario) => scenario,
        Err(e) => return fail(e),
    };
    if let Err(e) = scenario.config.validate() {
        return fail(e);
    }
    let traces = match scenario.run() {
        Ok(traces) => traces,
        Err(e) => return fail(e),
    };
    let failed = traces.iter().filter(|t| !t.succeeded()).count();

    if json {
        match serde_json::to_string_pretty(&traces) {
            Ok(s) => println!("{}", s),
            Err(e) => return fail(e),
        }
    } else if !quiet {
        for (i, trace) in traces.iter().enumerate() {
            match &trace.except {
                None => println!(
                    "{} #{} {} shard={} actions={} net={}",
                    "✓".green(),
                    i,
                    trace.id,
                    trace.shard_name,
                    trace.action_traces.len(),
                    trace.net_usage
                ),
                Some(err) => println!(
                    "{} #{} {} {}",
                    "✗".red(),
                    i,
                    trace.id,
                    err.message.red()
                ),
            }
        }
        let summary = format!("{} transactions, {} failed", traces.len(), failed);
        if failed == 0 {
            println!("{}", summary.green().bold());
        } else {
            println!("{}", summary.yellow().bold());
        }
    }

    if failed == 0 {
        0
    } else {
        1
    }
}
