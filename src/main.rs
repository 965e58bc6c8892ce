use std::path::PathBuf;
use std::sync::Arc;

use blockfile::batch::{BatchConfig, BatchRunner, DEFAULT_EXTENSIONS};
use blockfile::logging::{self, Verbosity};
use blockfile::{salvage_file, ClassTable, ConsoleProgress, RecoveryPolicy, Scanner, Verifier};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blockfile", about = "Verify, inspect and salvage binary block files")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify every block file in a directory; exits with the failure count
    Verify {
        dir: PathBuf,
        /// Worker threads (capped at the available parallelism)
        #[arg(short, long, default_value = "1")]
        threads: usize,
        /// File extension to verify; repeatable (default: blk)
        #[arg(short = 'e', long = "ext")]
        extensions: Vec<String>,
        /// Leave failed files in place
        #[arg(long)]
        no_quarantine: bool,
        /// Recovery policy JSON file
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
        /// Override the recovery search window, in bytes
        #[arg(long)]
        search_window: Option<u64>,
    },
    /// List the blocks of one file up to the first structural error
    Scan {
        input: PathBuf,
    },
    /// Copy every recoverable block of a damaged file into a new file
    Salvage {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
}

fn load_policy(path: Option<&PathBuf>) -> Result<RecoveryPolicy, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(p) => RecoveryPolicy::from_json_file(p)?,
        None    => RecoveryPolicy::default(),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet));

    match cli.command {

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { dir, threads, extensions, no_quarantine, policy, report, search_window } => {
            let mut policy = load_policy(policy.as_ref())?;
            if let Some(window) = search_window {
                policy.search_window = window;
                policy.validate()?;
            }
            let config = BatchConfig {
                source_dir: dir,
                threads,
                extensions: if extensions.is_empty() {
                    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
                } else {
                    extensions
                },
                policy,
                quarantine: !no_quarantine,
            };

            let runner = BatchRunner::new(Verifier::default());
            println!("Verifying: {}", config.source_dir.display());
            let result = runner.run(&config, Arc::new(ConsoleProgress::new(cli.verbose)))?;

            for file in &result.results {
                if let Some(dest) = &file.quarantined_to {
                    println!("  moved   {} -> {}", file.result.file_name(), dest.display());
                }
                if let Some(err) = &file.quarantine_error {
                    println!("  kept    {} ({err})", file.result.file_name());
                }
            }
            println!("{}", result.summary());
            if let Some(path) = report {
                std::fs::write(&path, result.to_json()?)?;
                println!("Report: {}", path.display());
            }
            if result.exit_code() != 0 {
                std::process::exit(result.exit_code());
            }
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { input } => {
            let table = ClassTable::builtin();
            let mut scanner = Scanner::open(&input)?;
            println!("File: {} ({} B)", input.display(), scanner.len());
            println!("{:>10}  {:<12} {:>5} {:>7} {:>9}  {:<10} {:<6} Head",
                     "Offset", "Class", "Ver", "DataId", "Length", "CRC", "Status");
            let mut count = 0u64;
            for item in &mut scanner {
                match item {
                    Ok((offset, block)) => {
                        let h = &block.header;
                        let class = table.class_name(h.class_id).unwrap_or("?");
                        let status = table.classify(h, &block.payload, block.checksum);
                        let head = hex::encode(&block.payload[..block.payload.len().min(8)]);
                        println!("{:>10}  {:<12} {:>2}.{:<2} {:>7} {:>9}  {:#010x} {:<6} {}",
                                 offset, class, h.major_version, h.minor_version, h.data_id,
                                 h.payload_length, block.checksum, status.label(), head);
                        count += 1;
                    }
                    Err(e) => {
                        println!("{count} block(s) before error");
                        println!("ERROR at offset {}: {e}", e.block_offset());
                        std::process::exit(1);
                    }
                }
            }
            println!("{count} block(s), no structural errors");
        }

        // ── Salvage ──────────────────────────────────────────────────────────
        Commands::Salvage { input, output, policy } => {
            let policy = load_policy(policy.as_ref())?;
            let report = salvage_file(&input, &output, &ClassTable::builtin(), &policy)?;
            println!("Salvaged: {} -> {}", input.display(), output.display());
            println!("  blocks written   {}", report.blocks_written);
            println!("  blocks restored  {}", report.blocks_restored);
            println!("  bytes discarded  {}", report.bytes_discarded);
            for repair in &report.repairs {
                println!("  repair at {:>10}  {:<15} resume {}",
                         repair.failed_at, repair.anchor().label(), repair.resume_at);
            }
            if let Some(at) = report.stopped_at {
                println!("  stopped at offset {at}: remainder unrecoverable");
            }
        }
    }

    Ok(())
}
