//! # ibrowser: Pairwise Genotype-Distance Storage
//!
//! Inspection tools for the files an ingest run leaves behind.
//!
//! ## Usage
//! ```bash
//! # Verify a matrix ledger record by record
//! ibrowser inspect out/run_matrix.bin.gz --compression gz
//!
//! # Load a saved database and list its chromosomes and blocks
//! ibrowser summary out/run --blocks
//!
//! # Reopen a live register store read-only
//! ibrowser check-store out/run_chromosomes_chr1.bin --profile
//! ```

use std::path::Path;
use std::time::Instant;

use ibrowser::config::{Command, Config};
use ibrowser::data::BlockManager;
use ibrowser::io::{Compression, LedgerReader};
use ibrowser::pipelines::Database;
use ibrowser::utils::telemetry::{HeartbeatConfig, HeartbeatHandle, Stage, TelemetryBlackboard};
use ibrowser::{CounterWidth, Result};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber; `--profile` adds span timings on close
fn init_profiling(level: &str, profile: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let span_events = if profile { FmtSpan::CLOSE } else { FmtSpan::NONE };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(span_events)
                .with_target(false)
                .with_timer(fmt::time::uptime()),
        )
        .init();
}

fn run() -> Result<()> {
    let start = Instant::now();

    let config = Config::parse_and_validate()?;
    init_profiling(config.log_level(), config.profile);

    match &config.command {
        Command::Inspect {
            ledger,
            compression,
            width,
        } => {
            let compression = Compression::from_name(compression)?;
            let width = width.map(CounterWidth::from_bits).transpose()?;
            inspect(ledger, compression, width)?;
        }
        Command::Summary { prefix, blocks } => summary(prefix, *blocks)?,
        Command::CheckStore { store } => check_store(store)?,
    }

    eprintln!("\nCompleted in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn inspect(path: &Path, compression: Compression, width: Option<CounterWidth>) -> Result<()> {
    let mut reader = LedgerReader::open_for_read(path, compression)?;
    println!("serial\twidth\tlen\tchecksum\tnonzero\tmax");
    let mut records = 0u64;
    loop {
        let record = match width {
            Some(width) => reader.read(width)?,
            None => reader.read_next()?,
        };
        if record.is_terminal() {
            break;
        }
        let values = record.values.to_u64s();
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            record.header.serial,
            record.header.width,
            record.header.data_len,
            record.header.checksum,
            values.iter().filter(|&&v| v != 0).count(),
            values.iter().copied().max().unwrap_or(0),
        );
        records += 1;
    }
    println!("{} records verified, terminal record present", records);
    Ok(())
}

fn summary(prefix: &Path, list_blocks: bool) -> Result<()> {
    let telemetry = TelemetryBlackboard::new();
    let heartbeat = HeartbeatHandle::spawn(telemetry.clone(), HeartbeatConfig::default())?;
    telemetry.set_stage(Stage::Loading);

    let database = Database::load(prefix)?;

    telemetry.set_stage(Stage::Complete);
    heartbeat.shutdown();

    let metadata = database.metadata();
    println!(
        "samples: {}  snps: {}  blocks: {}  width: {}  block size: {}",
        metadata.num_samples,
        metadata.num_snps,
        metadata.num_blocks,
        metadata.parameters.width,
        metadata.parameters.block_size
    );
    println!("chromosome\tnumber\tmin\tmax\tsnps\tblocks");
    for chromosome in database.chromosomes() {
        let info = chromosome.info();
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            info.name, info.number, info.min_position, info.max_position, info.num_snps, info.num_blocks
        );
        if list_blocks {
            for block in chromosome.blocks() {
                if block.is_empty() {
                    println!("  #{}\tempty", block.number());
                } else {
                    println!(
                        "  #{}\t{}\t{}\t{}",
                        block.number(),
                        block.min_position(),
                        block.max_position(),
                        block.num_snps()
                    );
                }
            }
        }
    }
    Ok(())
}

fn check_store(path: &Path) -> Result<()> {
    let mut manager = BlockManager::open_existing(path)?;
    let store = manager.store();
    println!(
        "domain: {}  width: {}  samples: {}  registers: {}  register bytes: {}",
        manager.domain(),
        manager.width(),
        manager.dimension(),
        store.len(),
        store.register_length()
    );
    println!("position\tnumber\tsnps\tchecksum");
    for block in manager.blocks() {
        let register = store.read_register(block.position())?;
        println!(
            "{}\t{}\t{}\t{}",
            block.position(),
            block.number(),
            block.num_snps(),
            register.checksum()
        );
    }
    manager.close()
}
