/*!
# AstroPix Readout Application

Configures AstroPix chips through a readout board bridged to TCP, collects
their hit stream and decodes it into JSON lines.

## Usage

### Live acquisition
```bash
astropix-readout acquire --config astropix.toml --max-runs 1000
```

### Offline decoding of a raw log
```bash
astropix-readout decode run_20240101-120000.log --chip-version 3
```

### Dry run of the configuration frames
```bash
astropix-readout vector config/testconfig.toml --chip-version 3
```

### Default configuration file
```bash
astropix-readout config --output astropix.toml
```
*/

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use astropix::framer::SpiTarget;
use astropix::source::RegisterSource;
use astropix::{Asic, ChipVersion, DiagnosticSink, ReadoutDecoder, SerialFramer, TracingSink};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

mod acquire;
mod config;
mod offline;
mod tcp;

use config::AppConfig;
use offline::RawLogParser;

#[derive(Parser)]
#[command(name = "astropix-readout")]
#[command(about = "AstroPix configuration, acquisition and hit decoding")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level: error, warn, info, debug or trace
    #[arg(short = 'L', long, default_value = "info", global = true)]
    log_level: LevelFilter,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the chips and collect hits
    Acquire {
        /// Configuration file path
        #[arg(short, long, default_value = "astropix.toml")]
        config: PathBuf,

        /// Stop after this many non-empty readouts
        #[arg(short = 'r', long)]
        max_runs: Option<u64>,

        /// Stop after this many minutes
        #[arg(short = 'M', long)]
        max_time: Option<f64>,

        /// Log every decoded hit
        #[arg(long)]
        print_hits: bool,
    },

    /// Decode a raw readout log
    Decode {
        /// Raw log written by `acquire`
        input: PathBuf,

        /// Output path for the JSON lines (default: input with .jsonl extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Chip generation (1-4)
        #[arg(short = 'V', long, default_value_t = 3)]
        chip_version: u8,

        /// Chips in the daisy chain
        #[arg(short, long, default_value_t = 1)]
        nchips: usize,

        /// Sample clock period in ns
        #[arg(long, default_value_t = 5.0)]
        sampleclock_period_ns: f64,

        /// Hit bytes arrive bit reversed
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        reverse_bitorder: bool,

        /// Stream pre-filter (default: by chip version)
        #[arg(long, action = clap::ArgAction::Set)]
        prefilter: Option<bool>,

        /// Log every decoded hit
        #[arg(long)]
        print_hits: bool,
    },

    /// Print the configuration frames of a register file
    Vector {
        /// Register file (TOML)
        register_file: PathBuf,

        /// Chip generation (1-4)
        #[arg(short = 'V', long, default_value_t = 3)]
        chip_version: u8,

        /// Shift clock divider
        #[arg(long, default_value_t = SerialFramer::DEFAULT_CLKDIV)]
        clkdiv: u16,

        /// Emit the vector MSB first
        #[arg(long)]
        msb_first: bool,

        /// Print the SPI command vector instead of the shift-register frames
        #[arg(long)]
        spi: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "astropix.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for frame dumps
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(cli.log_level)
        .init();

    match cli.command {
        Commands::Acquire { config, max_runs, max_time, print_hits } => {
            run_acquire(config, max_runs, max_time, print_hits)
        }
        Commands::Decode {
            input,
            output,
            chip_version,
            nchips,
            sampleclock_period_ns,
            reverse_bitorder,
            prefilter,
            print_hits,
        } => {
            let version = ChipVersion::new(chip_version)?;
            let decoder = ReadoutDecoder::for_chip(version, nchips, sampleclock_period_ns, reverse_bitorder)?
                .with_prefilter(prefilter.unwrap_or_else(|| version.prefilter_default()));
            let output = output.unwrap_or_else(|| input.with_extension("jsonl"));
            if print_hits {
                run_decode(&input, &output, &decoder.with_sink(TracingSink))
            } else {
                run_decode(&input, &output, &decoder)
            }
        }
        Commands::Vector { register_file, chip_version, clkdiv, msb_first, spi } => {
            print_vector(register_file, chip_version, clkdiv, msb_first, spi)
        }
        Commands::Config { output } => generate_config_file(output),
    }
}

/// Live acquisition from a configuration file
fn run_acquire(
    config_path: PathBuf,
    max_runs: Option<u64>,
    max_time: Option<f64>,
    print_hits: bool,
) -> Result<()> {
    let mut config = AppConfig::load_from_file(&config_path)?;
    if max_runs.is_some() {
        config.readout.max_runs = max_runs;
    }
    if max_time.is_some() {
        config.readout.max_time_min = max_time;
    }

    info!("🚀 Starting acquisition from config: {}", config_path.display());

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down gracefully...");
        flag.store(false, Ordering::SeqCst);
    })?;

    let summary = acquire::run(&config, &running, print_hits)?;
    info!(
        "✅ Acquisition completed: {} readouts, {} hits, {} undecodable",
        summary.readouts, summary.hits, summary.decode_faults
    );
    Ok(())
}

fn run_decode<S: DiagnosticSink>(
    input: &Path,
    output: &Path,
    decoder: &ReadoutDecoder<S>,
) -> Result<()> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("Failed to open raw log: {}", input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?,
    );

    let summary = RawLogParser::new()?.decode_log(reader, decoder, &mut writer)?;
    writer.flush()?;

    info!(
        "✅ Wrote {} hits to {} ({} of {} readouts undecodable)",
        summary.hits,
        output.display(),
        summary.undecodable,
        summary.readouts
    );
    Ok(())
}

/// Dump the frames that would configure the chain, one hex line each
fn print_vector(
    register_file: PathBuf,
    chip_version: u8,
    clkdiv: u16,
    msb_first: bool,
    spi: bool,
) -> Result<()> {
    let version = ChipVersion::new(chip_version)?;
    let source = RegisterSource::load(&register_file)
        .with_context(|| format!("Failed to load register file: {}", register_file.display()))?;
    let asic = Asic::from_source(&source, version)?
        .with_clkdiv(clkdiv)
        .with_msb_first(msb_first);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if spi {
        writeln!(out, "{}", hex::encode(asic.spi_config_vector(SpiTarget::Broadcast)?))?;
        return Ok(());
    }

    let vector = asic.vector()?;
    info!("{} chip(s), {} configuration bits", asic.num_chips(), vector.len());
    for (i, frame) in asic.config_frames()?.iter().enumerate() {
        writeln!(out, "{}\t{}", i, hex::encode(frame))?;
    }
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    info!("✅ Generated configuration file: {}", output_path.display());
    info!("📝 Edit the file to customize settings, then run:");
    info!("   astropix-readout acquire --config {}", output_path.display());

    Ok(())
}
