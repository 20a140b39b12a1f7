/*!
Live acquisition.

Sets up the boards and chips the way a run needs them, then polls the readout
FIFO until stopped: every non-empty readout is logged raw and decoded into
JSON lines.
*/

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use astropix::boards::{set_onchip_amplitude, InjectionBoard, VoltageBoard};
use astropix::source::RegisterSource;
use astropix::{
    Asic, ClockMode, DiagnosticSink, Nexys, ReadoutDecoder, TracingSink, TransportChannel,
};
use chrono::Local;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ChipSection, ReadoutConfig};
use crate::offline::format_raw_line;
use crate::tcp::TcpTransport;

/// Progress is logged every this many readouts
const PROGRESS_INTERVAL: u64 = 100;

/// Counters of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Non-empty readouts
    pub readouts: u64,
    pub hits: u64,
    pub decode_faults: u64,
}

/// Voltage board from the register file, or the generation default
pub fn voltage_board(source: &RegisterSource, chip: &ChipSection) -> Result<VoltageBoard> {
    let card = source
        .configcards
        .as_ref()
        .and_then(|cards| cards.voltagecard.as_ref());
    let mut board = match card {
        Some(spec) => VoltageBoard::from_spec(spec)?,
        None => VoltageBoard::default_for(chip.version),
    };
    board.set_vcal(chip.vcal)?;
    board.set_vsupply(chip.vsupply)?;
    if let Some(mv) = chip.threshold_mv {
        board.set_threshold_mv(mv)?;
    }
    Ok(board)
}

/// Apply the run's analog output and injection pixel to the chain
pub fn prepare_asic(asic: &mut Asic, config: &AppConfig) -> Result<()> {
    if let Some(col) = config.chip.ampout_col {
        info!("enabling analog output in column {}", col);
        asic.modify(|chips| chips.iter_mut().try_for_each(|chip| chip.enable_ampout_col(col)))?;
    }
    if let Some(injection) = &config.injection {
        let [col, row] = injection.pixel;
        asic.modify_chip(0, |chip| {
            chip.set_pixel_comparator(col, row, true)?;
            chip.set_inj_col(col, true)?;
            chip.set_inj_row(row, true)
        })?;
        if injection.onchip {
            set_onchip_amplitude(asic, injection.amplitude_volts())?;
        }
    }
    Ok(())
}

/// Poll the FIFO until stopped, a limit is hit or decode faults pile up
pub fn collect<T, S, R, H>(
    nexys: &mut Nexys<T>,
    decoder: &ReadoutDecoder<S>,
    config: &ReadoutConfig,
    running: &AtomicBool,
    mut raw: Option<&mut R>,
    hits_out: &mut H,
) -> Result<RunSummary>
where
    T: TransportChannel,
    S: DiagnosticSink,
    R: Write,
    H: Write,
{
    let mut summary = RunSummary::default();
    let mut consecutive_faults = 0;
    let max_time = config.max_time();
    let start = Instant::now();

    info!("Collecting data!");
    while running.load(Ordering::SeqCst) {
        if config.max_runs.is_some_and(|max| summary.readouts >= max) {
            break;
        }
        if max_time.is_some_and(|max| start.elapsed() >= max) {
            break;
        }

        if let Some(words) = config.sw_readout_words {
            nexys.write_spi_bytes(words)?;
        }
        let readout = nexys.read_spi_fifo(config.fifo_reads)?;
        if readout.is_empty() {
            continue;
        }

        let index = summary.readouts;
        summary.readouts += 1;
        if let Some(raw) = raw.as_deref_mut() {
            writeln!(raw, "{}", format_raw_line(index, &readout))?;
        }

        match decoder.decode_readout(&readout, index, ClockMode::Live) {
            Ok(hits) => {
                consecutive_faults = 0;
                for hit in &hits {
                    serde_json::to_writer(&mut *hits_out, hit)?;
                    writeln!(hits_out)?;
                }
                summary.hits += hits.len() as u64;
            }
            Err(e) if e.is_decode_fault() => {
                summary.decode_faults += 1;
                consecutive_faults += 1;
                warn!("Readout {}: {}", index, e);
                if consecutive_faults > config.max_decode_faults {
                    bail!(
                        "{} consecutive undecodable readouts, aborting run",
                        consecutive_faults
                    );
                }
            }
            Err(e) => return Err(e.into()),
        }

        if summary.readouts % PROGRESS_INTERVAL == 0 {
            info!("{} readout streams collected", summary.readouts);
        }
    }
    Ok(summary)
}

/// Output files of one run, named `<name>_<timestamp>`
struct RunFiles {
    raw: PathBuf,
    hits: PathBuf,
    snapshot: PathBuf,
}

impl RunFiles {
    fn new(config: &AppConfig) -> Result<Self> {
        let dir = &config.output.directory;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        let stem = if config.chip.name.is_empty() {
            timestamp.to_string()
        } else {
            format!("{}_{}", config.chip.name, timestamp)
        };
        Ok(Self {
            raw: dir.join(format!("{}.log", stem)),
            hits: dir.join(format!("{}.jsonl", stem)),
            snapshot: dir.join(format!("{}_config.toml", stem)),
        })
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Run a full acquisition against the board
pub fn run(config: &AppConfig, running: &AtomicBool, print_hits: bool) -> Result<RunSummary> {
    let version = config.chip.version;
    let source = RegisterSource::load(&config.chip.register_file).with_context(|| {
        format!("Failed to load register file: {}", config.chip.register_file.display())
    })?;
    let mut asic = Asic::from_source(&source, version)?;
    prepare_asic(&mut asic, config)?;

    let transport = TcpTransport::connect(&config.link.address, config.link.port, config.link.timeout())?;
    let mut nexys = Nexys::new(transport);
    nexys.test_io().context("Could not establish communication with the board")?;

    let vboard = voltage_board(&source, &config.chip)?;
    vboard.update(&mut nexys)?;

    let injection: Option<InjectionBoard> = match &config.injection {
        Some(settings) => {
            let mut board = settings.board()?;
            board.calibrate(vboard.vcal(), vboard.vsupply())?;
            Some(board)
        }
        None => None,
    };

    nexys.enable_spi(version.spi_clkdiv())?;
    nexys.chip_reset()?;
    asic.write_config(&mut nexys)?;
    info!("Chip configured");
    nexys.dump_fpga(config.readout.fifo_reads)?;

    let files = RunFiles::new(config)?;
    asic.to_source(source.configcards.clone())?
        .save(&files.snapshot)
        .with_context(|| format!("Failed to save {}", files.snapshot.display()))?;

    let mut raw = if config.output.raw_log {
        let mut raw = create(&files.raw)?;
        writeln!(raw, "# astropix-readout {} {} {}", astropix::VERSION, version, config.chip.register_file.display())?;
        Some(raw)
    } else {
        None
    };
    let mut hits = create(&files.hits)?;

    if let Some(board) = &injection {
        board.start(&mut nexys)?;
    }

    let decoder = ReadoutDecoder::for_chip(
        version,
        asic.num_chips(),
        asic.sampleclock_period_ns(),
        config.readout.reverse_bitorder,
    )?
    .with_prefilter(config.readout.prefilter_for(version));

    let result = if print_hits {
        let decoder = decoder.with_sink(TracingSink);
        collect(&mut nexys, &decoder, &config.readout, running, raw.as_mut(), &mut hits)
    } else {
        collect(&mut nexys, &decoder, &config.readout, running, raw.as_mut(), &mut hits)
    };

    if let Some(board) = &injection {
        if let Err(e) = board.stop(&mut nexys) {
            error!("Failed to stop injection: {}", e);
        }
    }
    if let Some(raw) = raw.as_mut() {
        raw.flush()?;
    }
    hits.flush()?;

    let summary = result?;
    if summary.readouts == 0 {
        warn!("No data recorded - removing empty output files");
        for path in [&files.raw, &files.hits] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
    } else {
        info!("Data written to {}", files.hits.display());
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use astropix::protocol::{SPI_CONFIG_REG, SPI_READ_FIFO_EMPTY, SPI_READ_REG, SPI_WRITE_FIFO_EMPTY};
    use astropix::source::{ConfigCards, VoltageCardSpec};
    use astropix::{ChipVersion, TransportError};

    use crate::config::InjectionConfig;

    /// Board whose read FIFO hands out scripted readouts one per read
    #[derive(Default)]
    struct FifoBoard {
        readouts: VecDeque<Vec<u8>>,
    }

    impl TransportChannel for FifoBoard {
        fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn read(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
            Ok(vec![0; n])
        }

        fn read_register(&mut self, addr: u8, _n: u16) -> Result<Vec<u8>, TransportError> {
            match addr {
                SPI_CONFIG_REG => {
                    let mut status = SPI_WRITE_FIFO_EMPTY;
                    if self.readouts.is_empty() {
                        status |= SPI_READ_FIFO_EMPTY;
                    }
                    Ok(vec![status])
                }
                SPI_READ_REG => self.readouts.pop_front().ok_or(TransportError::Closed),
                _ => Ok(vec![0]),
            }
        }
    }

    const HIT: [u8; 5] = [0x04, 0x85, 200, 0x03, 0x10];

    fn board(readouts: Vec<Vec<u8>>) -> Nexys<FifoBoard> {
        Nexys::new(FifoBoard {
            readouts: readouts.into(),
        })
    }

    fn decoder() -> ReadoutDecoder {
        ReadoutDecoder::for_chip(ChipVersion::V3, 1, 5.0, false)
            .unwrap()
            .with_prefilter(true)
    }

    #[test]
    fn test_collect_logs_and_decodes() {
        let mut with_idle = vec![0xff];
        with_idle.extend_from_slice(&HIT);
        let mut nexys = board(vec![HIT.to_vec(), vec![0x33, 0x01], with_idle]);
        let config = ReadoutConfig {
            fifo_reads: 1,
            max_runs: Some(3),
            ..ReadoutConfig::default()
        };
        let running = AtomicBool::new(true);
        let mut raw = Vec::new();
        let mut hits = Vec::new();

        let summary = collect(&mut nexys, &decoder(), &config, &running, Some(&mut raw), &mut hits).unwrap();
        assert_eq!(
            summary,
            RunSummary {
                readouts: 3,
                hits: 2,
                decode_faults: 1
            }
        );

        let raw = String::from_utf8(raw).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines, ["0\tb'0485c80310'", "1\tb'3301'", "2\tb'ff0485c80310'"]);

        let hits = String::from_utf8(hits).unwrap();
        let last: serde_json::Value = serde_json::from_str(hits.lines().last().unwrap()).unwrap();
        assert_eq!(last["readout"], 2);
        assert!(last["hittime"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_collect_aborts_on_consecutive_faults() {
        let mut nexys = board(vec![vec![0x33]; 3]);
        let config = ReadoutConfig {
            fifo_reads: 1,
            max_decode_faults: 1,
            ..ReadoutConfig::default()
        };
        let running = AtomicBool::new(true);
        let mut hits = Vec::new();

        let err = collect(&mut nexys, &decoder(), &config, &running, None::<&mut Vec<u8>>, &mut hits)
            .unwrap_err();
        assert!(err.to_string().contains("2 consecutive"));
    }

    #[test]
    fn test_collect_stops_when_flag_cleared() {
        let mut nexys = board(vec![HIT.to_vec()]);
        let running = AtomicBool::new(false);
        let mut hits = Vec::new();
        let summary = collect(
            &mut nexys,
            &decoder(),
            &ReadoutConfig::default(),
            &running,
            None::<&mut Vec<u8>>,
            &mut hits,
        )
        .unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    const REGISTER_FILE: &str = r#"
[telescope]
nchips = 1

[general]
sampleclockperiod_ns = 5

[geometry]
cols = 2
rows = 2

[[chips]]
[chips.config.vdacs]
vinj = [10, 0]

[chips.config.recconfig]
col0 = [5, 6]
col1 = [5, 6]
"#;

    #[test]
    fn test_voltage_board_selection() {
        let mut source = RegisterSource::from_toml_str(REGISTER_FILE).unwrap();
        let mut chip = ChipSection {
            version: ChipVersion::V2,
            threshold_mv: Some(100.0),
            ..ChipSection::default()
        };

        let board = voltage_board(&source, &chip).unwrap();
        assert_eq!(board.pos(), VoltageBoard::DEFAULT_POS);
        assert_eq!(board.dacs()[0], 0.0);
        assert!((board.dacs()[7] - 1.1).abs() < 1e-12);
        assert_eq!(board.vsupply(), 2.7);

        source.configcards = Some(ConfigCards {
            voltagecard: Some(VoltageCardSpec {
                pos: 2,
                dacs: vec![0.5, 0.6],
            }),
            injectioncard: None,
        });
        chip.threshold_mv = None;
        let board = voltage_board(&source, &chip).unwrap();
        assert_eq!(board.pos(), 2);
        assert_eq!(board.dacs(), &[0.5, 0.6]);
    }

    #[test]
    fn test_prepare_asic() {
        let source = RegisterSource::from_toml_str(REGISTER_FILE).unwrap();
        let mut asic = Asic::from_source(&source, ChipVersion::V3).unwrap();
        let mut config = AppConfig::new();
        config.chip.ampout_col = Some(1);
        config.injection = Some(InjectionConfig {
            pixel: [1, 0],
            amplitude_mv: 450.0,
            ..InjectionConfig::default()
        });

        prepare_asic(&mut asic, &config).unwrap();
        let chip = asic.chip(0).unwrap();
        assert!(chip.pixel_enabled(1, 0).unwrap());
        assert!(!chip.pixel_enabled(1, 1).unwrap());
        assert!(chip.column_word(1).unwrap().ampout());
        assert!(chip.column_word(1).unwrap().col_injection());
        assert!(chip.column_word(0).unwrap().row_injection());
        assert_eq!(chip.field("vdacs", "vinj").unwrap().value(), 256);

        config.injection = Some(InjectionConfig {
            pixel: [5, 0],
            ..InjectionConfig::default()
        });
        assert!(prepare_asic(&mut asic, &config).is_err());
    }
}
