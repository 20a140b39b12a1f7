/*!
Configuration management for the readout application.
*/

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use astropix::boards::{InjectionBoard, InjectionSettings};
use astropix::ChipVersion;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub chip: ChipSection,
    pub link: LinkConfig,
    pub readout: ReadoutConfig,
    pub output: OutputConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection: Option<InjectionConfig>,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            chip: ChipSection::default(),
            link: LinkConfig::default(),
            readout: ReadoutConfig::default(),
            output: OutputConfig::default(),
            injection: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Chip under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipSection {
    /// Chip generation (1-4)
    pub version: ChipVersion,

    /// Register file (TOML) with the chain configuration
    pub register_file: PathBuf,

    /// Prefix for output file names
    pub name: String,

    /// Comparator threshold above baseline in mV; the voltage board default otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_mv: Option<f64>,

    /// Column routed to the analog output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ampout_col: Option<u32>,

    /// Voltage board calibration
    pub vcal: f64,

    /// Voltage board supply
    pub vsupply: f64,
}

impl Default for ChipSection {
    fn default() -> Self {
        Self {
            version: ChipVersion::V3,
            register_file: PathBuf::from("config/testconfig.toml"),
            name: String::new(),
            threshold_mv: None,
            ampout_col: Some(0),
            vcal: 0.989,
            vsupply: 2.7,
        }
    }
}

/// TCP bridge to the readout board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub address: String,
    pub port: u16,
    /// Connect and read timeout in milliseconds
    pub timeout_ms: u64,
}

impl LinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 5000,
            timeout_ms: 2000,
        }
    }
}

/// Acquisition loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadoutConfig {
    /// Consecutive decode faults tolerated before the run aborts
    pub max_decode_faults: usize,

    /// FIFO blocks read per readout cycle
    pub fifo_reads: usize,

    /// Hit bytes arrive bit reversed
    pub reverse_bitorder: bool,

    /// Stream pre-filter; the chip version decides when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefilter: Option<bool>,

    /// Clock this many 8-byte empty words through the chain before every read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_readout_words: Option<usize>,

    /// Stop after this many non-empty readouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u64>,

    /// Stop after this many minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_min: Option<f64>,
}

impl ReadoutConfig {
    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_min
            .filter(|m| *m >= 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0))
    }

    pub fn prefilter_for(&self, version: ChipVersion) -> bool {
        self.prefilter.unwrap_or_else(|| version.prefilter_default())
    }
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            max_decode_faults: 100,
            fifo_reads: 64,
            reverse_bitorder: true,
            prefilter: None,
            sw_readout_words: None,
            max_runs: None,
            max_time_min: None,
        }
    }
}

/// Output files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub directory: PathBuf,

    /// Keep the raw hex log next to the decoded hits
    pub raw_log: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            raw_log: true,
        }
    }
}

/// Charge injection into one pixel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionConfig {
    /// Use the chip's own injection DAC instead of the injection board
    pub onchip: bool,

    /// Injection board slot
    pub pos: u8,

    /// Pulse amplitude in mV
    pub amplitude_mv: f64,

    /// Injected pixel as `[col, row]`
    pub pixel: [u32; 2],

    pub period: u8,
    pub cycle: u16,
    pub clkdiv: u16,
    pub initdelay: u16,
    pub pulses_per_set: u8,
}

impl InjectionConfig {
    pub fn settings(&self) -> InjectionSettings {
        InjectionSettings {
            period: self.period,
            cycle: self.cycle,
            clkdiv: self.clkdiv,
            initdelay: self.initdelay,
            pulses_per_set: self.pulses_per_set,
        }
    }

    pub fn amplitude_volts(&self) -> f64 {
        self.amplitude_mv / 1000.0
    }

    /// Pattern generator for these settings
    pub fn board(&self) -> Result<InjectionBoard> {
        if self.onchip {
            Ok(InjectionBoard::on_chip(self.settings()))
        } else {
            InjectionBoard::off_chip(self.pos, self.amplitude_volts(), self.settings())
                .context("Invalid injection board settings")
        }
    }
}

impl Default for InjectionConfig {
    fn default() -> Self {
        let settings = InjectionSettings::default();
        Self {
            onchip: true,
            pos: InjectionBoard::DEFAULT_POS,
            amplitude_mv: 300.0,
            pixel: [0, 0],
            period: settings.period,
            cycle: settings.cycle,
            clkdiv: settings.clkdiv,
            initdelay: settings.initdelay,
            pulses_per_set: settings.pulses_per_set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::new();
        original_config.injection = Some(InjectionConfig::default());
        original_config.readout.max_runs = Some(10);

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        // Save and load
        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(original_config, loaded_config);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.chip.version, ChipVersion::V3);
        assert_eq!(config.link.address, "127.0.0.1");
        assert_eq!(config.link.timeout(), Duration::from_secs(2));
        assert_eq!(config.readout.max_decode_faults, 100);
        assert!(config.readout.reverse_bitorder);
        assert!(config.readout.max_time().is_none());
        assert!(config.output.raw_log);
        assert!(config.injection.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let text = r#"
[chip]
version = 4
register_file = "chip.toml"
name = "run"
vcal = 1.0
vsupply = 3.3

[link]
address = "10.0.0.2"
port = 7000
timeout_ms = 500

[readout]
max_decode_faults = 3
fifo_reads = 1
reverse_bitorder = false
max_time_min = 0.5

[output]
directory = "out"
raw_log = false

[injection]
onchip = false
pos = 3
amplitude_mv = 2500.0
pixel = [4, 5]
period = 100
cycle = 0
clkdiv = 300
initdelay = 100
pulses_per_set = 1
"#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.chip.version, ChipVersion::V4);
        assert!(config.readout.prefilter_for(config.chip.version));
        assert_eq!(config.readout.max_time(), Some(Duration::from_secs(30)));

        let injection = config.injection.unwrap();
        assert_eq!(injection.pixel, [4, 5]);
        // 2.5 V exceeds the board DAC range
        assert!(injection.board().is_err());

        assert!(toml::from_str::<AppConfig>(&text.replace("version = 4", "version = 7")).is_err());
    }
}
