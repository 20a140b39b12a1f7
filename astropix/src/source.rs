/*!
Declarative register source.

A register file describes the chain and every register of every chip as
ordered `name = [width, value]` pairs:

```toml
[telescope]
nchips = 1

[general]
sampleclockperiod_ns = 5

[geometry]
cols = 35
rows = 35

[[chips]]
[chips.config.digitalconfig]
interrupt_pushpull = [1, 1]
en_stat = [1, 0]

[chips.config.vdacs]
thpix = [10, 682]
```

Document order is the physical bit order of the shift register, so every
table is read into an [`IndexMap`] and never re-sorted.
*/

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::register::{ChipConfig, ChipVersion, Geometry, RegisterField, RegisterGroup};

/// `[width, value]` pair of one register field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec(pub u32, pub u64);

impl FieldSpec {
    pub fn width(self) -> u32 {
        self.0
    }

    pub fn value(self) -> u64 {
        self.1
    }
}

/// Ordered `field -> [width, value]` table
pub type FieldTable = IndexMap<String, FieldSpec>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telescope {
    pub nchips: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct General {
    pub sampleclockperiod_ns: f64,
}

/// Voltage board slot and DAC voltages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageCardSpec {
    pub pos: u8,
    pub dacs: Vec<f64>,
}

/// Injection board slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionCardSpec {
    pub pos: u8,
}

/// GECCO cards plugged next to the chip carrier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigCards {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltagecard: Option<VoltageCardSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injectioncard: Option<InjectionCardSpec>,
}

/// Registers of one chip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipSource {
    pub config: IndexMap<String, FieldTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdac_config: Option<FieldTable>,
}

impl ChipSource {
    /// Snapshot the current values of a chip
    pub fn from_chip(chip: &ChipConfig) -> Self {
        let config = chip
            .groups()
            .iter()
            .map(|group| (group.name().to_string(), field_table(group)))
            .collect();
        Self {
            config,
            tdac_config: chip.tdac().map(field_table),
        }
    }

    fn to_chip(&self, version: ChipVersion, index: usize, geometry: Geometry) -> Result<ChipConfig> {
        let mut chip = ChipConfig::new(version, index, geometry);
        for (name, fields) in &self.config {
            chip.push_group(register_group(name, fields)?)?;
        }
        if let Some(tdac) = &self.tdac_config {
            chip.set_tdac_group(register_group("tdac", tdac)?)?;
        }
        chip.check_geometry()?;
        Ok(chip)
    }
}

fn register_group(name: &str, fields: &FieldTable) -> Result<RegisterGroup> {
    let mut group = RegisterGroup::new(name);
    for (field, spec) in fields {
        let field = RegisterField::new(field.as_str(), spec.width(), spec.value()).map_err(|err| match err {
            Error::OutOfRange { name: field_name, value, width } => {
                Error::out_of_range(format!("{}.{}", name, field_name), value, width)
            }
            other => other,
        })?;
        group.push(field)?;
    }
    Ok(group)
}

fn field_table(group: &RegisterGroup) -> FieldTable {
    group
        .fields()
        .iter()
        .map(|f| (f.name().to_string(), FieldSpec(f.width(), f.value())))
        .collect()
}

/// Parsed register file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSource {
    pub telescope: Telescope,
    pub general: General,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configcards: Option<ConfigCards>,
    #[serde(default)]
    pub chips: Vec<ChipSource>,
}

impl RegisterSource {
    /// Parse a register file from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a register file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = Self::from_toml_str(&fs::read_to_string(path)?)?;
        info!("Loaded register file {} ({} chip(s))", path.display(), source.chips.len());
        Ok(source)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Write the register file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), self.to_toml_string()?)?;
        info!("Saved register file {}", path.as_ref().display());
        Ok(())
    }

    /// Snapshot a configured chain, e.g. to save the state at the end of a run
    pub fn from_chips(
        chips: &[ChipConfig],
        sampleclockperiod_ns: f64,
        configcards: Option<ConfigCards>,
    ) -> Result<Self> {
        let first = chips.first().ok_or(Error::NotInitialized)?;
        Ok(Self {
            telescope: Telescope { nchips: chips.len() },
            general: General { sampleclockperiod_ns },
            geometry: Some(first.geometry()),
            configcards,
            chips: chips.iter().map(ChipSource::from_chip).collect(),
        })
    }

    pub fn nchips(&self) -> usize {
        self.telescope.nchips
    }

    pub fn sampleclockperiod_ns(&self) -> f64 {
        self.general.sampleclockperiod_ns
    }

    /// Build the chain configuration, chip 0 first
    pub fn chips(&self, version: ChipVersion) -> Result<Vec<ChipConfig>> {
        let geometry = self
            .geometry
            .ok_or_else(|| Error::config("Register file has no [geometry] table"))?;
        geometry.validate()?;
        if self.chips.is_empty() {
            return Err(Error::config("Register file has no [[chips]] entries"));
        }
        if self.chips.len() != self.telescope.nchips {
            return Err(Error::config(format!(
                "Telescope declares {} chip(s) but {} are configured",
                self.telescope.nchips,
                self.chips.len()
            )));
        }

        self.chips
            .iter()
            .enumerate()
            .map(|(index, chip)| chip.to_chip(version, index, geometry))
            .collect()
    }
}
