/*!
In-memory register model of one AstroPix chip.

Field order inside a group, and group order inside a chip, is the physical
bit order of the chip's shift register. Both containers are plain vectors
indexed by declared position and are never re-sorted.
*/

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bits::fits_width;
use crate::error::{Error, Result};

/// Group whose fields are shifted in bit-reversed order
pub const VDAC_GROUP: &str = "vdacs";

/// Group holding one pixel mask word per column (`col0`, `col1`, ...)
pub const RECCONFIG_GROUP: &str = "recconfig";

/// Supply voltage of the on-chip voltage DACs
pub const VDAC_VDDA: f64 = 1.8;

/// Resolution of the on-chip voltage DACs
pub const VDAC_BITS: u32 = 10;

/// One named, fixed-width register field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterField {
    name: String,
    width: u32,
    value: u64,
}

impl RegisterField {
    /// Create a field, rejecting widths outside 1..=64 and values that do not fit
    pub fn new(name: impl Into<String>, width: u32, value: u64) -> Result<Self> {
        let name = name.into();
        if width == 0 || width > 64 {
            return Err(Error::config(format!(
                "Field {} has unsupported width {}",
                name, width
            )));
        }
        if !fits_width(value, width) {
            return Err(Error::out_of_range(name, value, width));
        }
        Ok(Self { name, width, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Update the value, keeping the old one if the new value does not fit
    pub fn set_value(&mut self, value: u64) -> Result<()> {
        if !fits_width(value, self.width) {
            return Err(Error::out_of_range(self.name.clone(), value, self.width));
        }
        self.value = value;
        Ok(())
    }
}

/// Ordered collection of register fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterGroup {
    name: String,
    fields: Vec<RegisterField>,
}

impl RegisterGroup {
    /// Create a new empty group
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a field at the next position
    pub fn push(&mut self, field: RegisterField) -> Result<()> {
        if self.position(field.name()).is_some() {
            return Err(Error::config(format!(
                "Duplicate field {} in group {}",
                field.name(),
                self.name
            )));
        }
        self.fields.push(field);
        Ok(())
    }

    /// Declared position of a field
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisterField> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// Set a field value by name
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let group = &self.name;
        let field = self
            .fields
            .iter_mut()
            .find(|f| f.name() == name)
            .ok_or_else(|| Error::config(format!("Unknown field {} in group {}", name, group)))?;
        field.set_value(value)
    }

    /// Fields in declared (physical) order
    pub fn fields(&self) -> &[RegisterField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sum of all field widths in bits
    pub fn total_width(&self) -> usize {
        self.fields.iter().map(|f| f.width() as usize).sum()
    }
}

/// Chip generation; drives frame geometry and link settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChipVersion(u8);

impl ChipVersion {
    pub const V1: Self = Self(1);
    pub const V2: Self = Self(2);
    pub const V3: Self = Self(3);
    pub const V4: Self = Self(4);

    /// Parse a chip version, accepting generations 1 through 4
    pub fn new(version: u8) -> Result<Self> {
        match version {
            1..=4 => Ok(Self(version)),
            _ => Err(Error::config(format!("Unsupported chip version {}", version))),
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Bytes per hit frame in the readout stream
    pub fn bytes_per_hit(self) -> usize {
        if self.0 >= 4 {
            8
        } else {
            5
        }
    }

    /// SPI readout clock divider (100 MHz / clkdiv)
    pub fn spi_clkdiv(self) -> u8 {
        if self.0 >= 4 {
            40
        } else {
            255
        }
    }

    /// First generation needs its shift register flushed with a dummy vector
    pub fn needs_dummy_vector(self) -> bool {
        self.0 == 1
    }

    /// Per-row trim DACs exist only on version 4
    pub fn supports_tdac(self) -> bool {
        self.0 == 4
    }

    /// Whether the readout stream pre-filter applies by default
    pub fn prefilter_default(self) -> bool {
        self.0 >= 4
    }
}

impl TryFrom<u8> for ChipVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ChipVersion> for u8 {
    fn from(version: ChipVersion) -> u8 {
        version.0
    }
}

impl fmt::Display for ChipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "astropix{}", self.0)
    }
}

/// Pixel matrix dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub rows: u32,
    pub cols: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self { rows: 35, cols: 35 }
    }
}

impl Geometry {
    /// Largest row count whose mask word still fits in 64 bits
    pub const MAX_ROWS: u32 = u64::BITS - 3;

    pub fn validate(self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(Error::config(format!(
                "Empty pixel matrix {}x{}",
                self.cols, self.rows
            )));
        }
        if self.rows > Self::MAX_ROWS {
            return Err(Error::config(format!(
                "{} rows exceed the {} rows a column word can hold",
                self.rows,
                Self::MAX_ROWS
            )));
        }
        Ok(())
    }
}

/// Per-column pixel mask word.
///
/// Layout for `rows` rows:
/// - bit 0: row injection enable (for the row with the column's index)
/// - bits 1..=rows: comparator *disable*, one per row
/// - bit rows+1: column injection enable
/// - bit rows+2: analog mux (ampout) enable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelMaskWord {
    bits: u64,
    rows: u32,
}

impl PixelMaskWord {
    const ROW_INJECTION_BIT: u32 = 0;

    pub fn new(bits: u64, rows: u32) -> Self {
        Self { bits, rows }
    }

    /// Every comparator disabled, no injection, no analog output
    pub fn all_disabled(rows: u32) -> Self {
        let rows_mask = 1u64.checked_shl(rows).map_or(u64::MAX, |bit| bit - 1);
        Self::new(rows_mask.wrapping_shl(1), rows)
    }

    pub fn value(self) -> u64 {
        self.bits
    }

    /// Number of bits the word occupies
    pub fn width(self) -> u32 {
        self.rows + 3
    }

    fn col_injection_bit(self) -> u32 {
        self.rows + 1
    }

    fn ampout_bit(self) -> u32 {
        self.rows + 2
    }

    fn set_bit(&mut self, bit: u32, on: bool) {
        if on {
            self.bits |= 1 << bit;
        } else {
            self.bits &= !(1 << bit);
        }
    }

    pub fn comparator_enabled(self, row: u32) -> bool {
        self.bits & (1 << (row + 1)) == 0
    }

    pub fn set_comparator(&mut self, row: u32, enable: bool) {
        self.set_bit(row + 1, !enable);
    }

    pub fn row_injection(self) -> bool {
        self.bits & (1 << Self::ROW_INJECTION_BIT) != 0
    }

    pub fn set_row_injection(&mut self, enable: bool) {
        self.set_bit(Self::ROW_INJECTION_BIT, enable);
    }

    pub fn col_injection(self) -> bool {
        self.bits & (1 << self.col_injection_bit()) != 0
    }

    pub fn set_col_injection(&mut self, enable: bool) {
        self.set_bit(self.col_injection_bit(), enable);
    }

    pub fn ampout(self) -> bool {
        self.bits & (1 << self.ampout_bit()) != 0
    }

    pub fn set_ampout(&mut self, enable: bool) {
        self.set_bit(self.ampout_bit(), enable);
    }
}

/// Complete register state of one chip in the daisy chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipConfig {
    version: ChipVersion,
    chip_index: usize,
    geometry: Geometry,
    groups: Vec<RegisterGroup>,
    tdac: Option<RegisterGroup>,
}

impl ChipConfig {
    /// Create an empty chip configuration
    pub fn new(version: ChipVersion, chip_index: usize, geometry: Geometry) -> Self {
        Self {
            version,
            chip_index,
            geometry,
            groups: Vec::new(),
            tdac: None,
        }
    }

    pub fn version(&self) -> ChipVersion {
        self.version
    }

    /// Position in the daisy chain
    pub fn chip_index(&self) -> usize {
        self.chip_index
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// True once at least one register group has been loaded
    pub fn is_initialized(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Append a register group after the existing ones
    pub fn push_group(&mut self, group: RegisterGroup) -> Result<()> {
        if self.group(group.name()).is_some() {
            return Err(Error::config(format!("Duplicate register group {}", group.name())));
        }
        self.groups.push(group);
        Ok(())
    }

    /// Groups in shift order
    pub fn groups(&self) -> &[RegisterGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&RegisterGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    fn group_mut(&mut self, name: &str) -> Result<&mut RegisterGroup> {
        self.groups
            .iter_mut()
            .find(|g| g.name() == name)
            .ok_or_else(|| Error::config(format!("Register group {} not found", name)))
    }

    /// Look up a field by group and name
    pub fn field(&self, group: &str, name: &str) -> Result<&RegisterField> {
        self.group(group)
            .ok_or_else(|| Error::config(format!("Register group {} not found", group)))?
            .get(name)
            .ok_or_else(|| Error::config(format!("Unknown field {} in group {}", name, group)))
    }

    /// Set a field value by group and name
    pub fn set_field(&mut self, group: &str, name: &str, value: u64) -> Result<()> {
        self.group_mut(group)?.set(name, value)
    }

    /// Per-row trim register group (version 4)
    pub fn tdac(&self) -> Option<&RegisterGroup> {
        self.tdac.as_ref()
    }

    pub fn set_tdac_group(&mut self, group: RegisterGroup) -> Result<()> {
        if !self.version.supports_tdac() {
            return Err(Error::config(format!(
                "{} has no per-row trim DACs",
                self.version
            )));
        }
        self.tdac = Some(group);
        Ok(())
    }

    /// Trim field of one row
    pub fn tdac_row(&self, row: u32) -> Result<&RegisterField> {
        let tdac = self
            .tdac
            .as_ref()
            .ok_or_else(|| Error::config(format!("{} chip {} has no tdac config", self.version, self.chip_index)))?;
        tdac.get(&format!("row{}", row))
            .ok_or_else(|| Error::config(format!("No tdac entry for row {}", row)))
    }

    pub fn set_tdac_row(&mut self, row: u32, value: u64) -> Result<()> {
        self.check_row(row)?;
        let chip_index = self.chip_index;
        let tdac = self
            .tdac
            .as_mut()
            .ok_or_else(|| Error::config(format!("Chip {} has no tdac config", chip_index)))?;
        tdac.set(&format!("row{}", row), value)
    }

    fn check_row(&self, row: u32) -> Result<()> {
        if row >= self.geometry.rows {
            return Err(Error::config(format!(
                "Invalid row {} larger than {}",
                row, self.geometry.rows
            )));
        }
        Ok(())
    }

    fn check_col(&self, col: u32) -> Result<()> {
        if col >= self.geometry.cols {
            return Err(Error::config(format!(
                "Invalid column {} larger than {}",
                col, self.geometry.cols
            )));
        }
        Ok(())
    }

    /// Read the mask word of one column
    pub fn column_word(&self, col: u32) -> Result<PixelMaskWord> {
        self.check_col(col)?;
        let field = self.field(RECCONFIG_GROUP, &format!("col{}", col))?;
        let word = PixelMaskWord::new(field.value(), self.geometry.rows);
        if field.width() < word.width() {
            return Err(Error::config(format!(
                "Column word {} is {} bits, geometry needs {}",
                field.name(),
                field.width(),
                word.width()
            )));
        }
        Ok(word)
    }

    fn store_column_word(&mut self, col: u32, word: PixelMaskWord) -> Result<()> {
        self.set_field(RECCONFIG_GROUP, &format!("col{}", col), word.value())
    }

    fn update_column_word(&mut self, col: u32, f: impl FnOnce(&mut PixelMaskWord)) -> Result<()> {
        let mut word = self.column_word(col)?;
        f(&mut word);
        self.store_column_word(col, word)
    }

    /// Enable or disable the comparator of one pixel
    pub fn set_pixel_comparator(&mut self, col: u32, row: u32, enable: bool) -> Result<()> {
        self.check_row(row)?;
        self.update_column_word(col, |w| w.set_comparator(row, enable))
    }

    /// Whether a pixel's comparator is enabled
    pub fn pixel_enabled(&self, col: u32, row: u32) -> Result<bool> {
        self.check_row(row)?;
        Ok(self.column_word(col)?.comparator_enabled(row))
    }

    /// Row injection switch; lives in bit 0 of the word with the row's index
    pub fn set_inj_row(&mut self, row: u32, enable: bool) -> Result<()> {
        self.check_row(row)?;
        self.update_column_word(row, |w| w.set_row_injection(enable))
    }

    /// Column injection switch
    pub fn set_inj_col(&mut self, col: u32, enable: bool) -> Result<()> {
        self.update_column_word(col, |w| w.set_col_injection(enable))
    }

    /// Route one column to the analog mux and disconnect all others
    pub fn enable_ampout_col(&mut self, col: u32) -> Result<()> {
        self.check_col(col)?;
        for c in 0..self.geometry.cols {
            self.update_column_word(c, |w| w.set_ampout(c == col))?;
        }
        Ok(())
    }

    /// Check the geometry and that every column word is wide enough for it
    pub fn check_geometry(&self) -> Result<()> {
        self.geometry.validate()?;
        let needed = PixelMaskWord::all_disabled(self.geometry.rows).width();
        if let Some(group) = self.group(RECCONFIG_GROUP) {
            if let Some(field) = group.fields().iter().find(|f| f.width() < needed) {
                return Err(Error::config(format!(
                    "Column word {} is {} bits, {} rows need {}",
                    field.name(),
                    field.width(),
                    self.geometry.rows,
                    needed
                )));
            }
        }
        Ok(())
    }

    /// Reset every column word to the all-disabled mask
    pub fn reset_recconfig(&mut self) -> Result<()> {
        let rows = self.geometry.rows;
        let group = self.group_mut(RECCONFIG_GROUP)?;
        let names: Vec<String> = group.fields().iter().map(|f| f.name().to_string()).collect();
        for name in names {
            group.set(&name, PixelMaskWord::all_disabled(rows).value())?;
        }
        Ok(())
    }

    /// Set an on-chip voltage DAC from a voltage in volts
    pub fn set_internal_vdac(&mut self, name: &str, voltage: f64) -> Result<()> {
        if !(0.0..=VDAC_VDDA).contains(&voltage) {
            return Err(Error::config(format!(
                "Can not set internal vdac {} to {} V",
                name, voltage
            )));
        }
        let dacval = (voltage / VDAC_VDDA * f64::from(1u32 << VDAC_BITS)) as u64;
        self.set_field(VDAC_GROUP, name, dacval)?;
        tracing::info!("Set internal vdac: {} to {} V (dacval: {})", name, voltage, dacval);
        Ok(())
    }
}
