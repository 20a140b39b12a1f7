/*!
Configuration vector generation.

Serializes register groups into the bit order the chip's shift register
expects. Groups are walked in their declared order and fields within a group
in their declared order; each field contributes a fixed-width MSB-first slice.
The `vdacs` group is wired in reverse, so each of its slices is flipped
individually. Unless MSB-first is requested the per-chip vector is then
reversed as a whole.

For a daisy chain the last chip is emitted first: its bits have the longest
way to travel through the chain.
*/

use bitvec::prelude::*;
use tracing::{debug, info};

use crate::bits::{push_uint, BitVector};
use crate::error::{Error, Result};
use crate::register::{ChipConfig, VDAC_GROUP};

/// Bit length of the dummy vector flushed into first-generation chips
pub const DUMMY_VECTOR_BITS: usize = 245;

/// Builds shift-register payloads from chip configurations
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigVectorBuilder {
    msb_first: bool,
}

impl ConfigVectorBuilder {
    /// Builder with the default (reversed, LSB-first) output order
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit vectors MSB first instead of reversing them
    pub fn msb_first(mut self, msb_first: bool) -> Self {
        self.msb_first = msb_first;
        self
    }

    /// Full configuration vector of one chip
    pub fn build(&self, chip: &ChipConfig) -> Result<BitVector> {
        if !chip.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let mut bits = BitVector::new();
        for group in chip.groups() {
            let reversed = group.name() == VDAC_GROUP;
            for field in group.fields() {
                let start = bits.len();
                let label = format!("{}.{}", group.name(), field.name());
                push_uint(&mut bits, &label, field.value(), field.width())?;
                if reversed {
                    bits[start..].reverse();
                }
            }
        }

        if !self.msb_first {
            bits.reverse();
        }

        debug!("Generated chip_{} config vector ({} bits)", chip.chip_index(), bits.len());
        Ok(bits)
    }

    /// Configuration vector of a whole daisy chain, last chip first
    pub fn build_chain(&self, chips: &[ChipConfig]) -> Result<BitVector> {
        self.concat_chain(chips, |chip| self.build(chip))
    }

    /// Per-row trim vector of one chip
    pub fn build_row(&self, chip: &ChipConfig, row: u32) -> Result<BitVector> {
        if !chip.version().supports_tdac() {
            return Err(Error::config(format!(
                "{} does not support per-row trim vectors",
                chip.version()
            )));
        }
        let field = chip.tdac_row(row)?;

        let mut bits = BitVector::new();
        push_uint(&mut bits, field.name(), field.value(), field.width())?;
        if !self.msb_first {
            bits.reverse();
        }
        Ok(bits)
    }

    /// Per-row trim vector of a whole daisy chain, last chip first
    pub fn build_chain_row(&self, chips: &[ChipConfig], row: u32) -> Result<BitVector> {
        self.concat_chain(chips, |chip| self.build_row(chip, row))
    }

    fn concat_chain(
        &self,
        chips: &[ChipConfig],
        build: impl Fn(&ChipConfig) -> Result<BitVector>,
    ) -> Result<BitVector> {
        if chips.is_empty() {
            return Err(Error::NotInitialized);
        }
        check_chain_order(chips)?;

        let mut bits = BitVector::new();
        for chip in chips.iter().rev() {
            bits.extend_from_bitslice(&build(chip)?);
            info!("Generated chip_{} config successfully!", chip.chip_index());
        }
        Ok(bits)
    }
}

/// All-zero vector used to flush first-generation chips before configuring
pub fn dummy_vector() -> BitVector {
    bitvec![u8, Msb0; 0; DUMMY_VECTOR_BITS]
}

fn check_chain_order(chips: &[ChipConfig]) -> Result<()> {
    let version = chips[0].version();
    for (index, chip) in chips.iter().enumerate() {
        if chip.chip_index() != index {
            return Err(Error::config(format!(
                "Chip at chain position {} declares index {}",
                index,
                chip.chip_index()
            )));
        }
        if chip.version() != version {
            return Err(Error::config(format!(
                "Mixed chip versions in chain: {} and {}",
                version,
                chip.version()
            )));
        }
    }
    Ok(())
}
