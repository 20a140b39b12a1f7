/*!
Single owner of a daisy chain's configuration.

All register mutations go through [`Asic::modify`], which applies the change
to a copy of the chain, rebuilds the configuration vector to validate it and
only then commits. A write to hardware therefore never sees a half-updated
chain. Changes take effect on the chip once [`Asic::write_config`] runs.
*/

use bytes::Bytes;
use tracing::info;

use crate::bits::BitVector;
use crate::error::{Error, Result};
use crate::framer::{asic_spi_vector, LoadStrobe, SerialFramer, SpiTarget};
use crate::nexys::Nexys;
use crate::register::{ChipConfig, ChipVersion, Geometry};
use crate::source::{ConfigCards, RegisterSource};
use crate::transport::TransportChannel;
use crate::vector::{dummy_vector, ConfigVectorBuilder};

/// Load strobe length, in SPI bytes, of an SPI configuration write
pub const SPI_LOAD_BYTES: usize = 10;

/// Configuration of every chip in one daisy chain
#[derive(Debug, Clone)]
pub struct Asic {
    chips: Vec<ChipConfig>,
    builder: ConfigVectorBuilder,
    framer: SerialFramer,
    sampleclock_period_ns: f64,
}

impl Asic {
    /// Take ownership of a chain, chip 0 first
    pub fn new(chips: Vec<ChipConfig>, sampleclock_period_ns: f64) -> Result<Self> {
        for chip in &chips {
            chip.check_geometry()?;
        }
        let asic = Self {
            chips,
            builder: ConfigVectorBuilder::new(),
            framer: SerialFramer::default(),
            sampleclock_period_ns,
        };
        asic.vector()?;
        info!(
            "{} chain of {} chip(s) initialized",
            asic.version(),
            asic.num_chips()
        );
        Ok(asic)
    }

    /// Build the chain described by a register file
    pub fn from_source(source: &RegisterSource, version: ChipVersion) -> Result<Self> {
        Self::new(source.chips(version)?, source.sampleclockperiod_ns())
    }

    /// Use a different shift-register clock divider
    pub fn with_clkdiv(mut self, clkdiv: u16) -> Self {
        self.framer = SerialFramer::new(clkdiv);
        self
    }

    /// Emit vectors MSB first
    pub fn with_msb_first(mut self, msb_first: bool) -> Self {
        self.builder = self.builder.msb_first(msb_first);
        self
    }

    pub fn version(&self) -> ChipVersion {
        self.chips[0].version()
    }

    pub fn num_chips(&self) -> usize {
        self.chips.len()
    }

    pub fn geometry(&self) -> Geometry {
        self.chips[0].geometry()
    }

    pub fn sampleclock_period_ns(&self) -> f64 {
        self.sampleclock_period_ns
    }

    pub fn chips(&self) -> &[ChipConfig] {
        &self.chips
    }

    pub fn chip(&self, index: usize) -> Result<&ChipConfig> {
        self.chips
            .get(index)
            .ok_or_else(|| Error::config(format!("No chip {} in a chain of {}", index, self.chips.len())))
    }

    /// Apply `f` to the chain and commit only if the result still builds.
    ///
    /// On error the committed configuration is left untouched.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut [ChipConfig]) -> Result<R>) -> Result<R> {
        let mut staged = self.chips.clone();
        let result = f(&mut staged)?;
        self.builder.build_chain(&staged)?;
        self.chips = staged;
        Ok(result)
    }

    /// Apply `f` to one chip of the chain; see [`Asic::modify`]
    pub fn modify_chip<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut ChipConfig) -> Result<R>,
    ) -> Result<R> {
        let len = self.chips.len();
        self.modify(|chips| {
            let chip = chips
                .get_mut(index)
                .ok_or_else(|| Error::config(format!("No chip {} in a chain of {}", index, len)))?;
            f(chip)
        })
    }

    /// Configuration vector of the whole chain
    pub fn vector(&self) -> Result<BitVector> {
        self.builder.build_chain(&self.chips)
    }

    /// Every frame of a configuration write, including the first-generation dummy flush
    pub fn config_frames(&self) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        if self.version().needs_dummy_vector() {
            frames.extend(self.framer.asic_pattern(&dummy_vector(), Some(LoadStrobe::Config))?);
        }
        frames.extend(self.framer.asic_pattern(&self.vector()?, Some(LoadStrobe::Config))?);
        Ok(frames)
    }

    /// Write the configuration to the chain
    pub fn write_config<T: TransportChannel>(&self, nexys: &mut Nexys<T>) -> Result<()> {
        nexys.write_frames(&self.config_frames()?)?;
        info!("Wrote configbits successfully");
        Ok(())
    }

    /// Frames writing one row of trim DACs (version 4)
    pub fn tdac_frames(&self, row: u32) -> Result<Vec<Bytes>> {
        let bits = self.builder.build_chain_row(&self.chips, row)?;
        self.framer.asic_pattern(&bits, Some(LoadStrobe::Tdac))
    }

    /// Write one row of trim DACs
    pub fn write_tdac_row<T: TransportChannel>(&self, nexys: &mut Nexys<T>, row: u32) -> Result<()> {
        nexys.write_frames(&self.tdac_frames(row)?)?;
        info!("Wrote tdac row {}", row);
        Ok(())
    }

    /// Frames clocking the configuration back out of the shift register
    pub fn readback_frames(&self) -> Result<Vec<Bytes>> {
        self.framer.readback_pattern(&self.vector()?)
    }

    /// Start a shift-register readback; data arrives in the readback FIFO
    pub fn readback<T: TransportChannel>(&self, nexys: &mut Nexys<T>) -> Result<()> {
        nexys.write_frames(&self.readback_frames()?)
    }

    /// SPI command sequence carrying the configuration vector
    pub fn spi_config_vector(&self, target: SpiTarget) -> Result<Vec<u8>> {
        asic_spi_vector(&self.vector()?, true, SPI_LOAD_BYTES, target)
    }

    /// Write the configuration through the SPI interface
    pub fn write_config_spi<T: TransportChannel>(
        &self,
        nexys: &mut Nexys<T>,
        target: SpiTarget,
    ) -> Result<()> {
        info!("SPI Write Asic Config");
        nexys.write_spi(&self.spi_config_vector(target)?, true)
    }

    /// Snapshot the chain as a register file
    pub fn to_source(&self, configcards: Option<ConfigCards>) -> Result<RegisterSource> {
        RegisterSource::from_chips(&self.chips, self.sampleclock_period_ns, configcards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LD_ASIC, LD_TDAC_ASIC, SPI_CONFIG_REG, SPI_READ_FIFO_EMPTY, SPI_WRITE_FIFO_EMPTY};
    use crate::register::tests::small_chip;
    use crate::register::{RegisterField, RegisterGroup, VDAC_GROUP};
    use crate::transport::mock::MockTransport;
    use crate::vector::DUMMY_VECTOR_BITS;

    // digitalconfig 3 + vdacs 10 + recconfig 3 x 6
    const CHIP_BITS: usize = 31;

    fn header_len(frame: &[u8]) -> usize {
        usize::from(u16::from_be_bytes([frame[2], frame[3]]))
    }

    fn chain(version: ChipVersion, n: usize) -> Asic {
        let chips = (0..n).map(|i| small_chip(version, i)).collect();
        Asic::new(chips, 5.0).unwrap()
    }

    #[test]
    fn test_new_validates_chain() {
        assert!(matches!(Asic::new(Vec::new(), 5.0), Err(Error::NotInitialized)));
        let swapped = vec![small_chip(ChipVersion::V3, 1), small_chip(ChipVersion::V3, 0)];
        assert!(Asic::new(swapped, 5.0).is_err());

        let asic = chain(ChipVersion::V3, 2);
        assert_eq!(asic.num_chips(), 2);
        assert_eq!(asic.vector().unwrap().len(), 2 * CHIP_BITS);
        assert!(asic.chip(2).is_err());
    }

    #[test]
    fn test_modify_is_transactional() {
        let mut asic = chain(ChipVersion::V3, 2);
        let before = asic.chips().to_vec();

        let result = asic.modify(|chips| {
            chips[0].set_pixel_comparator(0, 0, true)?;
            chips[1].set_pixel_comparator(7, 0, true)
        });
        assert!(result.is_err());
        assert_eq!(asic.chips(), &before[..]);

        asic.modify_chip(1, |chip| chip.set_pixel_comparator(2, 1, true)).unwrap();
        assert!(asic.chip(1).unwrap().pixel_enabled(2, 1).unwrap());
        assert!(asic.modify_chip(5, |_| Ok(())).is_err());
    }

    #[test]
    fn test_write_config_loads_last_frame() {
        let asic = chain(ChipVersion::V3, 1).with_clkdiv(1);
        let mut nexys = Nexys::new(MockTransport::new());
        asic.write_config(&mut nexys).unwrap();

        let writes = &nexys.transport().writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(header_len(&writes[0]), CHIP_BITS * 5 + 30);
        let mut load = vec![LD_ASIC; 10];
        load.extend([0u8; 10]);
        assert!(writes[0].ends_with(&load));
    }

    #[test]
    fn test_first_generation_flushes_dummy_vector() {
        let asic = chain(ChipVersion::V1, 1);
        let frames = asic.config_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(header_len(&frames[0]), (DUMMY_VECTOR_BITS * 5 + 30) * 8);
        assert_eq!(header_len(&frames[1]), (CHIP_BITS * 5 + 30) * 8);

        assert_eq!(chain(ChipVersion::V3, 1).config_frames().unwrap().len(), 1);
    }

    #[test]
    fn test_tdac_row_write() {
        assert!(chain(ChipVersion::V3, 1).tdac_frames(0).is_err());

        let mut chip = small_chip(ChipVersion::V4, 0);
        let mut tdac = RegisterGroup::new("tdac");
        tdac.push(RegisterField::new("row0", 4, 0b1010).unwrap()).unwrap();
        chip.set_tdac_group(tdac).unwrap();
        let asic = Asic::new(vec![chip], 5.0).unwrap().with_clkdiv(1);

        let mut nexys = Nexys::new(MockTransport::new());
        asic.write_tdac_row(&mut nexys, 0).unwrap();
        let frame = &nexys.transport().writes[0];
        assert_eq!(header_len(frame), 4 * 5 + 30);
        assert!(frame.contains(&LD_TDAC_ASIC));
        assert!(!frame[4..].contains(&LD_ASIC));
    }

    #[test]
    fn test_readback_and_spi_vectors() {
        let asic = chain(ChipVersion::V3, 1).with_clkdiv(1);
        let frames = asic.readback_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(header_len(&frames[0]), (CHIP_BITS + 1) * 5);

        let spi = asic.spi_config_vector(SpiTarget::Broadcast).unwrap();
        assert_eq!(spi[0], 0x7E);
        assert_eq!(spi.len(), 1 + CHIP_BITS + 2 * SPI_LOAD_BYTES);

        let mut transport = MockTransport::new();
        transport
            .registers
            .insert(SPI_CONFIG_REG, SPI_WRITE_FIFO_EMPTY | SPI_READ_FIFO_EMPTY);
        let mut nexys = Nexys::new(transport);
        asic.write_config_spi(&mut nexys, SpiTarget::Chip(0)).unwrap();
        let written: Vec<u8> = nexys.transport().writes.iter().flat_map(|w| w[4..].to_vec()).collect();
        assert_eq!(written[0], 0x60);
        assert_eq!(written.len(), spi.len());
    }

    #[test]
    fn test_snapshot_to_source() {
        let mut asic = chain(ChipVersion::V3, 1);
        asic.modify_chip(0, |chip| chip.set_internal_vdac("thpix", 0.9)).unwrap();
        let source = asic.to_source(None).unwrap();
        let reloaded = Asic::from_source(&source, ChipVersion::V3).unwrap();
        assert_eq!(reloaded.chip(0).unwrap().field(VDAC_GROUP, "thpix").unwrap().value(), 512);
    }
}
