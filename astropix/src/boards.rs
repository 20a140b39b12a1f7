/*!
GECCO carrier cards.

The voltage board holds eight 14-bit DACs loaded through the GECCO shift
pattern. The injection board is a pattern generator programmed register by
register; it pulses either its own voltage board output or the chip's on-chip
injection DAC.
*/

use tracing::{debug, info, warn};

use crate::asic::Asic;
use crate::bits::{push_uint, BitVector};
use crate::error::{Error, Result};
use crate::framer::SerialFramer;
use crate::nexys::Nexys;
use crate::protocol::WRITE_ADDRESS;
use crate::register::ChipVersion;
use crate::source::VoltageCardSpec;
use crate::transport::TransportChannel;

/// Board register fed by the voltage board shift pattern
pub const VOLTAGE_BOARD_ADDRESS: u8 = 12;

/// Clock divider of the voltage board shift pattern
pub const VOLTAGE_BOARD_CLKDIV: u16 = 8;

/// Full scale of a 14-bit voltage board DAC
const DAC_FULL_SCALE: f64 = 16383.0;
const DAC_BITS: u32 = 14;

/// Highest DAC output the chip tolerates
const DAC_MAX_VOLTAGE: f64 = 1.8;

/// Baseline DAC position used as the threshold reference
const BASELINE_DAC: usize = 3;

// Pattern generator registers
pub const PG_RESET: u8 = 2;
pub const PG_SUSPEND: u8 = 3;
pub const PG_WRITE: u8 = 4;
pub const PG_OUTPUT: u8 = 5;
pub const PG_ADDRESS: u8 = 6;
pub const PG_DATA: u8 = 7;

/// Pattern generator output driving the on-chip injection circuit
const PG_OUTPUT_ONCHIP: u8 = 2;

/// Pattern generator output driving the injection board's own DAC
const PG_OUTPUT_BOARD: u8 = 1;

const PG_TIMESTAMPS: [u8; 8] = [1, 3, 0, 0, 0, 0, 0, 0];
const PG_FLAGS: u8 = 0b010100;

/// Eight-DAC voltage board in one card slot
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageBoard {
    pos: u8,
    dacs: Vec<f64>,
    vcal: f64,
    vsupply: f64,
}

impl VoltageBoard {
    /// Slot used when the register file names none
    pub const DEFAULT_POS: u8 = 4;

    /// Board in slot `pos` (1-8); DAC values outside 0-1.8 V are written as 0
    pub fn new(pos: u8, dacs: &[f64]) -> Result<Self> {
        if !(1..=8).contains(&pos) {
            return Err(Error::config(format!("Voltage board slot {} not in 1..=8", pos)));
        }
        let mut board = Self {
            pos,
            dacs: Vec::new(),
            vcal: 1.0,
            vsupply: 3.3,
        };
        board.set_dacs(dacs);
        Ok(board)
    }

    /// Factory settings for a chip generation
    pub fn default_for(version: ChipVersion) -> Self {
        // thpmos is raised for the pmos pixels of later generations
        let thpmos = if version == ChipVersion::V2 { 0.0 } else { 1.1 };
        Self {
            pos: Self::DEFAULT_POS,
            dacs: vec![thpmos, 0.0, 1.1, 1.0, 0.0, 0.0, 1.0, 1.1],
            vcal: 1.0,
            vsupply: 3.3,
        }
    }

    /// Board described by a register file's `[configcards.voltagecard]`
    pub fn from_spec(spec: &VoltageCardSpec) -> Result<Self> {
        Self::new(spec.pos, &spec.dacs)
    }

    pub fn pos(&self) -> u8 {
        self.pos
    }

    pub fn dacs(&self) -> &[f64] {
        &self.dacs
    }

    pub fn set_dacs(&mut self, dacs: &[f64]) {
        self.dacs = dacs
            .iter()
            .map(|&v| {
                if (0.0..=DAC_MAX_VOLTAGE).contains(&v) {
                    v
                } else {
                    warn!("DAC value {} V out of range, writing 0", v);
                    0.0
                }
            })
            .collect();
    }

    /// Calibration: the measured output when a DAC is set to 1 V
    pub fn set_vcal(&mut self, vcal: f64) -> Result<()> {
        if !(0.9..=1.1).contains(&vcal) {
            return Err(Error::config(format!("vcal {} not in 0.9..=1.1", vcal)));
        }
        self.vcal = vcal;
        Ok(())
    }

    pub fn set_vsupply(&mut self, vsupply: f64) -> Result<()> {
        if !(2.7..=3.3).contains(&vsupply) {
            return Err(Error::config(format!("vsupply {} not in 2.7..=3.3", vsupply)));
        }
        self.vsupply = vsupply;
        Ok(())
    }

    pub fn vcal(&self) -> f64 {
        self.vcal
    }

    pub fn vsupply(&self) -> f64 {
        self.vsupply
    }

    /// Set the comparator threshold (last DAC) `mv` millivolts above the baseline
    pub fn set_threshold_mv(&mut self, mv: f64) -> Result<()> {
        let baseline = self.dacs.get(BASELINE_DAC).copied().unwrap_or(0.0);
        let threshold = mv / 1000.0 + baseline;
        if !(0.0..=1.5).contains(&threshold) {
            return Err(Error::config(format!(
                "Threshold {} V out of range of sensor",
                threshold
            )));
        }
        match self.dacs.last_mut() {
            Some(last) => *last = threshold,
            None => return Err(Error::config("Voltage board has no DACs")),
        }
        Ok(())
    }

    /// DAC code of one voltage
    fn dac_code(&self, voltage: f64) -> u64 {
        (voltage * DAC_FULL_SCALE / self.vsupply / self.vcal) as u64
    }

    /// Shift vector: DACs last to first, 14 bits + 2 padding each, then the slot byte
    pub fn vector(&self) -> Result<BitVector> {
        let mut bits = BitVector::new();
        for (i, &voltage) in self.dacs.iter().enumerate().rev() {
            push_uint(&mut bits, &format!("dac{}", i), self.dac_code(voltage), DAC_BITS)?;
            push_uint(&mut bits, "padding", 0, 2)?;
        }
        push_uint(&mut bits, "pos", u64::from(0x80u8 >> (self.pos - 1)), 8)?;
        Ok(bits)
    }

    /// Write the DAC settings
    pub fn update<T: TransportChannel>(&self, nexys: &mut Nexys<T>) -> Result<()> {
        let framer = SerialFramer::new(VOLTAGE_BOARD_CLKDIV);
        let frame = framer.gecco_pattern(VOLTAGE_BOARD_ADDRESS, &self.vector()?)?;
        nexys.write(&frame)?;
        info!("Voltage board in slot {} updated: {:?}", self.pos, self.dacs);
        Ok(())
    }
}

/// Injection pulse train settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionSettings {
    pub period: u8,
    /// Number of pulse sets; 0 runs until stopped
    pub cycle: u16,
    pub clkdiv: u16,
    pub initdelay: u16,
    pub pulses_per_set: u8,
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            period: 100,
            cycle: 0,
            clkdiv: 300,
            initdelay: 100,
            pulses_per_set: 1,
        }
    }
}

/// Pattern generator driving charge injection
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionBoard {
    settings: InjectionSettings,
    /// Injection board DAC; `None` when the on-chip circuit is used
    voltage: Option<VoltageBoard>,
}

impl InjectionBoard {
    /// Slot used when the register file names none
    pub const DEFAULT_POS: u8 = 3;

    /// Inject through the chip's own `vinj` DAC
    pub fn on_chip(settings: InjectionSettings) -> Self {
        Self {
            settings,
            voltage: None,
        }
    }

    /// Inject through the board DAC in slot `pos` with `amplitude` volts
    pub fn off_chip(pos: u8, amplitude: f64, settings: InjectionSettings) -> Result<Self> {
        if !(0.0..=DAC_MAX_VOLTAGE).contains(&amplitude) {
            return Err(Error::config(format!(
                "Injection amplitude {} V not in 0..=1.8",
                amplitude
            )));
        }
        Ok(Self {
            settings,
            voltage: Some(VoltageBoard::new(pos, &[amplitude, 0.0])?),
        })
    }

    /// Calibrate the board DAC; ignored for on-chip injection
    pub fn calibrate(&mut self, vcal: f64, vsupply: f64) -> Result<()> {
        if let Some(board) = &mut self.voltage {
            board.set_vcal(vcal)?;
            board.set_vsupply(vsupply)?;
        }
        Ok(())
    }

    pub fn settings(&self) -> InjectionSettings {
        self.settings
    }

    pub fn is_on_chip(&self) -> bool {
        self.voltage.is_none()
    }

    /// Program selecting the output, loading the pattern and pulses per set
    pub fn config_program(&self) -> Vec<u8> {
        let s = self.settings;
        let mut data = Vec::new();
        let output = if self.is_on_chip() { PG_OUTPUT_ONCHIP } else { PG_OUTPUT_BOARD };
        push_register(&mut data, PG_OUTPUT, output);

        for (address, value) in PG_TIMESTAMPS.iter().enumerate() {
            patgen_write(&mut data, address as u8, *value);
        }
        let [cycle_hi, cycle_lo] = s.cycle.to_be_bytes();
        let [delay_hi, delay_lo] = s.initdelay.to_be_bytes();
        let [clkdiv_hi, clkdiv_lo] = s.clkdiv.to_be_bytes();
        patgen_write(&mut data, 8, s.period);
        patgen_write(&mut data, 9, PG_FLAGS);
        patgen_write(&mut data, 10, cycle_hi);
        patgen_write(&mut data, 11, cycle_lo);
        patgen_write(&mut data, 12, delay_hi);
        patgen_write(&mut data, 13, delay_lo);
        patgen_write(&mut data, 14, clkdiv_hi);
        patgen_write(&mut data, 15, clkdiv_lo);

        patgen_write(&mut data, 7, s.pulses_per_set);
        debug!("Injection vector({} Bytes): 0x{}", data.len(), hex::encode(&data));
        data
    }

    /// Suspend, reset, release
    pub fn start_program() -> Vec<u8> {
        let mut data = Vec::new();
        push_register(&mut data, PG_SUSPEND, 1);
        push_register(&mut data, PG_RESET, 1);
        push_register(&mut data, PG_RESET, 0);
        push_register(&mut data, PG_SUSPEND, 0);
        data
    }

    /// Suspend and hold in reset
    pub fn stop_program() -> Vec<u8> {
        let mut data = Vec::new();
        push_register(&mut data, PG_SUSPEND, 1);
        push_register(&mut data, PG_RESET, 1);
        data
    }

    /// Stop, update the amplitude, reprogram and start
    pub fn start<T: TransportChannel>(&self, nexys: &mut Nexys<T>) -> Result<()> {
        nexys.write(&Self::stop_program())?;
        if let Some(board) = &self.voltage {
            board.update(nexys)?;
        }
        nexys.write(&Self::stop_program())?;
        info!("Write Injection Config");
        nexys.write(&self.config_program())?;
        nexys.write(&Self::start_program())?;
        info!("Start injection");
        Ok(())
    }

    pub fn stop<T: TransportChannel>(&self, nexys: &mut Nexys<T>) -> Result<()> {
        nexys.write(&Self::stop_program())?;
        info!("Stop injection");
        Ok(())
    }
}

/// Set the on-chip injection DAC of every chip; write the config afterwards
pub fn set_onchip_amplitude(asic: &mut Asic, volts: f64) -> Result<()> {
    asic.modify(|chips| {
        for chip in chips.iter_mut() {
            chip.set_internal_vdac("vinj", volts)?;
        }
        Ok(())
    })
}

fn push_register(buf: &mut Vec<u8>, addr: u8, value: u8) {
    buf.extend_from_slice(&[WRITE_ADDRESS, addr, 0x00, 0x01, value]);
}

fn patgen_write(buf: &mut Vec<u8>, address: u8, value: u8) {
    push_register(buf, PG_ADDRESS, address);
    push_register(buf, PG_DATA, value);
    push_register(buf, PG_WRITE, 1);
    push_register(buf, PG_WRITE, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::read_uint;
    use crate::register::{ChipConfig, Geometry, RegisterField, RegisterGroup, RECCONFIG_GROUP, VDAC_GROUP};
    use crate::transport::mock::MockTransport;

    #[test]
    fn test_voltage_board_vector() {
        let board = VoltageBoard::new(4, &[1.0, 0.5]).unwrap();
        let bits = board.vector().unwrap();
        assert_eq!(bits.len(), 2 * 16 + 8);
        assert_eq!(read_uint(&bits, 0, 14), 2482);
        assert_eq!(read_uint(&bits, 14, 2), 0);
        assert_eq!(read_uint(&bits, 16, 14), 4964);
        assert_eq!(read_uint(&bits, 32, 8), 0x10);
    }

    #[test]
    fn test_voltage_board_limits() {
        assert!(VoltageBoard::new(0, &[]).is_err());
        assert!(VoltageBoard::new(9, &[]).is_err());

        let mut board = VoltageBoard::new(1, &[2.5, -0.1, 1.2]).unwrap();
        assert_eq!(board.dacs(), &[0.0, 0.0, 1.2]);
        assert!(board.set_vcal(1.5).is_err());
        assert!(board.set_vsupply(5.0).is_err());
        board.set_vcal(0.9).unwrap();
        board.set_vsupply(2.7).unwrap();
        assert_eq!(read_uint(&board.vector().unwrap(), 0, 14), 8090);
    }

    #[test]
    fn test_threshold() {
        let mut board = VoltageBoard::default_for(ChipVersion::V3);
        board.set_threshold_mv(100.0).unwrap();
        assert!((board.dacs()[7] - 1.1).abs() < 1e-12);
        assert!(board.set_threshold_mv(900.0).is_err());
    }

    #[test]
    fn test_voltage_board_update_frame() {
        let mut nexys = Nexys::new(MockTransport::new());
        VoltageBoard::new(4, &[1.0, 0.5]).unwrap().update(&mut nexys).unwrap();
        let frame = &nexys.transport().writes[0];
        let len = (40 * 3 + 20) * usize::from(VOLTAGE_BOARD_CLKDIV);
        assert_eq!(&frame[..4], &[WRITE_ADDRESS, VOLTAGE_BOARD_ADDRESS, (len >> 8) as u8, len as u8]);
        assert_eq!(frame.len(), 4 + len);
    }

    #[test]
    fn test_injection_program() {
        let settings = InjectionSettings {
            cycle: 0x1234,
            ..InjectionSettings::default()
        };
        let program = InjectionBoard::on_chip(settings).config_program();
        assert_eq!(program.len(), 5 + 17 * 20);
        assert_eq!(&program[..5], &[WRITE_ADDRESS, PG_OUTPUT, 0, 1, PG_OUTPUT_ONCHIP]);

        // second timestamp write: address 1, value 3
        let write = &program[25..45];
        assert_eq!(
            write,
            &[1, 6, 0, 1, 1, 1, 7, 0, 1, 3, 1, 4, 0, 1, 1, 1, 4, 0, 1, 0]
        );

        let runlength_hi = &program[5 + 10 * 20..5 + 11 * 20];
        assert_eq!(runlength_hi[4], 10);
        assert_eq!(runlength_hi[9], 0x12);

        assert_eq!(
            InjectionBoard::start_program(),
            vec![1, 3, 0, 1, 1, 1, 2, 0, 1, 1, 1, 2, 0, 1, 0, 1, 3, 0, 1, 0]
        );
        assert_eq!(InjectionBoard::stop_program(), vec![1, 3, 0, 1, 1, 1, 2, 0, 1, 1]);
    }

    #[test]
    fn test_off_chip_start_sequence() {
        assert!(InjectionBoard::off_chip(3, 2.0, InjectionSettings::default()).is_err());

        let mut board = InjectionBoard::off_chip(3, 0.3, InjectionSettings::default()).unwrap();
        board.calibrate(0.989, 2.7).unwrap();
        let mut nexys = Nexys::new(MockTransport::new());
        board.start(&mut nexys).unwrap();

        let writes = &nexys.transport().writes;
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[0], InjectionBoard::stop_program());
        assert_eq!(writes[1][1], VOLTAGE_BOARD_ADDRESS);
        assert_eq!(writes[3][4], PG_OUTPUT_BOARD);
        assert_eq!(writes[4], InjectionBoard::start_program());
    }

    #[test]
    fn test_onchip_amplitude() {
        let mut chip = ChipConfig::new(ChipVersion::V3, 0, Geometry { rows: 1, cols: 1 });
        let mut vdacs = RegisterGroup::new(VDAC_GROUP);
        vdacs.push(RegisterField::new("vinj", 10, 0).unwrap()).unwrap();
        chip.push_group(vdacs).unwrap();
        let mut rec = RegisterGroup::new(RECCONFIG_GROUP);
        rec.push(RegisterField::new("col0", 4, 0).unwrap()).unwrap();
        chip.push_group(rec).unwrap();

        let mut asic = Asic::new(vec![chip], 5.0).unwrap();
        set_onchip_amplitude(&mut asic, 0.45).unwrap();
        assert_eq!(asic.chip(0).unwrap().field(VDAC_GROUP, "vinj").unwrap().value(), 256);
        assert!(set_onchip_amplitude(&mut asic, 3.0).is_err());
        assert_eq!(asic.chip(0).unwrap().field(VDAC_GROUP, "vinj").unwrap().value(), 256);
    }
}
