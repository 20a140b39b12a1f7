/*!
# AstroPix Configuration and Readout

Core library for configuring AstroPix pixel-detector ASICs over their clocked
serial bus and decoding the raw hit bytestream they produce.

## Configuration path

[`ChipConfig`] → [`ConfigVectorBuilder`] → [`SerialFramer`] → [`TransportChannel`]

## Acquisition path

[`TransportChannel`] → [`ReadoutScanner`] → [`HitDecoder`] → [`DecodedHit`]

## Modules

- [`bits`] - Gray code, bit reversal and bit-vector helpers
- [`register`] - Register model and pixel mask operations
- [`source`] - Declarative register source (TOML) loading and write-back
- [`vector`] - Configuration vector generation
- [`framer`] - Shift-register waveforms, addressed frames and SPI vectors
- [`transport`] - Link capability trait
- [`nexys`] - Readout board register and SPI FIFO access
- [`asic`] - Single owner of the chip chain configuration
- [`boards`] - GECCO voltage and injection cards
- [`scanner`] - Hit frame location inside raw readouts
- [`decode`] - Hit frame layouts and the readout pipeline
- [`diag`] - Diagnostic sinks
- [`error`] - Common error types
*/

pub mod asic;
pub mod bits;
pub mod boards;
pub mod decode;
pub mod diag;
pub mod error;
pub mod framer;
pub mod nexys;
pub mod register;
pub mod scanner;
pub mod source;
pub mod transport;
pub mod vector;

// Re-export commonly used types
pub use asic::Asic;
pub use bits::BitVector;
pub use decode::{ClockMode, DecodeOutcome, DecodedHit, HitDecoder, HitLayout, ReadoutDecoder};
pub use diag::{DiagnosticSink, NullSink, TracingSink};
pub use error::{Error, Result};
pub use framer::{LoadStrobe, SerialFramer};
pub use nexys::Nexys;
pub use register::{ChipConfig, ChipVersion, Geometry, PixelMaskWord, RegisterField, RegisterGroup};
pub use scanner::{HeaderSet, HitFrame, ReadoutScanner};
pub use source::RegisterSource;
pub use transport::{TransportChannel, TransportError};
pub use vector::ConfigVectorBuilder;

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol constants
pub mod protocol {
    /// Opcode of a register read frame
    pub const READ_ADDRESS: u8 = 0x00;

    /// Opcode of a register write frame
    pub const WRITE_ADDRESS: u8 = 0x01;

    /// Board register fed by the ASIC shift-register pattern
    pub const SR_ASIC_ADDRESS: u8 = 0x00;

    /// ASIC shift-register data line
    pub const SIN_ASIC: u8 = 0x04;

    /// ASIC configuration load strobe
    pub const LD_ASIC: u8 = 0x08;

    /// ASIC per-row trim load strobe
    pub const LD_TDAC_ASIC: u8 = 0x40;

    /// GECCO card data line
    pub const SIN_GECCO: u8 = 0x02;

    /// GECCO card load strobe
    pub const LD_GECCO: u8 = 0x04;

    /// Largest payload an addressed frame can carry
    pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

    /// Readback preamble of the shift-register pattern
    pub const READBACK_PREAMBLE: [u8; 5] = [0x24, 0x25, 0x24, 0x26, 0x24];

    // SPI commands
    pub const SPI_SR_BROADCAST: u8 = 0x7E;
    pub const SPI_SR_BIT0: u8 = 0x00;
    pub const SPI_SR_BIT1: u8 = 0x01;
    pub const SPI_SR_LOAD: u8 = 0x03;
    pub const SPI_EMPTY_BYTE: u8 = 0x00;

    // SPI registers
    pub const SPI_CONFIG_REG: u8 = 0x15;
    pub const SPI_CLKDIV_REG: u8 = 0x16;
    pub const SPI_WRITE_REG: u8 = 0x17;
    pub const SPI_READ_REG: u8 = 0x18;
    pub const SPI_READBACK_REG: u8 = 0x3C;
    pub const SPI_READBACK_REG_CONF: u8 = 0x3D;

    // Daisy chain 3-bit header + 5-bit id
    pub const SPI_HEADER_EMPTY: u8 = 0b001 << 5;
    pub const SPI_HEADER_ROUTING: u8 = 0b010 << 5;
    pub const SPI_HEADER_SR: u8 = 0b011 << 5;

    // SPI config register bits
    pub const SPI_WRITE_FIFO_RESET: u8 = 1 << 0;
    pub const SPI_WRITE_FIFO_EMPTY: u8 = 1 << 1;
    pub const SPI_WRITE_FIFO_FULL: u8 = 1 << 2;
    pub const SPI_READ_FIFO_RESET: u8 = 1 << 3;
    pub const SPI_READ_FIFO_EMPTY: u8 = 1 << 4;
    pub const SPI_READ_FIFO_FULL: u8 = 1 << 5;
    pub const SPI_READBACK_ENABLE: u8 = 1 << 6;
    pub const SPI_MODULE_RESET: u8 = 1 << 7;

    /// Interrupt register; reads zero while hits are waiting
    pub const INTERRUPT_REG: u8 = 70;

    /// FTDI configuration register
    pub const FTDI_CONFIG_REG: u8 = 0;

    /// Chip reset line (active high) in the FTDI configuration register
    pub const CHIP_RESET_BIT: u8 = 4;

    /// Scratch register used by the link self-test
    pub const TEST_REG: u8 = 0x09;

    /// Self-test pattern
    pub const TEST_PATTERN: u8 = 0x55;

    /// Bytes per SPI FIFO read
    pub const SPI_READ_BLOCK: u16 = 2048;

    /// Bytes per SPI FIFO write slice
    pub const SPI_WRITE_SLICE: usize = 16;

    /// Chip id bits in a hit header byte
    pub const ID_SHIFT: u32 = 3;

    /// Chips addressable in one daisy chain
    pub const MAX_CHIPS: usize = 32;

    /// Idle bytes the chip emits between frames
    pub const IDLE_BYTES: [u8; 2] = [0xFF, 0xBC];
}
