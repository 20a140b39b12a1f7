/*!
Readout board (Nexys FPGA) access.

Register reads and writes, SPI FIFO management and chip reset on top of a
[`TransportChannel`]. The board owns its transport; everything else talks to
the hardware through a `Nexys`.
*/

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::bits::reverse_bytes;
use crate::error::Result;
use crate::framer::{addressed_frame, spi_empty_bytes, spi_routing_cmd};
use crate::protocol::{
    CHIP_RESET_BIT, FTDI_CONFIG_REG, INTERRUPT_REG, SPI_CLKDIV_REG, SPI_CONFIG_REG,
    SPI_MODULE_RESET, SPI_READBACK_REG, SPI_READBACK_REG_CONF, SPI_READ_BLOCK,
    SPI_READ_FIFO_EMPTY, SPI_READ_REG, SPI_WRITE_FIFO_EMPTY, SPI_WRITE_FIFO_FULL,
    SPI_WRITE_REG, SPI_WRITE_SLICE, TEST_PATTERN, TEST_REG,
};
use crate::transport::{TransportChannel, TransportError};

/// Status register polls before giving up on a FIFO
const DEFAULT_MAX_POLLS: usize = 100_000;

/// How long the chip reset line is held
const DEFAULT_RESET_HOLD: Duration = Duration::from_millis(100);

/// Readout board on one transport
#[derive(Debug)]
pub struct Nexys<T> {
    transport: T,
    max_polls: usize,
    reset_hold: Duration,
}

impl<T: TransportChannel> Nexys<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            max_polls: DEFAULT_MAX_POLLS,
            reset_hold: DEFAULT_RESET_HOLD,
        }
    }

    /// Limit status polls while waiting on the SPI write FIFO
    pub fn with_max_polls(mut self, max_polls: usize) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    /// Override the chip reset hold time
    pub fn with_reset_hold(mut self, hold: Duration) -> Self {
        self.reset_hold = hold;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Write raw bytes
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write(bytes)?;
        Ok(())
    }

    /// Write a sequence of frames in order
    pub fn write_frames(&mut self, frames: &[Bytes]) -> Result<()> {
        for frame in frames {
            self.write(frame)?;
        }
        Ok(())
    }

    /// Write one byte to a register
    pub fn write_register(&mut self, addr: u8, value: u8) -> Result<()> {
        debug!("Write Register {} Value 0x{:02x}", addr, value);
        self.transport.write_register(addr, value)?;
        Ok(())
    }

    /// Write a byte string to a register as one addressed frame
    pub fn write_registers(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        let frame = addressed_frame(addr, data)?;
        debug!("Write Register {} Data: {}", addr, hex::encode(&frame));
        self.write(&frame)
    }

    /// Read `n` bytes from a register
    pub fn read_register(&mut self, addr: u8, n: u16) -> Result<Vec<u8>> {
        Ok(self.transport.read_register(addr, n)?)
    }

    fn read_register_byte(&mut self, addr: u8) -> Result<u8> {
        let answer = self.read_register(addr, 1)?;
        let value = answer.first().copied().ok_or(TransportError::ShortRead {
            expected: 1,
            got: 0,
        })?;
        Ok(value)
    }

    /// SPI configuration/status register
    pub fn spi_config(&mut self) -> Result<u8> {
        self.read_register_byte(SPI_CONFIG_REG)
    }

    /// Shift-register readback configuration register
    pub fn sr_readback_config(&mut self) -> Result<u8> {
        self.read_register_byte(SPI_READBACK_REG_CONF)
    }

    /// Set the SPI clock divider (100 MHz / clkdiv)
    pub fn set_spi_clkdiv(&mut self, clkdiv: u8) -> Result<()> {
        self.write_register(SPI_CLKDIV_REG, clkdiv)
    }

    /// Enable or disable the SPI module (active-low reset bit)
    pub fn spi_enable(&mut self, enable: bool) -> Result<()> {
        let config = self.spi_config()?;
        let config = if enable {
            config & !SPI_MODULE_RESET
        } else {
            config | SPI_MODULE_RESET
        };
        debug!("Configregister: 0x{:02x}", config);
        self.write_register(SPI_CONFIG_REG, config)
    }

    fn pulse_bit(&mut self, reg: u8, bit: u8) -> Result<()> {
        let value = self.read_register_byte(reg)?;
        self.write_register(reg, value | (1 << bit))?;
        let value = self.read_register_byte(reg)?;
        self.write_register(reg, value & !(1 << bit))
    }

    /// Reset the SPI write and read FIFOs on the FPGA
    pub fn spi_reset_fpga_readout(&mut self) -> Result<()> {
        for bit in [0, 3] {
            self.pulse_bit(SPI_CONFIG_REG, bit)?;
        }
        Ok(())
    }

    /// Reset the shift-register readback FIFO
    pub fn sr_readback_reset(&mut self) -> Result<()> {
        self.pulse_bit(SPI_READBACK_REG_CONF, 0)
    }

    /// Pulse the chip reset line
    pub fn chip_reset(&mut self) -> Result<()> {
        let config = self.read_register_byte(FTDI_CONFIG_REG)?;
        self.write_register(FTDI_CONFIG_REG, config | (1 << CHIP_RESET_BIT))?;
        thread::sleep(self.reset_hold);
        let config = self.read_register_byte(FTDI_CONFIG_REG)?;
        self.write_register(FTDI_CONFIG_REG, config & !(1 << CHIP_RESET_BIT))?;
        info!("Chip reset");
        Ok(())
    }

    /// Enable SPI, reset the readout FIFOs, set the clock and route hits
    pub fn enable_spi(&mut self, clkdiv: u8) -> Result<()> {
        self.spi_enable(true)?;
        self.spi_reset_fpga_readout()?;
        self.set_spi_clkdiv(clkdiv)?;
        self.send_routing_cmd()?;
        info!("SPI ENABLED");
        Ok(())
    }

    /// Write directly to the SPI write register
    pub fn direct_write_spi(&mut self, data: &[u8]) -> Result<()> {
        self.write_registers(SPI_WRITE_REG, data)
    }

    /// Push bytes into the SPI write FIFO.
    ///
    /// Waits for the FIFO to drain, then writes 16-byte slices whenever it is
    /// not full. With `msb_first` unset every byte is bit reversed.
    pub fn write_spi(&mut self, data: &[u8], msb_first: bool) -> Result<()> {
        let reversed;
        let data = if msb_first {
            data
        } else {
            reversed = reverse_bytes(data);
            &reversed[..]
        };
        debug!("SPIdata: {}", hex::encode(data));

        let mut polls = 0;
        while self.spi_config()? & SPI_WRITE_FIFO_EMPTY == 0 {
            polls += 1;
            if polls >= self.max_polls {
                return Err(TransportError::Timeout("SPI write FIFO to drain".into()).into());
            }
        }

        let mut slices = data.chunks(SPI_WRITE_SLICE).enumerate().peekable();
        let mut polls = 0;
        while let Some(&(i, slice)) = slices.peek() {
            if self.spi_config()? & SPI_WRITE_FIFO_FULL != 0 {
                polls += 1;
                if polls >= self.max_polls {
                    return Err(TransportError::Timeout("SPI write FIFO space".into()).into());
                }
                continue;
            }
            polls = 0;
            self.direct_write_spi(slice)?;
            debug!("Write SPI bytes {}:{}", i * SPI_WRITE_SLICE, i * SPI_WRITE_SLICE + slice.len());
            slices.next();
        }
        Ok(())
    }

    /// Send the routing command that makes the chips forward their hits
    pub fn send_routing_cmd(&mut self) -> Result<()> {
        info!("SPI: Send routing cmd");
        self.write_spi(&spi_routing_cmd(), true)
    }

    /// Clock `n * 8` empty bytes through the chain to push hits out
    pub fn write_spi_bytes(&mut self, n: usize) -> Result<()> {
        info!("SPI: Write {} Bytes", 8 * n + 4);
        self.write_spi(&spi_empty_bytes(n), true)
    }

    /// Read `n` bytes from the SPI read register
    pub fn read_spi(&mut self, n: u16) -> Result<Vec<u8>> {
        self.read_register(SPI_READ_REG, n)
    }

    /// Read `n` bytes from the shift-register readback register
    pub fn read_spi_readback(&mut self, n: u16) -> Result<Vec<u8>> {
        self.read_register(SPI_READBACK_REG, n)
    }

    /// Read 2048-byte blocks until the read FIFO is empty, at most `max_reads` times.
    ///
    /// Returns only what was read during this call.
    pub fn read_spi_fifo(&mut self, max_reads: usize) -> Result<Vec<u8>> {
        let mut stream = Vec::new();
        let mut reads = 0;
        while reads < max_reads && self.spi_config()? & SPI_READ_FIFO_EMPTY == 0 {
            stream.extend(self.read_spi(SPI_READ_BLOCK)?);
            reads += 1;
        }
        Ok(stream)
    }

    /// Read and discard whatever is waiting in the read FIFO
    pub fn dump_fpga(&mut self, max_reads: usize) -> Result<usize> {
        let dropped = self.read_spi_fifo(max_reads)?.len();
        if dropped > 0 {
            debug!("Dumped {} stale bytes from the readout FIFO", dropped);
        }
        Ok(dropped)
    }

    /// Whether the chip is signalling waiting hits (interrupt low)
    pub fn hits_present(&mut self) -> Result<bool> {
        Ok(self.read_register_byte(INTERRUPT_REG)? == 0)
    }

    /// Write and read back a scratch register, then reset the readout FIFOs
    pub fn test_io(&mut self) -> Result<()> {
        self.write_register(TEST_REG, TEST_PATTERN)?;
        let answer = self.read_register_byte(TEST_REG)?;
        if answer != TEST_PATTERN {
            warn!("Test register read back 0x{:02x}, expected 0x{:02x}", answer, TEST_PATTERN);
        }
        self.spi_reset_fpga_readout()?;
        self.sr_readback_reset()?;
        Ok(())
    }
}
