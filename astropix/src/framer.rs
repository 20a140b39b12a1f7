/*!
Serial framing of configuration vectors.

The readout board drives the chip's shift register from a byte stream in which
every byte is one sample of the control lines. A data bit becomes a five-step
double-clocked waveform (idle, first clock edge, idle, second clock edge,
idle); every sample is repeated `clkdiv` times to slow the bus down. The
waveform is wrapped in an addressed frame `[opcode, address, len_hi, len_lo]`
whose length field counts the waveform bytes actually sent.

The length field is 16 bits wide, so long vectors are split into several
frames. Every chunk leaves room for the load pulse and only the last one
carries it.
*/

use bitvec::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    LD_ASIC, LD_GECCO, LD_TDAC_ASIC, MAX_CHIPS, MAX_FRAME_PAYLOAD, READBACK_PREAMBLE,
    SIN_ASIC, SIN_GECCO, SPI_EMPTY_BYTE, SPI_HEADER_EMPTY, SPI_HEADER_SR, SPI_SR_BIT0,
    SPI_SR_BIT1, SPI_SR_BROADCAST, SPI_SR_LOAD, SR_ASIC_ADDRESS, WRITE_ADDRESS,
};

/// Samples per shifted bit
const STEPS_PER_BIT: usize = 5;

/// Samples in a load pulse before stretching
const LOAD_STEPS: usize = 3;

/// Extra stretch applied to the load pulse on top of the clock divider
const LOAD_STRETCH: usize = 10;

/// GECCO trailer: load, eight clocks, load
const GECCO_TRAILER_STEPS: usize = 20;

/// Readback enable line on the shift-register bus
const READBACK_LINE: u8 = 0x04;

/// Largest empty-byte burst the SPI write FIFO is expected to accept
const SPI_MAX_EMPTY_BYTES: usize = 64_000;

/// Which register a load pulse latches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrobe {
    /// Main configuration register
    Config,
    /// Per-row trim DACs
    Tdac,
}

impl LoadStrobe {
    fn line(self) -> u8 {
        match self {
            Self::Config => LD_ASIC,
            Self::Tdac => LD_TDAC_ASIC,
        }
    }
}

/// Destination of an SPI shift-register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiTarget {
    /// Every chip in the daisy chain
    Broadcast,
    /// A single chip by chain id
    Chip(u8),
}

/// Wrap a payload in an addressed register write frame
pub fn addressed_frame(address: u8, payload: &[u8]) -> Result<Bytes> {
    frame_with(address, payload.len(), |buf| buf.put_slice(payload))
}

/// Build a frame of exactly `len` payload bytes produced by `fill`
fn frame_with(address: u8, len: usize, fill: impl FnOnce(&mut BytesMut)) -> Result<Bytes> {
    let len16 = u16::try_from(len).map_err(|_| Error::FrameTooLong(len))?;
    let mut frame = BytesMut::with_capacity(4 + len);
    frame.put_u8(WRITE_ADDRESS);
    frame.put_u8(address);
    frame.put_u16(len16);
    fill(&mut frame);
    debug_assert_eq!(frame.len(), 4 + len);
    Ok(frame.freeze())
}

/// Repeat every sample of `pattern` `times` times
fn stretch(out: &mut BytesMut, pattern: &[u8], times: usize) {
    for &sample in pattern {
        out.put_bytes(sample, times);
    }
}

/// Split into chunks of at most `max_bits`; an empty vector is one empty chunk
fn split(bits: &BitSlice<u8, Msb0>, max_bits: usize) -> Vec<&BitSlice<u8, Msb0>> {
    if bits.is_empty() {
        vec![bits]
    } else {
        bits.chunks(max_bits).collect()
    }
}

/// Generates clock-divided shift-register waveforms
#[derive(Debug, Clone, Copy)]
pub struct SerialFramer {
    clkdiv: usize,
}

impl Default for SerialFramer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CLKDIV)
    }
}

impl SerialFramer {
    /// Clock divider used for ASIC configuration
    pub const DEFAULT_CLKDIV: u16 = 8;

    /// Clock divider used for GECCO cards
    pub const GECCO_CLKDIV: u16 = 16;

    /// Create a framer; a divider of zero is treated as one
    pub fn new(clkdiv: u16) -> Self {
        Self {
            clkdiv: usize::from(clkdiv.max(1)),
        }
    }

    pub fn clkdiv(&self) -> usize {
        self.clkdiv
    }

    /// Waveform bytes for `n_bits` data bits
    pub fn write_length(&self, n_bits: usize, load: bool) -> usize {
        let load_steps = if load { LOAD_STEPS * LOAD_STRETCH } else { 0 };
        (n_bits * STEPS_PER_BIT + load_steps) * self.clkdiv
    }

    /// Waveform bytes for `n_bits` data bits in readback mode
    pub fn readback_length(&self, n_bits: usize) -> usize {
        (n_bits + 1) * STEPS_PER_BIT * self.clkdiv
    }

    /// Most data bits that fit into one frame
    pub fn max_chunk_bits(&self, readback: bool) -> Result<usize> {
        let steps = MAX_FRAME_PAYLOAD / self.clkdiv;
        let max = if readback {
            (steps / STEPS_PER_BIT).checked_sub(1)
        } else {
            steps
                .checked_sub(LOAD_STEPS * LOAD_STRETCH)
                .map(|s| s / STEPS_PER_BIT)
        };
        match max {
            Some(n) if n > 0 => Ok(n),
            _ => Err(Error::config(format!(
                "Clock divider {} leaves no room for data in a frame",
                self.clkdiv
            ))),
        }
    }

    /// Frames writing `bits` into the ASIC shift register.
    ///
    /// Only the last frame carries `load`.
    pub fn asic_pattern(
        &self,
        bits: &BitSlice<u8, Msb0>,
        load: Option<LoadStrobe>,
    ) -> Result<Vec<Bytes>> {
        let chunks = split(bits, self.max_chunk_bits(false)?);
        let last = chunks.len() - 1;
        debug!(
            "Bytes to write: {} in {} frame(s)",
            self.write_length(bits.len(), load.is_some()),
            chunks.len()
        );

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| self.asic_pattern_part(chunk, if i == last { load } else { None }))
            .collect()
    }

    /// A single shift-register frame; fails if it would not fit the length field
    pub fn asic_pattern_part(
        &self,
        bits: &BitSlice<u8, Msb0>,
        load: Option<LoadStrobe>,
    ) -> Result<Bytes> {
        let len = self.write_length(bits.len(), load.is_some());
        let clkdiv = self.clkdiv;
        frame_with(SR_ASIC_ADDRESS, len, |buf| {
            for bit in bits.iter().by_vals() {
                let p = if bit { SIN_ASIC } else { 0 };
                stretch(buf, &[p, p | 1, p, p | 2, p], clkdiv);
            }
            if let Some(strobe) = load {
                stretch(buf, &[0x00, strobe.line(), 0x00], clkdiv * LOAD_STRETCH);
            }
        })
    }

    /// Frames clocking the shift register out for readback; never loads
    pub fn readback_pattern(&self, bits: &BitSlice<u8, Msb0>) -> Result<Vec<Bytes>> {
        let clkdiv = self.clkdiv;
        split(bits, self.max_chunk_bits(true)?)
            .into_iter()
            .map(|chunk| {
                frame_with(SR_ASIC_ADDRESS, self.readback_length(chunk.len()), |buf| {
                    stretch(buf, &READBACK_PREAMBLE, clkdiv);
                    for _ in 0..chunk.len() {
                        let p = READBACK_LINE;
                        stretch(buf, &[p, p | 1, p, p | 2, p], clkdiv);
                    }
                })
            })
            .collect()
    }

    /// Frame writing `bits` into a GECCO card register, followed by its load sequence
    pub fn gecco_pattern(&self, address: u8, bits: &BitSlice<u8, Msb0>) -> Result<Bytes> {
        let len = (bits.len() * 3 + GECCO_TRAILER_STEPS) * self.clkdiv;
        let clkdiv = self.clkdiv;
        debug!("GECCO config: address {} ({} bits, {} bytes)", address, bits.len(), len);
        frame_with(address, len, |buf| {
            for bit in bits.iter().by_vals() {
                let p = if bit { SIN_GECCO } else { 0 };
                stretch(buf, &[p, p | 1, p], clkdiv);
            }
            stretch(buf, &[LD_GECCO, 0x00], clkdiv);
            for _ in 0..8 {
                stretch(buf, &[0x01, 0x00], clkdiv);
            }
            stretch(buf, &[LD_GECCO, 0x00], clkdiv);
        })
    }
}

/// SPI command sequence writing `bits` into the shift register of one or all chips
pub fn asic_spi_vector(
    bits: &BitSlice<u8, Msb0>,
    load: bool,
    n_load: usize,
    target: SpiTarget,
) -> Result<Vec<u8>> {
    let command = match target {
        SpiTarget::Broadcast => SPI_SR_BROADCAST,
        SpiTarget::Chip(id) if usize::from(id) < MAX_CHIPS => SPI_HEADER_SR | id,
        SpiTarget::Chip(id) => {
            return Err(Error::config(format!("Invalid SPI chip id {}", id)));
        }
    };

    let mut data = Vec::with_capacity(1 + bits.len() + 2 * n_load);
    data.push(command);
    data.extend(
        bits.iter()
            .by_vals()
            .map(|bit| if bit { SPI_SR_BIT1 } else { SPI_SR_BIT0 }),
    );
    if load {
        data.extend(std::iter::repeat(SPI_SR_LOAD).take(n_load));
        data.extend(std::iter::repeat(SPI_EMPTY_BYTE).take(n_load));
    }
    debug!("SPI asic vector: {} bits, {} bytes", bits.len(), data.len());
    Ok(data)
}

/// Routing command that makes the chips push their hit buffers
pub fn spi_routing_cmd() -> [u8; 8] {
    [SPI_HEADER_EMPTY, 0, 0, 0, 0, 0, 0, 0]
}

/// `n` eight-byte groups of empty headers, clocking data out of the chips
pub fn spi_empty_bytes(n: usize) -> Vec<u8> {
    if n > SPI_MAX_EMPTY_BYTES {
        warn!("Cannot write more than {} Bytes", SPI_MAX_EMPTY_BYTES);
    }
    vec![SPI_HEADER_EMPTY; n * 8]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_len(frame: &[u8]) -> usize {
        usize::from(u16::from_be_bytes([frame[2], frame[3]]))
    }

    #[test]
    fn test_single_bit_waveform() {
        let framer = SerialFramer::new(1);
        let frames = framer.asic_pattern(bits![u8, Msb0; 1], None).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0x01, 0x00, 0x00, 0x05, 4, 5, 4, 6, 4]);

        let framer = SerialFramer::new(2);
        let frame = framer.asic_pattern_part(bits![u8, Msb0; 0], None).unwrap();
        assert_eq!(&frame[4..], &[0, 0, 1, 1, 0, 0, 2, 2, 0, 0]);
        assert_eq!(header_len(&frame), 10);
    }

    #[test]
    fn test_load_pulse_and_length_field() {
        let framer = SerialFramer::new(1);
        let frame = framer
            .asic_pattern_part(bits![u8, Msb0; 1], Some(LoadStrobe::Config))
            .unwrap();
        assert_eq!(header_len(&frame), 35);
        assert_eq!(frame.len(), 4 + 35);

        let load = &frame[9..];
        assert!(load[..10].iter().all(|&b| b == 0));
        assert!(load[10..20].iter().all(|&b| b == LD_ASIC));
        assert!(load[20..].iter().all(|&b| b == 0));

        let tdac = framer
            .asic_pattern_part(bits![u8, Msb0; 0], Some(LoadStrobe::Tdac))
            .unwrap();
        assert!(tdac.contains(&LD_TDAC_ASIC));
        assert!(!tdac.contains(&LD_ASIC));
    }

    #[test]
    fn test_chunking_keeps_load_on_last_frame() {
        let framer = SerialFramer::new(8);
        let max = framer.max_chunk_bits(false).unwrap();
        assert_eq!(max, 1632);

        let bits = bitvec![u8, Msb0; 0; 2 * max + 5];
        let frames = framer.asic_pattern(&bits, Some(LoadStrobe::Config)).unwrap();
        assert_eq!(frames.len(), 3);

        let mut shifted = 0;
        for (i, frame) in frames.iter().enumerate() {
            let len = header_len(frame);
            assert_eq!(frame.len(), 4 + len);
            let has_load = frame[4..].contains(&LD_ASIC);
            assert_eq!(has_load, i == frames.len() - 1);
            let load_bytes = if has_load { 30 * 8 } else { 0 };
            shifted += (len - load_bytes) / (5 * 8);
        }
        assert_eq!(shifted, bits.len());
        assert_eq!(header_len(&frames[0]), max * 5 * 8);
        assert_eq!(header_len(&frames[2]), (5 * 5 + 30) * 8);
    }

    #[test]
    fn test_chunk_at_limit_with_load_fits() {
        let framer = SerialFramer::new(8);
        let max = framer.max_chunk_bits(false).unwrap();
        let bits = bitvec![u8, Msb0; 1; max];
        let frames = framer.asic_pattern(&bits, Some(LoadStrobe::Config)).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(header_len(&frames[0]) <= MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn test_empty_vector_still_loads() {
        let framer = SerialFramer::new(1);
        let frames = framer.asic_pattern(BitSlice::empty(), Some(LoadStrobe::Config)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(header_len(&frames[0]), 30);
    }

    #[test]
    fn test_clkdiv_too_large() {
        let framer = SerialFramer::new(u16::MAX);
        assert!(framer.max_chunk_bits(false).is_err());
        assert!(framer.asic_pattern(bits![u8, Msb0; 1], None).is_err());
    }

    #[test]
    fn test_readback_pattern() {
        let framer = SerialFramer::new(1);
        let frames = framer.readback_pattern(bits![u8, Msb0; 1, 0]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(header_len(&frames[0]), 15);
        assert_eq!(
            &frames[0][4..],
            &[0x24, 0x25, 0x24, 0x26, 0x24, 4, 5, 4, 6, 4, 4, 5, 4, 6, 4]
        );
        assert_eq!(framer.max_chunk_bits(true).unwrap(), 65535 / 5 - 1);
    }

    #[test]
    fn test_gecco_pattern() {
        let framer = SerialFramer::new(1);
        let frame = framer.gecco_pattern(12, bits![u8, Msb0; 1, 0]).unwrap();
        assert_eq!(&frame[..4], &[0x01, 12, 0x00, 26]);
        let mut expected = vec![2, 3, 2, 0, 1, 0, 4, 0];
        for _ in 0..8 {
            expected.extend([1, 0]);
        }
        expected.extend([4, 0]);
        assert_eq!(&frame[4..], &expected[..]);
    }

    #[test]
    fn test_addressed_frame_limit() {
        let frame = addressed_frame(0x17, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&frame[..], &[0x01, 0x17, 0x00, 0x02, 0xAA, 0xBB]);
        assert!(matches!(
            addressed_frame(0x17, &vec![0; 65536]),
            Err(Error::FrameTooLong(65536))
        ));
    }

    #[test]
    fn test_spi_vectors() {
        let bits = bits![u8, Msb0; 1, 0, 1];
        assert_eq!(
            asic_spi_vector(bits, true, 2, SpiTarget::Broadcast).unwrap(),
            vec![0x7E, 1, 0, 1, 3, 3, 0, 0]
        );
        assert_eq!(
            asic_spi_vector(bits, false, 10, SpiTarget::Chip(3)).unwrap(),
            vec![0x63, 1, 0, 1]
        );
        assert!(asic_spi_vector(bits, false, 0, SpiTarget::Chip(40)).is_err());

        assert_eq!(spi_routing_cmd(), [0x20, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(spi_empty_bytes(2), vec![0x20; 16]);
    }
}
