/*!
Hit frame location inside raw readouts.

A readout is an unstructured byte stream: idle filler, frames from any chip
in the daisy chain, and whatever was left in the FIFO. Frames are found by
their header byte, `(chip_index << 3) | (frame_length - 1)`, which is bit
reversed on the wire when the link delivers bytes LSB first.

Resynchronization is purely header driven: a stray byte that equals a valid
header starts a frame even if it was really data. This is a known limitation
of the stream format and is kept as is.

The optional pre-filter is byte aligned as well: it splits the readout on
every single `0xFF` or `0xBC` byte. A frame whose data happens to contain one
of those values is cut in two, the second piece opens without a header, and
the whole readout is rejected as undecodable.
*/

use tracing::debug;

use crate::bits::{reverse_byte, reverse_bytes};
use crate::error::{Error, Result};
use crate::protocol::{IDLE_BYTES, ID_SHIFT, MAX_CHIPS};
use crate::register::ChipVersion;

/// Longest frame of any chip generation
pub const MAX_FRAME_LEN: usize = 8;

/// Valid on-wire header bytes for one chain, precomputed once
#[derive(Debug, Clone)]
pub struct HeaderSet {
    table: [bool; 256],
    values: Vec<u8>,
    frame_length: usize,
    reversed: bool,
}

impl HeaderSet {
    /// Headers of chips `0..nchips` sending frames of `frame_length` bytes
    pub fn new(nchips: usize, frame_length: usize, reversed: bool) -> Result<Self> {
        if nchips == 0 || nchips > MAX_CHIPS {
            return Err(Error::config(format!(
                "Chain of {} chips not supported (1..={})",
                nchips, MAX_CHIPS
            )));
        }
        if frame_length == 0 || frame_length > MAX_FRAME_LEN {
            return Err(Error::config(format!(
                "Unsupported frame length {}",
                frame_length
            )));
        }

        let mut table = [false; 256];
        let mut values = Vec::with_capacity(nchips);
        for index in 0..nchips {
            let header = ((index << ID_SHIFT) | (frame_length - 1)) as u8;
            let wire = if reversed { reverse_byte(header) } else { header };
            table[usize::from(wire)] = true;
            values.push(wire);
        }

        Ok(Self {
            table,
            values,
            frame_length,
            reversed,
        })
    }

    /// Whether `byte` starts a frame on the wire
    #[inline]
    pub fn contains(&self, byte: u8) -> bool {
        self.table[usize::from(byte)]
    }

    /// On-wire header values, by chip index
    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Whether the wire delivers bytes bit reversed
    pub fn reversed(&self) -> bool {
        self.reversed
    }
}

/// One fixed-length hit frame, in logical (MSB-first) bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitFrame {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl HitFrame {
    /// Copy a frame; `None` if it is longer than any known layout
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_FRAME_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            bytes: buf,
            len: bytes.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Finds hit frames in raw readouts
#[derive(Debug, Clone)]
pub struct ReadoutScanner {
    headers: HeaderSet,
    prefilter: bool,
}

impl ReadoutScanner {
    pub fn new(headers: HeaderSet, prefilter: bool) -> Self {
        Self { headers, prefilter }
    }

    /// Scanner for a chain of `nchips` chips of one generation
    pub fn for_version(version: ChipVersion, nchips: usize, reverse_bitorder: bool) -> Result<Self> {
        let headers = HeaderSet::new(nchips, version.bytes_per_hit(), reverse_bitorder)?;
        Ok(Self::new(headers, version.prefilter_default()))
    }

    /// Enable or disable the stream pre-filter
    pub fn with_prefilter(mut self, prefilter: bool) -> Self {
        self.prefilter = prefilter;
        self
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    pub fn prefilter(&self) -> bool {
        self.prefilter
    }

    /// Pre-filter (if enabled) and locate every complete frame
    pub fn scan(&self, readout: &[u8]) -> Result<Vec<HitFrame>> {
        if self.prefilter {
            self.check_chunks(readout)?;
        }
        Ok(self.find_frames(readout))
    }

    /// Locate every complete frame; a trailing partial frame is dropped
    pub fn find_frames(&self, readout: &[u8]) -> Vec<HitFrame> {
        let frame_length = self.headers.frame_length();
        let mut frames = Vec::new();
        let mut i = 0;

        while i < readout.len() {
            if !self.headers.contains(readout[i]) {
                i += 1;
                continue;
            }
            let Some(window) = readout.get(i..i + frame_length) else {
                debug!(
                    "Dropping partial frame at offset {} ({} of {} bytes)",
                    i,
                    readout.len() - i,
                    frame_length
                );
                break;
            };

            let frame = if self.headers.reversed() {
                HitFrame::new(&reverse_bytes(window))
            } else {
                HitFrame::new(window)
            };
            frames.extend(frame);
            i += frame_length;
        }

        frames
    }

    /// Split on idle bytes and require every chunk to open with a header
    pub fn check_chunks(&self, readout: &[u8]) -> Result<()> {
        for chunk in readout
            .split(|b| IDLE_BYTES.contains(b))
            .filter(|chunk| !chunk.is_empty())
        {
            if !self.headers.contains(chunk[0]) {
                return Err(Error::DecodeFault {
                    first: chunk[0],
                    len: chunk.len(),
                });
            }
        }
        Ok(())
    }
}
