/*!
Hit frame decoding.

Two frame layouts exist:

- 5 bytes (generations 1-3): chip id, payload, row-or-column location, an
  8-bit timestamp and a 12-bit time-over-threshold counter.
- 8 bytes (generation 4): row and column plus two Gray coded timestamp
  channels; time over threshold is the distance between them.

Decoding a frame is a pure function. A frame of the wrong length is
[`DecodeOutcome::Skipped`] rather than an error, so one bad frame never stops
the rest of a readout from decoding.
*/

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::bits::gray_to_binary;
use crate::diag::{DiagnosticSink, NullSink};
use crate::error::Result;
use crate::register::ChipVersion;
use crate::scanner::ReadoutScanner;

/// Modulus of the 17-bit timestamp counter
pub const TS_MODULUS: u32 = 1 << 17;

/// Timestamp counter ticks per microsecond
pub const TS_TICKS_PER_US: f64 = 20.0;

/// Frame layout of a chip generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitLayout {
    /// 5-byte frame with a time-over-threshold counter
    FiveByte,
    /// 8-byte frame with two timestamp channels
    EightByte,
}

impl HitLayout {
    pub fn for_version(version: ChipVersion) -> Self {
        if version.bytes_per_hit() == 8 {
            Self::EightByte
        } else {
            Self::FiveByte
        }
    }

    pub fn frame_length(self) -> usize {
        match self {
            Self::FiveByte => 5,
            Self::EightByte => 8,
        }
    }

    /// Exported column names, in schema order
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::FiveByte => &TotHit::COLUMNS,
            Self::EightByte => &TimestampHit::COLUMNS,
        }
    }
}

/// Source of the capture-time field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Stamp hits with the local clock at decode time
    Live,
    /// Replaying a captured stream: capture time is unknown and set to 0.0
    Offline,
}

impl ClockMode {
    /// Seconds since the epoch, or the offline placeholder
    pub fn hittime(self) -> f64 {
        match self {
            Self::Live => Utc::now().timestamp_micros() as f64 / 1e6,
            Self::Offline => 0.0,
        }
    }
}

/// Decoded 5-byte frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TotHit {
    pub readout: u64,
    #[serde(rename = "Chip ID")]
    pub chip_id: u8,
    pub payload: u8,
    pub location: u8,
    #[serde(rename = "isCol")]
    pub is_col: u8,
    pub timestamp: u8,
    pub tot_msb: u8,
    pub tot_lsb: u8,
    pub tot_total: u16,
    pub tot_us: f64,
    pub hittime: f64,
}

impl TotHit {
    pub const COLUMNS: [&'static str; 11] = [
        "readout",
        "Chip ID",
        "payload",
        "location",
        "isCol",
        "timestamp",
        "tot_msb",
        "tot_lsb",
        "tot_total",
        "tot_us",
        "hittime",
    ];

    /// Decode one frame.
    ///
    /// Byte 0: id (7-3), payload (2-0). Byte 1: column flag (7), location
    /// (5-0). Byte 2: timestamp. Byte 3: ToT MSB (3-0). Byte 4: ToT LSB.
    pub fn from_frame(frame: &[u8; 5], readout: u64, sampleclock_period_ns: f64, hittime: f64) -> Self {
        let [header, location, timestamp, tot_msb, tot_lsb] = *frame;
        let tot_msb = tot_msb & 0x0F;
        let tot_total = (u16::from(tot_msb) << 8) + u16::from(tot_lsb);

        Self {
            readout,
            chip_id: header >> 3,
            payload: header & 0b111,
            location: location & 0x3F,
            is_col: (location >> 7) & 1,
            timestamp,
            tot_msb,
            tot_lsb,
            tot_total,
            tot_us: f64::from(tot_total) * sampleclock_period_ns / 1000.0,
            hittime,
        }
    }
}

/// Decoded 8-byte frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampHit {
    pub id: u8,
    pub payload: u8,
    pub row: u8,
    pub col: u8,
    pub ts1: u16,
    pub tsfine1: u8,
    pub ts2: u16,
    pub tsfine2: u8,
    pub tsneg1: u8,
    pub tsneg2: u8,
    pub tstdc1: u8,
    pub tstdc2: u8,
    pub ts_dec1: u32,
    pub ts_dec2: u32,
    pub tot_us: f64,
}

impl TimestampHit {
    pub const COLUMNS: [&'static str; 15] = [
        "id", "payload", "row", "col", "ts1", "tsfine1", "ts2", "tsfine2", "tsneg1", "tsneg2",
        "tstdc1", "tstdc2", "ts_dec1", "ts_dec2", "tot_us",
    ];

    pub fn from_frame(frame: &[u8; 8]) -> Self {
        let [header, b1, b2, b3, b4, b5, b6, b7] = *frame;

        let ts1 = (u16::from(b2 & 0x1F) << 9) + (u16::from(b3) << 1) + u16::from(b4 >> 7);
        let tsfine1 = (b4 >> 4) & 0b111;
        let ts2 = (u16::from(b5 & 0x3F) << 8) + u16::from(b6);
        let tsfine2 = (b7 >> 5) & 0b111;

        let ts_dec1 = gray_to_binary((u32::from(ts1) << 3) + u32::from(tsfine1));
        let ts_dec2 = gray_to_binary((u32::from(ts2) << 3) + u32::from(tsfine2));

        Self {
            id: header >> 3,
            payload: header & 0b111,
            row: b1 >> 3,
            col: ((b1 & 0b111) << 2) + (b2 >> 6),
            ts1,
            tsfine1,
            ts2,
            tsfine2,
            tsneg1: (b2 >> 5) & 1,
            tsneg2: (b5 >> 6) & 1,
            tstdc1: ((b4 & 0x0F) << 1) + (b5 >> 7),
            tstdc2: b7 & 0x1F,
            ts_dec1,
            ts_dec2,
            tot_us: tot_us_from_timestamps(ts_dec1, ts_dec2),
        }
    }
}

/// Pulse width between two decoded timestamps, allowing one counter wrap
pub fn tot_us_from_timestamps(ts_dec1: u32, ts_dec2: u32) -> f64 {
    let ticks = if ts_dec2 >= ts_dec1 {
        ts_dec2 - ts_dec1
    } else {
        TS_MODULUS - ts_dec1 + ts_dec2
    };
    f64::from(ticks) / TS_TICKS_PER_US
}

/// One decoded hit of either layout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedHit {
    Tot(TotHit),
    Timestamp(TimestampHit),
}

impl DecodedHit {
    pub fn chip_id(&self) -> u8 {
        match self {
            Self::Tot(hit) => hit.chip_id,
            Self::Timestamp(hit) => hit.id,
        }
    }

    pub fn tot_us(&self) -> f64 {
        match self {
            Self::Tot(hit) => hit.tot_us,
            Self::Timestamp(hit) => hit.tot_us,
        }
    }
}

/// Result of one decode attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Hit(DecodedHit),
    /// Frame length does not match the layout
    Skipped { len: usize },
}

/// Decodes single frames of one layout
#[derive(Debug, Clone)]
pub struct HitDecoder<S = NullSink> {
    layout: HitLayout,
    sampleclock_period_ns: f64,
    sink: S,
}

impl HitDecoder<NullSink> {
    pub fn new(layout: HitLayout, sampleclock_period_ns: f64) -> Self {
        Self {
            layout,
            sampleclock_period_ns,
            sink: NullSink,
        }
    }
}

impl<S: DiagnosticSink> HitDecoder<S> {
    /// Replace the diagnostic sink
    pub fn with_sink<T: DiagnosticSink>(self, sink: T) -> HitDecoder<T> {
        HitDecoder {
            layout: self.layout,
            sampleclock_period_ns: self.sampleclock_period_ns,
            sink,
        }
    }

    pub fn layout(&self) -> HitLayout {
        self.layout
    }

    pub fn sampleclock_period_ns(&self) -> f64 {
        self.sampleclock_period_ns
    }

    /// Decode one frame; `readout` numbers the readout the frame came from
    pub fn decode(&self, frame: &[u8], readout: u64, clock: ClockMode) -> DecodeOutcome {
        match self.layout {
            HitLayout::FiveByte => match <&[u8; 5]>::try_from(frame) {
                Ok(bytes) => {
                    let hit = TotHit::from_frame(bytes, readout, self.sampleclock_period_ns, clock.hittime());
                    self.trace_tot(&hit);
                    DecodeOutcome::Hit(DecodedHit::Tot(hit))
                }
                Err(_) => DecodeOutcome::Skipped { len: frame.len() },
            },
            HitLayout::EightByte => match <&[u8; 8]>::try_from(frame) {
                Ok(bytes) => {
                    let hit = TimestampHit::from_frame(bytes);
                    self.trace_timestamp(&hit);
                    DecodeOutcome::Hit(DecodedHit::Timestamp(hit))
                }
                Err(_) => DecodeOutcome::Skipped { len: frame.len() },
            },
        }
    }

    fn trace_tot(&self, hit: &TotHit) {
        self.sink.record(format_args!(
            "Header: ChipId: {}\tPayload: {}\tLocation: {}\tRow/Col: {}\tTimestamp: {}\tToT: MSB: {}\tLSB: {} Total: {} ({:.6} us)",
            hit.chip_id, hit.payload, hit.location, hit.is_col, hit.timestamp,
            hit.tot_msb, hit.tot_lsb, hit.tot_total, hit.tot_us
        ));
    }

    fn trace_timestamp(&self, hit: &TimestampHit) {
        self.sink.record(format_args!(
            "Header: ChipId: {}\tPayload: {}\tRow: {}\t Col: {}\tTS1: {}\t TS1_fine {}\tTS2: {}\t TS2_fine {}\tTS1_dec: {}\t TS2_dec {}\tTotal ToT [us]: {:.6} us",
            hit.id, hit.payload, hit.row, hit.col, hit.ts1, hit.tsfine1,
            hit.ts2, hit.tsfine2, hit.ts_dec1, hit.ts_dec2, hit.tot_us
        ));
    }
}

/// Scanner and decoder for one chain: raw readout in, hits out
#[derive(Debug, Clone)]
pub struct ReadoutDecoder<S = NullSink> {
    scanner: ReadoutScanner,
    decoder: HitDecoder<S>,
}

impl ReadoutDecoder<NullSink> {
    /// Pipeline for `nchips` chips of one generation with the default pre-filter
    pub fn for_chip(
        version: ChipVersion,
        nchips: usize,
        sampleclock_period_ns: f64,
        reverse_bitorder: bool,
    ) -> Result<Self> {
        let scanner = ReadoutScanner::for_version(version, nchips, reverse_bitorder)?;
        let decoder = HitDecoder::new(HitLayout::for_version(version), sampleclock_period_ns);
        Ok(Self { scanner, decoder })
    }
}

impl<S: DiagnosticSink> ReadoutDecoder<S> {
    pub fn new(scanner: ReadoutScanner, decoder: HitDecoder<S>) -> Self {
        Self { scanner, decoder }
    }

    /// Replace the diagnostic sink
    pub fn with_sink<T: DiagnosticSink>(self, sink: T) -> ReadoutDecoder<T> {
        ReadoutDecoder {
            scanner: self.scanner,
            decoder: self.decoder.with_sink(sink),
        }
    }

    /// Enable or disable the stream pre-filter
    pub fn with_prefilter(mut self, prefilter: bool) -> Self {
        self.scanner = self.scanner.with_prefilter(prefilter);
        self
    }

    pub fn scanner(&self) -> &ReadoutScanner {
        &self.scanner
    }

    pub fn decoder(&self) -> &HitDecoder<S> {
        &self.decoder
    }

    /// Decode every hit in one readout.
    ///
    /// Fails only with a decode fault from the pre-filter; skipped frames are
    /// dropped and decoding continues.
    pub fn decode_readout(&self, readout: &[u8], index: u64, clock: ClockMode) -> Result<Vec<DecodedHit>> {
        let frames = self.scanner.scan(readout)?;
        let mut hits = Vec::with_capacity(frames.len());
        for frame in &frames {
            match self.decoder.decode(frame.as_bytes(), index, clock) {
                DecodeOutcome::Hit(hit) => hits.push(hit),
                DecodeOutcome::Skipped { len } => {
                    debug!("Skipped {}-byte frame in readout {}", len, index);
                }
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{binary_to_gray, reverse_bytes};
    use crate::diag::tests::CollectingSink;
    use crate::error::Error;

    const TOT_FRAME: [u8; 5] = [0x07, 0b1000_0101, 200, 0x03, 0x10];
    const TS_FRAME: [u8; 8] = [0x0F, 0x55, 0x60, 33, 0xCB, 0x40, 230, 0x47];

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_tot_frame_fields() {
        let hit = TotHit::from_frame(&TOT_FRAME, 12, 5.0, 0.0);
        assert_eq!(hit.readout, 12);
        assert_eq!(hit.chip_id, 0);
        assert_eq!(hit.payload, 7);
        assert_eq!(hit.is_col, 1);
        assert_eq!(hit.location, 5);
        assert_eq!(hit.timestamp, 200);
        assert_eq!(hit.tot_msb, 3);
        assert_eq!(hit.tot_lsb, 16);
        assert_eq!(hit.tot_total, 784);
        assert_close(hit.tot_us, 3.92);
    }

    #[test]
    fn test_tot_msb_masks_upper_nibble() {
        let hit = TotHit::from_frame(&[0x0C, 0x45, 0, 0xF3, 0xFF], 0, 5.0, 0.0);
        assert_eq!(hit.chip_id, 1);
        assert_eq!(hit.is_col, 0);
        assert_eq!(hit.location, 5);
        assert_eq!(hit.tot_msb, 3);
        assert_eq!(hit.tot_total, 0x3FF);
    }

    #[test]
    fn test_timestamp_frame_fields() {
        assert_eq!(binary_to_gray(1000u32), 540);
        assert_eq!(binary_to_gray(1500u32), 1842);

        let hit = TimestampHit::from_frame(&TS_FRAME);
        assert_eq!((hit.id, hit.payload), (1, 7));
        assert_eq!((hit.row, hit.col), (10, 21));
        assert_eq!((hit.tsneg1, hit.ts1, hit.tsfine1, hit.tstdc1), (1, 67, 4, 22));
        assert_eq!((hit.tsneg2, hit.ts2, hit.tsfine2, hit.tstdc2), (1, 230, 2, 7));
        assert_eq!((hit.ts_dec1, hit.ts_dec2), (1000, 1500));
        assert_close(hit.tot_us, 25.0);
    }

    #[test]
    fn test_tot_wraparound() {
        assert_close(tot_us_from_timestamps(131_000, 100), 8.6);
        assert_close(tot_us_from_timestamps(100, 300), 10.0);
        assert_close(tot_us_from_timestamps(7, 7), 0.0);
    }

    #[test]
    fn test_wrong_length_is_skipped() {
        let five = HitDecoder::new(HitLayout::FiveByte, 5.0);
        assert_eq!(five.decode(&TS_FRAME, 0, ClockMode::Offline), DecodeOutcome::Skipped { len: 8 });
        let eight = HitDecoder::new(HitLayout::EightByte, 5.0);
        assert_eq!(eight.decode(&TOT_FRAME, 0, ClockMode::Offline), DecodeOutcome::Skipped { len: 5 });
    }

    #[test]
    fn test_clock_modes() {
        let decoder = HitDecoder::new(HitLayout::FiveByte, 5.0);
        let DecodeOutcome::Hit(DecodedHit::Tot(offline)) = decoder.decode(&TOT_FRAME, 0, ClockMode::Offline) else {
            panic!("expected a hit");
        };
        assert_eq!(offline.hittime, 0.0);

        let DecodeOutcome::Hit(DecodedHit::Tot(live)) = decoder.decode(&TOT_FRAME, 0, ClockMode::Live) else {
            panic!("expected a hit");
        };
        assert!(live.hittime > 1.6e9);
    }

    #[test]
    fn test_sink_does_not_change_result() {
        let sink = CollectingSink::default();
        let plain = HitDecoder::new(HitLayout::EightByte, 5.0);
        let traced = plain.clone().with_sink(&sink);

        let a = plain.decode(&TS_FRAME, 0, ClockMode::Offline);
        let b = traced.decode(&TS_FRAME, 0, ClockMode::Offline);
        assert_eq!(a, b);

        let events = sink.events.borrow();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("TS1_dec: 1000"));
    }

    #[test]
    fn test_readout_pipeline() {
        let pipeline = ReadoutDecoder::for_chip(ChipVersion::V3, 1, 5.0, false).unwrap();
        let readout = [0xFF, 0x04, 0x85, 200, 0x03, 0x10, 0xFF, 0x04, 1, 2];
        let hits = pipeline.decode_readout(&readout, 3, ClockMode::Offline).unwrap();
        assert_eq!(hits.len(), 1);
        let DecodedHit::Tot(hit) = &hits[0] else {
            panic!("expected a 5-byte hit");
        };
        assert_eq!(hit.readout, 3);
        assert_eq!(hit.payload, 4);
        assert_close(hit.tot_us, 3.92);

        let reversed = ReadoutDecoder::for_chip(ChipVersion::V3, 1, 5.0, true).unwrap();
        let wire = reverse_bytes(&readout);
        assert_eq!(reversed.decode_readout(&wire, 3, ClockMode::Offline).unwrap(), hits);
    }

    #[test]
    fn test_prefilter_fault_surfaces() {
        let pipeline = ReadoutDecoder::for_chip(ChipVersion::V4, 1, 5.0, false).unwrap();
        let readout = [0xFF, 0x07, 0x55, 0x60, 33, 0xCB, 0x40, 230, 0x47, 0xFF, 0x99];
        let err = pipeline.decode_readout(&readout, 0, ClockMode::Offline).unwrap_err();
        assert!(matches!(err, Error::DecodeFault { first: 0x99, .. }));

        let relaxed = pipeline.with_prefilter(false);
        let hits = relaxed.decode_readout(&readout, 0, ClockMode::Offline).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chip_id(), 0);
    }

    #[test]
    fn test_json_keys_follow_schema_order() {
        let hit = DecodedHit::Tot(TotHit::from_frame(&TOT_FRAME, 0, 5.0, 0.0));
        let value = serde_json::to_value(&hit).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        let mut expected: Vec<_> = TotHit::COLUMNS.iter().map(|s| s.to_string()).collect();
        expected.sort();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(sorted, expected);

        let json = serde_json::to_string(&hit).unwrap();
        let mut last = 0;
        for column in TotHit::COLUMNS {
            let pos = json.find(&format!("\"{}\"", column)).unwrap();
            assert!(pos >= last, "{} out of order", column);
            last = pos;
        }
        assert_eq!(HitLayout::EightByte.columns().len(), 15);
    }
}
