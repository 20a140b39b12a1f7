/*!
Raw readout logs.

Every non-empty readout of a run is logged as one line, `"{index}\tb'{hex}'"`.
Offline decoding replays such a log through the same pipeline as a live run,
with the capture time set to 0.0.
*/

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use astropix::{ClockMode, DiagnosticSink, ReadoutDecoder};
use regex::Regex;
use tracing::{debug, info, warn};

const RAW_LINE_PATTERN: &str = r"^(\d+)\s+b'([0-9a-fA-F]*)'";

/// One raw log line for a readout
pub fn format_raw_line(index: u64, readout: &[u8]) -> String {
    format!("{}\tb'{}'", index, hex::encode(readout))
}

/// Counters of one offline decode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfflineSummary {
    pub readouts: u64,
    pub hits: u64,
    /// Readouts with bad hex or rejected by the pre-filter
    pub undecodable: u64,
}

/// Matches readout lines; header and comment lines are ignored
pub struct RawLogParser {
    regex: Regex,
}

impl RawLogParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            regex: Regex::new(RAW_LINE_PATTERN).context("Invalid raw line pattern")?,
        })
    }

    /// Readout index and hex payload, or `None` for a non-readout line
    pub fn parse_line<'a>(&self, line: &'a str) -> Option<(u64, &'a str)> {
        let caps = self.regex.captures(line)?;
        let index = caps.get(1)?.as_str().parse().ok()?;
        Some((index, caps.get(2)?.as_str()))
    }

    /// Decode every readout of `reader`, writing one JSON line per hit
    pub fn decode_log<R, W, S>(
        &self,
        reader: R,
        decoder: &ReadoutDecoder<S>,
        out: &mut W,
    ) -> Result<OfflineSummary>
    where
        R: BufRead,
        W: Write,
        S: DiagnosticSink,
    {
        let mut summary = OfflineSummary::default();
        for line in reader.lines() {
            let line = line.context("Failed to read raw log")?;
            let Some((index, payload)) = self.parse_line(&line) else {
                continue;
            };
            summary.readouts += 1;

            let readout = match hex::decode(payload) {
                Ok(readout) => readout,
                Err(e) => {
                    warn!("Readout {}: bad hex payload ({})", index, e);
                    summary.undecodable += 1;
                    continue;
                }
            };

            match decoder.decode_readout(&readout, index, ClockMode::Offline) {
                Ok(hits) => {
                    for hit in &hits {
                        serde_json::to_writer(&mut *out, hit)?;
                        writeln!(out)?;
                    }
                    summary.hits += hits.len() as u64;
                }
                Err(e) if e.is_decode_fault() => {
                    debug!("Readout {}: {}", index, e);
                    summary.undecodable += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            "Decoded {} hits from {} readouts ({} undecodable)",
            summary.hits, summary.readouts, summary.undecodable
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astropix::ChipVersion;

    fn decoder(prefilter: bool) -> ReadoutDecoder {
        ReadoutDecoder::for_chip(ChipVersion::V3, 1, 5.0, false)
            .unwrap()
            .with_prefilter(prefilter)
    }

    #[test]
    fn test_parse_line() {
        let parser = RawLogParser::new().unwrap();
        let line = format_raw_line(17, &[0xff, 0x04, 0xbc]);
        assert_eq!(line, "17\tb'ff04bc'");
        assert_eq!(parser.parse_line(&line), Some((17, "ff04bc")));
        assert_eq!(parser.parse_line("3   b''"), Some((3, "")));
        assert_eq!(parser.parse_line("# astropix-readout 0.1.0"), None);
        assert_eq!(parser.parse_line("b'ff'"), None);
    }

    #[test]
    fn test_decode_log() {
        let log = [
            "# header line",
            &format_raw_line(0, &[0xff, 0x04, 0x85, 200, 0x03, 0x10, 0xff]),
            "1\tb'0'",
            &format_raw_line(2, &[0x33, 0x04, 0x85, 200, 0x03, 0x10]),
        ]
        .join("\n");

        let parser = RawLogParser::new().unwrap();
        let mut out = Vec::new();
        let summary = parser.decode_log(log.as_bytes(), &decoder(true), &mut out).unwrap();
        assert_eq!(
            summary,
            OfflineSummary {
                readouts: 3,
                hits: 1,
                undecodable: 2
            }
        );

        let text = String::from_utf8(out).unwrap();
        let hit: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(hit["readout"], 0);
        assert_eq!(hit["location"], 5);
        assert_eq!(hit["hittime"], 0.0);

        // without the pre-filter the stray byte is skipped
        let mut out = Vec::new();
        let summary = parser.decode_log(log.as_bytes(), &decoder(false), &mut out).unwrap();
        assert_eq!(summary.hits, 2);
        assert_eq!(summary.undecodable, 1);
    }
}
