//! Parsers for the structured log lines the two daemons emit.
//!
//! `ptp4l`:   `ptp4l[4021.567]: master offset       -312 s2 freq   +1450 path delay     789`
//! `phc2sys`: `phc2sys[4021.800]: CLOCK_REALTIME phc offset   -62 s2 freq    +24 delay   1378`
//!            `phc2sys[4021.800]: CLOCK_REALTIME sys offset   -62 s0 freq    +24 delay   1378`

use crate::SyncDaemon;

/// Offset/freq pair pulled from one log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedLine {
    pub daemon: SyncDaemon,
    pub offset_ns: i64,
    pub freq_ppb: i64,
}

/// Parse any supported daemon line; `None` for state-change chatter,
/// announce messages and everything else.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    if line.contains("master offset") {
        let (offset_ns, freq_ppb) = extract_offset_freq(line, "offset")?;
        return Some(ParsedLine {
            daemon: SyncDaemon::Ptp4l,
            offset_ns,
            freq_ppb,
        });
    }
    if line.contains("phc offset") || line.contains("sys offset") {
        let (offset_ns, freq_ppb) = extract_offset_freq(line, "offset")?;
        return Some(ParsedLine {
            daemon: SyncDaemon::Phc2sys,
            offset_ns,
            freq_ppb,
        });
    }
    None
}

/// Pull the signed integer following `key` and the one following
/// `freq` out of a whitespace-tokenized line.
fn extract_offset_freq(line: &str, key: &str) -> Option<(i64, i64)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let offset = value_after(&tokens, key)?;
    let freq = value_after(&tokens, "freq")?;
    Some((offset, freq))
}

fn value_after(tokens: &[&str], key: &str) -> Option<i64> {
    let idx = tokens.iter().position(|t| *t == key)?;
    let raw = tokens.get(idx + 1)?;
    raw.trim_start_matches('+').parse().ok()
}
