//! CLI subcommand implementations. `resolve` runs a one-shot lookup;
//! `serve` stands the `/resolve` HTTP handler up on a bound address.

use std::time::Duration;

use anyhow::Error;

pub mod resolve;
pub mod serve;

/// Parses a bare number (seconds) or a number with an `s`/`m`/`h`/`d`
/// suffix, the same shape `parse_duration` uses elsewhere for `--max-stale`.
pub fn parse_duration(src: &str) -> Result<Duration, Error> {
    let suffix_pos = src.find(char::is_alphabetic).unwrap_or(src.len());

    let num: u64 = src[..suffix_pos].parse()?;
    let suffix = if suffix_pos == src.len() {
        "s"
    } else {
        &src[suffix_pos..]
    };

    let duration = match suffix {
        "s" | "S" => Duration::from_secs(num),
        "m" | "M" => Duration::from_secs(num * 60),
        "h" | "H" => Duration::from_secs(num * 60 * 60),
        "d" | "D" => Duration::from_secs(num * 60 * 60 * 24),
        s => return Err(anyhow::anyhow!("unknown duration suffix '{}'", s)),
    };

    Ok(duration)
}
