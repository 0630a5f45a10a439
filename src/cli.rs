//! Pieces shared by the command-line tools.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use log::{LevelFilter, Metadata, Record};
use sha1::{Digest, Sha1};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Routes `log` output to stderr. Warnings always show; `verbose` adds
/// load, reset and interrupt diagnostics.
pub fn init_logger(verbose: bool) -> Result<()> {
    log::set_logger(&LOGGER).context("failed to install logger")?;
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    Ok(())
}

/// Base64 SHA-1 of an RGBA frame, the format test-ROM suites publish.
pub fn frame_sha1(frame_rgba: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha1::digest(frame_rgba))
}

/// Same digest over the frame with the alpha channel dropped.
pub fn frame_sha1_rgb(frame_rgba: &[u8]) -> String {
    let mut rgb = Vec::with_capacity(frame_rgba.len() / 4 * 3);
    for px in frame_rgba.chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
    }
    BASE64_STANDARD.encode(Sha1::digest(&rgb))
}

/// Parses `$C000`, `0xC000` or `C000`.
pub fn parse_hex_u16(text: &str) -> Result<u16> {
    let digits = text
        .trim_start_matches('$')
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(digits, 16).with_context(|| format!("invalid hex address: {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_hash_matches_sha1_of_nothing() {
        assert_eq!(frame_sha1(&[]), "2jmj7l5rSw0yVb/vlWAYkK/YBwk=");
        assert_eq!(frame_sha1_rgb(&[]), "2jmj7l5rSw0yVb/vlWAYkK/YBwk=");
    }

    #[test]
    fn rgb_hash_ignores_alpha() {
        let a = [1, 2, 3, 0xFF, 4, 5, 6, 0xFF];
        let b = [1, 2, 3, 0x00, 4, 5, 6, 0x7F];
        assert_eq!(frame_sha1_rgb(&a), frame_sha1_rgb(&b));
        assert_ne!(frame_sha1(&a), frame_sha1(&b));
    }

    #[test]
    fn hex_addresses_accept_common_prefixes() {
        assert_eq!(parse_hex_u16("$C000").unwrap(), 0xC000);
        assert_eq!(parse_hex_u16("0x8001").unwrap(), 0x8001);
        assert_eq!(parse_hex_u16("fffc").unwrap(), 0xFFFC);
        assert!(parse_hex_u16("zz").is_err());
        assert!(parse_hex_u16("12345").is_err());
    }

    #[test]
    fn logger_installs_once() {
        let _ = init_logger(false);
        let err = init_logger(true).unwrap_err();
        assert!(err.to_string().contains("failed to install logger"));
        assert_eq!(log::max_level(), LevelFilter::Warn);
    }
}
