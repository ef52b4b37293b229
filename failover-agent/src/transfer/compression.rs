//! Pluggable stream compression.

use std::fmt;

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use tokio::io::BufReader;

use super::layers::{BoxedReader, BoxedWriter};
use crate::utils::errors::{AgentError, Result};

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// A symmetric codec wrapped around both halves of a session.
pub trait CodecStage: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn wrap_reader<'a>(&self, inner: BoxedReader<'a>) -> BoxedReader<'a>;

    fn wrap_writer<'a>(&self, inner: BoxedWriter<'a>) -> BoxedWriter<'a>;
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdStage {
    level: i32,
}

impl ZstdStage {
    pub fn new(level: i32) -> Result<Self> {
        if !zstd::compression_level_range().contains(&level) {
            return Err(AgentError::Compression(format!(
                "zstd level {} outside supported range {:?}",
                level,
                zstd::compression_level_range()
            )));
        }
        Ok(Self { level })
    }

    #[cfg(test)]
    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdStage {
    fn default() -> Self {
        Self {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl CodecStage for ZstdStage {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn wrap_reader<'a>(&self, inner: BoxedReader<'a>) -> BoxedReader<'a> {
        let mut decoder = ZstdDecoder::new(BufReader::new(inner));
        decoder.multiple_members(true);
        Box::new(decoder)
    }

    fn wrap_writer<'a>(&self, inner: BoxedWriter<'a>) -> BoxedWriter<'a> {
        Box::new(ZstdEncoder::with_quality(inner, Level::Precise(self.level)))
    }
}

/// Compress only when the target asks for it and the traffic leaves the zone.
pub fn should_compress(preferred: bool, source_zone: &str, destination_zone: &str) -> bool {
    preferred && source_zone != destination_zone
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_needs_preference_and_zone_change() {
        assert!(should_compress(true, "eu-1", "us-1"));
        assert!(!should_compress(true, "eu-1", "eu-1"));
        assert!(!should_compress(false, "eu-1", "us-1"));
    }

    #[test]
    fn test_level_validated() {
        assert!(ZstdStage::new(3).is_ok());
        assert!(matches!(ZstdStage::new(1000), Err(AgentError::Compression(_))));
        assert_eq!(ZstdStage::default().level(), DEFAULT_ZSTD_LEVEL);
    }
}
