use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::caps::{Caps, DEFAULT_RAW_CAPS};
use crate::error::{DecodeError, Result};

pub const DEFAULT_LOW_PERCENT: u32 = 10;
pub const DEFAULT_HIGH_PERCENT: u32 = 99;

/// User-visible configuration of the engine. Loadable from TOML; every
/// field has the documented default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DecodeBinConfig {
    /// Stop-set: streams whose caps are a subset of these are exposed
    /// without further plugging.
    pub caps: Caps,
    /// Applied to every chain element owning a `subtitle-encoding` property.
    pub subtitle_encoding: Option<String>,
    /// Forces the initial type-finder output.
    pub sink_caps: Option<Caps>,
    /// Enables queue-based buffering reporting.
    pub use_buffering: bool,
    pub low_percent: u32,
    pub high_percent: u32,
    pub low_watermark: f64,
    pub high_watermark: f64,
    /// Per-queue byte cap; 0 selects the automatic regime.
    pub max_size_bytes: u64,
    pub max_size_buffers: u64,
    /// Nanoseconds; 0 selects the automatic regime.
    pub max_size_time: u64,
    /// Progressive download buffering when the duration is known.
    pub download: bool,
    /// Bytes; 0 disables ring buffering.
    pub ring_buffer_max_size: u64,
    /// In kbit/s; propagated to demuxers and biasing redirect order.
    pub connection_speed: u64,
    /// When false, undecodable streams and raw streams outside the
    /// stop-set are silently discarded.
    pub expose_all_streams: bool,
    /// Emit a topology element message on expose.
    pub post_stream_topology: bool,
    /// Expose parsed elementary streams instead of decoding.
    pub parse_streams: bool,
    /// Apply URI changes immediately rather than at the EOS boundary.
    pub instant_uri: bool,
}

impl Default for DecodeBinConfig {
    fn default() -> Self {
        Self {
            caps: DEFAULT_RAW_CAPS.clone(),
            subtitle_encoding: None,
            sink_caps: None,
            use_buffering: false,
            low_percent: DEFAULT_LOW_PERCENT,
            high_percent: DEFAULT_HIGH_PERCENT,
            low_watermark: DEFAULT_LOW_PERCENT as f64 / 100.0,
            high_watermark: DEFAULT_HIGH_PERCENT as f64 / 100.0,
            max_size_bytes: 0,
            max_size_buffers: 0,
            max_size_time: 0,
            download: false,
            ring_buffer_max_size: 0,
            connection_speed: 0,
            expose_all_streams: true,
            post_stream_topology: false,
            parse_streams: false,
            instant_uri: false,
        }
    }
}

impl DecodeBinConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: DecodeBinConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.low_percent > 100 || self.high_percent > 100 {
            return Err(DecodeError::Configuration(
                "buffering percentages must be within 0..=100".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.low_watermark)
            || !(0.0..=1.0).contains(&self.high_watermark)
        {
            return Err(DecodeError::Configuration(
                "watermarks must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.low_percent > self.high_percent {
            return Err(DecodeError::Configuration(
                "low-percent must not exceed high-percent".to_string(),
            ));
        }
        Ok(())
    }

    /// Keeps the legacy percent properties and the watermarks in sync.
    pub fn set_low_percent(&mut self, percent: u32) {
        self.low_percent = percent.min(100);
        self.low_watermark = self.low_percent as f64 / 100.0;
    }

    pub fn set_high_percent(&mut self, percent: u32) {
        self.high_percent = percent.min(100);
        self.high_watermark = self.high_percent as f64 / 100.0;
    }

    pub fn set_low_watermark(&mut self, watermark: f64) {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self.low_percent = (self.low_watermark * 100.0) as u32;
    }

    pub fn set_high_watermark(&mut self, watermark: f64) {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self.high_percent = (self.high_watermark * 100.0) as u32;
    }
}
