//! Engine configuration: a `clap::Parser`-derived struct with an env-var
//! fallback for every flag. Every knob is a CLI flag with an env fallback and
//! a sensible default, so an embedding application can drive it from args,
//! from the environment, or construct it directly in code.

use clap::Parser;

use crate::compress::Compressor;
use crate::scheme_format::SchemeFormat;

/// Protocol engine configuration.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "CATS protocol engine configuration")]
pub struct EngineConfig {
    /// Protocol version this engine speaks.
    #[arg(long, env = "CATS_API_VERSION", default_value_t = 1)]
    pub api_version: u32,

    /// Default scheme format used when a peer's format is not yet known.
    #[arg(long, env = "CATS_SCHEME_FORMAT", default_value = "json", value_parser = parse_scheme_format)]
    pub scheme_format: SchemeFormat,

    /// Idle timeout in seconds; `0` disables it.
    #[arg(long, env = "CATS_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Per-`ask()` input timeout in seconds; `0` disables it.
    #[arg(long, env = "CATS_INPUT_TIMEOUT_SECS", default_value_t = 60)]
    pub input_timeout_secs: u64,

    /// Handshake timeout in seconds; `0` disables it.
    #[arg(long, env = "CATS_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Maximum depth of nested `ask()` calls per request unless the caller
    /// sets `bypass_count`.
    #[arg(long, env = "CATS_INPUT_LIMIT", default_value_t = 5)]
    pub input_limit: u32,

    /// Payloads at or above this size (bytes) spill through a temp file
    /// while being read.
    #[arg(long, env = "CATS_SPILL_THRESHOLD_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub spill_threshold_bytes: usize,

    /// Default outbound download-rate cap in bytes/sec; `0` disables pacing.
    #[arg(long, env = "CATS_DOWNLOAD_SPEED", default_value_t = 0)]
    pub download_speed: u64,

    /// Shared secret for the default SHA-256 handshake. Absent disables the
    /// handshake step entirely.
    #[arg(long, env = "CATS_HANDSHAKE_SECRET")]
    pub handshake_secret: Option<String>,

    /// Handshake timestamp tolerance, in 10-second steps each direction.
    #[arg(long, env = "CATS_HANDSHAKE_VALID_WINDOW", default_value_t = 3)]
    pub handshake_valid_window: u32,

    /// Log level for the crate's `tracing` instrumentation.
    #[arg(long, env = "CATS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON instead of human-readable text.
    #[arg(long, env = "CATS_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_version: 1,
            scheme_format: SchemeFormat::Json,
            idle_timeout_secs: 300,
            input_timeout_secs: 60,
            handshake_timeout_secs: 10,
            input_limit: 5,
            spill_threshold_bytes: 8 * 1024 * 1024,
            download_speed: 0,
            handshake_secret: None,
            handshake_valid_window: 3,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Option<std::time::Duration> {
        (self.idle_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn input_timeout(&self) -> Option<std::time::Duration> {
        (self.input_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.input_timeout_secs))
    }

    pub fn handshake_timeout(&self) -> Option<std::time::Duration> {
        (self.handshake_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.handshake_timeout_secs))
    }

    /// Ping cadence is `0.9 * idle_timeout`, so a reply always lands before
    /// the idle timer could fire.
    pub fn ping_interval(&self) -> Option<std::time::Duration> {
        self.idle_timeout().map(|d| d.mul_f64(0.9))
    }

    pub fn supported_compressors(&self) -> Vec<Compressor> {
        vec![Compressor::None, Compressor::Gzip, Compressor::Zlib]
    }

    /// Install a `tracing_subscriber` global subscriber from this config's
    /// `log_level`/`log_json`. Intended for binaries embedding the engine;
    /// libraries should not call this themselves.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        if self.log_json {
            let _ = subscriber.json().try_init();
        } else {
            let _ = subscriber.try_init();
        }
    }
}

fn parse_scheme_format(s: &str) -> Result<SchemeFormat, String> {
    match s.to_ascii_lowercase().as_str() {
        "json" => Ok(SchemeFormat::Json),
        "yaml" => Ok(SchemeFormat::Yaml),
        "toml" => Ok(SchemeFormat::Toml),
        other => Err(format!("unknown scheme format '{other}' (expected json|yaml|toml)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_disables_timer() {
        let mut cfg = EngineConfig::default();
        cfg.idle_timeout_secs = 0;
        assert!(cfg.idle_timeout().is_none());
    }

    #[test]
    fn ping_interval_is_90_percent_of_idle() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ping_interval().unwrap().as_secs_f64(), cfg.idle_timeout().unwrap().as_secs_f64() * 0.9);
    }
}
