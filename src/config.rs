//! # Configuration Management
//!
//! Loads the bridge configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables prefixed with `APP_`, using `__` between sections
//! - The platform variables `HOST`, `PORT` and `OPENAI_API_KEY`
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are read from TOML/env and written back out as JSON for `/config`
//! - **Builder pattern**: `config::Config::builder()` stacks the sources in priority order
//! - **Conversions**: `session_settings()` / `realtime_settings()` turn the flat config into the
//!   typed settings each call snapshots when it starts
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `OPENAI_API_KEY`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_REALTIME__VOICE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values

use crate::call::{BridgeSettings, SessionSettings};
use crate::error::{BridgeError, BridgeResult};
use crate::realtime::{RealtimeAudioFormat, RealtimeSettings, RetryPolicy};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Highest dashboard sample rate we are willing to transcode to.
const MAX_OBSERVER_RATE: u32 = 48_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub session: CallSessionConfig,
    pub observer: ObserverConfig,
}

/// Where the HTTP/WebSocket server listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection and behaviour of the realtime AI service.
///
/// ## Fields worth knowing:
/// - `audio_format`: `pcm16` (24 kHz linear, transcoded here) or `g711_ulaw` (passed through)
/// - `vad_*`: server-side voice activity detection; lower `vad_threshold` means more sensitive
/// - `connect_*`: bounded exponential backoff used for the first connect and for reconnects
/// - `end_call_*`: the assistant may hang up via the `end_call` tool after a short farewell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub voice: String,
    pub language: String,
    pub instructions: String,
    pub greeting: Option<String>,
    pub temperature: f32,
    pub audio_format: String,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub barge_in: bool,
    pub end_call_tool: bool,
    pub end_call_grace_ms: u64,
    pub farewell_watchdog_ms: u64,
}

/// Per-call limits.
///
/// ## Tuning guidelines:
/// - `queue_capacity` is in frames; telephony frames are 20 ms, so 200 ≈ 4 s of audio
/// - `max_call_duration_secs = 0` means no limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSessionConfig {
    pub queue_capacity: usize,
    pub operator_queue_capacity: usize,
    pub shutdown_grace_ms: u64,
    pub max_concurrent_calls: usize,
    pub max_call_duration_secs: u64,
}

/// Dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub sample_rate: u32,
    pub queue_capacity: usize,
    pub token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5050,
            },
            realtime: RealtimeConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-realtime-mini-2025-10-06".to_string(),
                api_key: None,
                voice: "alloy".to_string(),
                language: "en".to_string(),
                instructions: "You are a friendly phone assistant. Keep answers short and natural. \
                    If you did not understand the caller, ask them to repeat instead of guessing. \
                    Repeat back names, addresses and phone numbers to confirm them."
                    .to_string(),
                greeting: None,
                temperature: 0.8,
                audio_format: "pcm16".to_string(),
                vad_threshold: 0.5,
                prefix_padding_ms: 100,
                silence_duration_ms: 200,
                connect_attempts: 3,
                connect_backoff_ms: 500,
                max_backoff_ms: 4000,
                barge_in: true,
                end_call_tool: true,
                end_call_grace_ms: 3000,
                farewell_watchdog_ms: 4000,
            },
            session: CallSessionConfig {
                queue_capacity: 200,
                operator_queue_capacity: 200,
                shutdown_grace_ms: 2000,
                max_concurrent_calls: 50,
                max_call_duration_secs: 0,
            },
            observer: ObserverConfig {
                sample_rate: 24_000,
                queue_capacity: 256,
                token: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=8080`: override the listen port
    /// - `APP_REALTIME__VOICE=verse`: change the assistant voice
    /// - `APP_SESSION__MAX_CALL_DURATION_SECS=600`: cap calls at ten minutes
    /// - `OPENAI_API_KEY=...`: credentials for the realtime service
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("realtime.api_key", key)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values make sense together.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.server.port == 0 {
            return Err(BridgeError::Validation("Server port cannot be 0".to_string()));
        }
        if self.session.queue_capacity == 0 || self.session.operator_queue_capacity == 0 {
            return Err(BridgeError::Validation("Queue capacities must be greater than 0".to_string()));
        }
        if self.observer.queue_capacity == 0 {
            return Err(BridgeError::Validation("Observer queue capacity must be greater than 0".to_string()));
        }
        if self.session.max_concurrent_calls == 0 {
            return Err(BridgeError::Validation("Max concurrent calls must be greater than 0".to_string()));
        }
        if self.realtime.connect_attempts == 0 {
            return Err(BridgeError::Validation("Connect attempts must be greater than 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.realtime.vad_threshold) {
            return Err(BridgeError::Validation("VAD threshold must be between 0 and 1".to_string()));
        }
        if self.observer.sample_rate == 0 || self.observer.sample_rate > MAX_OBSERVER_RATE {
            return Err(BridgeError::Validation(format!(
                "Observer sample rate must be between 1 and {}",
                MAX_OBSERVER_RATE
            )));
        }
        self.realtime.audio_format.parse::<RealtimeAudioFormat>()?;
        Ok(())
    }

    /// Apply a partial JSON document (used by `PUT /config`).
    ///
    /// Only runtime tunables may be changed; anything else (listen address,
    /// credentials, service URL) is rejected. The update is all-or-nothing:
    /// it is applied to a copy, validated, and only then written back.
    ///
    /// ## Example:
    /// `{"realtime": {"barge_in": false}, "session": {"max_call_duration_secs": 300}}`
    pub fn update_from_json(&mut self, json_str: &str) -> BridgeResult<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let sections = partial
            .as_object()
            .ok_or_else(|| BridgeError::BadRequest("Config update must be a JSON object".to_string()))?;

        let mut updated = self.clone();
        for (section, fields) in sections {
            let fields = fields
                .as_object()
                .ok_or_else(|| BridgeError::BadRequest(format!("'{}' must be an object", section)))?;

            for (key, value) in fields {
                updated.apply_field(section, key, value)?;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    fn apply_field(&mut self, section: &str, key: &str, value: &serde_json::Value) -> BridgeResult<()> {
        let invalid = || BridgeError::BadRequest(format!("Invalid value for {}.{}", section, key));
        let as_u64 = || value.as_u64().ok_or_else(invalid);
        let as_u32 = || as_u64().and_then(|v| u32::try_from(v).map_err(|_| invalid()));
        let as_usize = || as_u64().and_then(|v| usize::try_from(v).map_err(|_| invalid()));
        let as_string = || value.as_str().map(str::to_string).ok_or_else(invalid);

        match (section, key) {
            ("realtime", "barge_in") => self.realtime.barge_in = value.as_bool().ok_or_else(invalid)?,
            ("realtime", "vad_threshold") => {
                self.realtime.vad_threshold = value.as_f64().ok_or_else(invalid)? as f32
            }
            ("realtime", "prefix_padding_ms") => self.realtime.prefix_padding_ms = as_u32()?,
            ("realtime", "silence_duration_ms") => self.realtime.silence_duration_ms = as_u32()?,
            ("realtime", "voice") => self.realtime.voice = as_string()?,
            ("realtime", "instructions") => self.realtime.instructions = as_string()?,
            ("realtime", "greeting") => {
                self.realtime.greeting = if value.is_null() { None } else { Some(as_string()?) }
            }
            ("session", "queue_capacity") => self.session.queue_capacity = as_usize()?,
            ("session", "operator_queue_capacity") => {
                self.session.operator_queue_capacity = as_usize()?
            }
            ("session", "shutdown_grace_ms") => self.session.shutdown_grace_ms = as_u64()?,
            ("session", "max_call_duration_secs") => self.session.max_call_duration_secs = as_u64()?,
            ("observer", "queue_capacity") => self.observer.queue_capacity = as_usize()?,
            _ => {
                return Err(BridgeError::Validation(format!(
                    "{}.{} cannot be changed at runtime",
                    section, key
                )))
            }
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            queue_capacity: self.session.queue_capacity,
            operator_queue_capacity: self.session.operator_queue_capacity,
            observer_queue_capacity: self.observer.queue_capacity,
            shutdown_grace: Duration::from_millis(self.session.shutdown_grace_ms),
            max_call_duration: match self.session.max_call_duration_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn realtime_settings(&self) -> BridgeResult<RealtimeSettings> {
        let rt = &self.realtime;
        Ok(RealtimeSettings {
            instructions: rt.instructions.clone(),
            voice: rt.voice.clone(),
            language: rt.language.clone(),
            temperature: rt.temperature,
            greeting: rt.greeting.clone(),
            audio_format: rt.audio_format.parse()?,
            vad_threshold: rt.vad_threshold,
            prefix_padding_ms: rt.prefix_padding_ms,
            silence_duration_ms: rt.silence_duration_ms,
            barge_in: rt.barge_in,
            end_call_tool: rt.end_call_tool,
            end_call_grace: Duration::from_millis(rt.end_call_grace_ms),
            farewell_watchdog: Duration::from_millis(rt.farewell_watchdog_ms),
            retry: RetryPolicy {
                attempts: rt.connect_attempts,
                initial_backoff: Duration::from_millis(rt.connect_backoff_ms),
                max_backoff: Duration::from_millis(rt.max_backoff_ms),
            },
        })
    }

    /// Everything a new call snapshots when it starts.
    pub fn bridge_settings(&self) -> BridgeResult<BridgeSettings> {
        Ok(BridgeSettings {
            session: self.session_settings(),
            realtime: self.realtime_settings()?,
        })
    }

    /// JSON view for `GET /config`; the API key is reported only as present or not.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(realtime) = value.get_mut("realtime").and_then(|r| r.as_object_mut()) {
            realtime.remove("api_key");
            realtime.insert(
                "api_key_configured".to_string(),
                serde_json::Value::Bool(self.realtime.api_key.is_some()),
            );
        }
        if let Some(observer) = value.get_mut("observer").and_then(|o| o.as_object_mut()) {
            observer.remove("token");
            observer.insert(
                "token_configured".to_string(),
                serde_json::Value::Bool(self.observer.token.is_some()),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5050);
        assert!(config.validate().is_ok());

        let settings = config.bridge_settings().unwrap();
        assert_eq!(settings.realtime.audio_format, RealtimeAudioFormat::Pcm16);
        assert_eq!(settings.realtime.retry.attempts, 3);
        assert!(settings.session.max_call_duration.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.realtime.audio_format = "opus".to_string();
        assert!(matches!(config.validate(), Err(BridgeError::Validation(_))));

        let mut config = AppConfig::default();
        config.observer.sample_rate = 96_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.realtime.vad_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"realtime": {"barge_in": false, "voice": "verse"}, "session": {"max_call_duration_secs": 300}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!(!config.realtime.barge_in);
        assert_eq!(config.realtime.voice, "verse");
        assert_eq!(config.session_settings().max_call_duration, Some(Duration::from_secs(300)));
        assert_eq!(config.server.port, 5050);
    }

    #[test]
    fn test_update_rejects_non_runtime_fields() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 9000}}"#).is_err());
        assert!(config.update_from_json(r#"{"realtime": {"api_key": "sk-x"}}"#).is_err());
        assert_eq!(config.server.port, 5050);
    }

    #[test]
    fn test_invalid_update_is_not_applied() {
        let mut config = AppConfig::default();
        let result = config.update_from_json(r#"{"realtime": {"voice": "verse"}, "session": {"queue_capacity": 0}}"#);
        assert!(result.is_err());
        assert_eq!(config.realtime.voice, "alloy");
        assert_eq!(config.session.queue_capacity, 200);
    }

    #[test]
    fn test_out_of_range_update_is_rejected() {
        let mut config = AppConfig::default();
        let result = config.update_from_json(r#"{"realtime": {"prefix_padding_ms": 4294967301}}"#);
        assert!(matches!(result, Err(BridgeError::BadRequest(_))));
        assert_eq!(config.realtime.prefix_padding_ms, 100);

        assert!(config.update_from_json(r#"{"realtime": {"silence_duration_ms": -5}}"#).is_err());
        assert_eq!(config.realtime.silence_duration_ms, 200);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = AppConfig::default();
        config.realtime.api_key = Some("sk-secret".to_string());
        let value = config.redacted();
        assert!(value["realtime"].get("api_key").is_none());
        assert_eq!(value["realtime"]["api_key_configured"], true);
        assert_eq!(value["observer"]["token_configured"], false);
        assert!(!value.to_string().contains("sk-secret"));
    }
}
