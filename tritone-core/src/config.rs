use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{CoreResult, TritoneError};
use crate::model::Tone;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    /// Name of the environment variable that contains the API key.
    pub api_key_env: String,
    /// Base URL of the model API.
    #[serde(default = "default_base")]
    pub base: String,
    pub model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Token budget for the extended-thinking sub-stream; 0 disables it.
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget_tokens: u32,
}

fn default_base() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_max_output_tokens() -> u32 {
    1024
}
fn default_thinking_budget() -> u32 {
    2048
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Minimum interval between re-renders of any variant, in milliseconds.
    /// The final render after completion is always unconditional.
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,
    /// Capacity of the bounded merge channel between producer tasks and the
    /// outbound byte stream.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Which variant's completed text becomes the session transcript entry.
    #[serde(default = "default_transcript_tone")]
    pub transcript_tone: String,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            render_interval_ms: default_render_interval_ms(),
            channel_capacity: default_channel_capacity(),
            transcript_tone: default_transcript_tone(),
        }
    }
}

fn default_render_interval_ms() -> u64 {
    50
}
fn default_channel_capacity() -> usize {
    64
}
fn default_transcript_tone() -> String {
    "direct".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 300000ms; streams are
    /// long-lived)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub upstream: UpstreamCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older
    /// configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(TritoneError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| TritoneError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| TritoneError::Other(e.into()))?
            }
            Some("toml") => {
                toml::from_str::<Self>(s).map_err(|e| TritoneError::Other(e.into()))?
            }
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| TritoneError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| TritoneError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }

    /// Resolve the upstream API key, failing fast before any upstream call
    /// is attempted. A missing or empty credential is a configuration error.
    pub fn resolve_api_key(&self) -> CoreResult<SecretString> {
        let var = &self.upstream.api_key_env;
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(SecretString::new(v.into())),
            Ok(_) => Err(TritoneError::Configuration(format!(
                "credential variable '{var}' is empty"
            ))),
            Err(_) => Err(TritoneError::Configuration(format!(
                "credential variable '{var}' is not set"
            ))),
        }
    }

    /// The variant whose completed text feeds the session transcript.
    pub fn transcript_tone(&self) -> CoreResult<Tone> {
        Tone::from_id(&self.stream.transcript_tone).ok_or_else(|| {
            TritoneError::Configuration(format!(
                "unknown transcript tone '{}'",
                self.stream.transcript_tone
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tritone.json");
        let json = r#"{
          "upstream": {
            "api_key_env": "ANTHROPIC_API_KEY",
            "model": "claude-sonnet-4-5"
          },
          "stream": { "render_interval_ms": 80, "transcript_tone": "poetic" }
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.upstream.base, "https://api.anthropic.com");
        assert_eq!(cfg.upstream.max_output_tokens, 1024);
        assert_eq!(cfg.stream.render_interval_ms, 80);
        assert_eq!(cfg.stream.channel_capacity, 64);
        assert_eq!(cfg.transcript_tone().unwrap(), Tone::Poetic);
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tritone.toml");
        let toml = r#"
[upstream]
api_key_env = "ANTHROPIC_API_KEY"
model = "claude-sonnet-4-5"
max_output_tokens = 2048

[http]
request_timeout_ms = 120000
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.upstream.max_output_tokens, 2048);
        assert_eq!(cfg.http.request_timeout_ms, 120_000);
        assert_eq!(cfg.stream.transcript_tone, "direct");
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("tritone.conf");
        let json = r#"{"upstream":{"api_key_env":"K","model":"m"}}"#;
        fs::write(&json_path, json).unwrap();
        let cfg = Config::from_path(&json_path).unwrap();
        assert_eq!(cfg.upstream.model, "m");

        let toml_path = dir.path().join("tritone2.conf");
        let toml = "[upstream]\napi_key_env = \"K\"\nmodel = \"m2\"\n";
        fs::write(&toml_path, toml).unwrap();
        let cfg = Config::from_path(&toml_path).unwrap();
        assert_eq!(cfg.upstream.model, "m2");
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/tritone-missing.json");
        let err = Config::from_path(&missing).unwrap_err();
        match err {
            TritoneError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_json_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.json");
        fs::write(&file, r#"{ "upstream": { "api_key_env": 1 }"#).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        match err {
            TritoneError::Other(_) => {}
            other => panic!("expected Other(json parse) error, got: {:?}", other),
        }
    }

    fn minimal_cfg(api_key_env: &str) -> Config {
        Config {
            upstream: UpstreamCfg {
                api_key_env: api_key_env.into(),
                base: default_base(),
                model: "claude-sonnet-4-5".into(),
                max_output_tokens: 1024,
                thinking_budget_tokens: 0,
            },
            stream: StreamCfg::default(),
            http: HttpCfg::default(),
        }
    }

    #[test]
    fn missing_credential_fails_fast() {
        let cfg = minimal_cfg("TRITONE_TEST_KEY_THAT_IS_NOT_SET");
        let err = cfg.resolve_api_key().unwrap_err();
        match err {
            TritoneError::Configuration(msg) => assert!(msg.contains("not set")),
            other => panic!("expected Configuration error, got: {:?}", other),
        }
    }

    #[test]
    fn unknown_transcript_tone_is_configuration_error() {
        let mut cfg = minimal_cfg("K");
        cfg.stream.transcript_tone = "gruff".into();
        let err = cfg.transcript_tone().unwrap_err();
        assert!(matches!(err, TritoneError::Configuration(_)));
    }
}
