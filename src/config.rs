//! Runtime configuration.
//!
//! Loaded from `medivoice.toml` in the working directory when present,
//! falling back to defaults otherwise. The API credential can always be
//! supplied or overridden through the `GEMINI_API_KEY` environment variable.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API credential. Empty means not configured.
    pub api_key: String,
    /// WebSocket endpoint of the duplex realtime API.
    pub live_endpoint: String,
    /// HTTPS base of the single-shot content API.
    pub api_endpoint: String,
    /// Model served over the realtime endpoint.
    pub live_model: String,
    /// Model used for single-shot image analysis.
    pub analysis_model: String,
    /// Prebuilt voice name for spoken replies.
    pub voice: String,
    /// BCP-47 code of the spoken language.
    pub language: String,
    pub capture_device: String,
    pub playback_device: String,
    pub transcribe_input: bool,
    pub transcribe_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            live_endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent".into(),
            api_endpoint: "https://generativelanguage.googleapis.com/v1beta".into(),
            live_model: "models/gemini-2.0-flash-live-001".into(),
            analysis_model: "gemini-2.0-flash".into(),
            voice: "Aoede".into(),
            language: "en-US".into(),
            capture_device: "default".into(),
            playback_device: "default".into(),
            transcribe_input: true,
            transcribe_output: true,
        }
    }
}

impl Config {
    /// Load `medivoice.toml` if present, then apply environment overrides.
    pub fn load() -> Self {
        Self::load_from(Path::new("medivoice.toml")).apply_env()
    }

    /// Load from a specific file; a missing or unreadable file means
    /// defaults, a malformed one is reported and also falls back.
    pub fn load_from(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("ignoring malformed config {}: {e}", path.display());
                Self::default()
            }
        }
    }

    fn apply_env(mut self) -> Self {
        if let Ok(key) = std::env::var("GEMINI_API_KEY")
            && !key.is_empty()
        {
            self.api_key = key;
        }
        self
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/medivoice.toml"));
        assert!(!config.has_credential());
        assert_eq!(config.language, "en-US");
        assert_eq!(config.capture_device, "default");
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_key = \"k-123\"\nlanguage = \"hi-IN\"").unwrap();

        let config = Config::load_from(file.path());
        assert!(config.has_credential());
        assert_eq!(config.api_key, "k-123");
        assert_eq!(config.language, "hi-IN");
        // Untouched fields keep their defaults.
        assert_eq!(config.voice, "Aoede");
        assert!(config.transcribe_output);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_key = [not toml").unwrap();

        let config = Config::load_from(file.path());
        assert!(!config.has_credential());
    }
}
