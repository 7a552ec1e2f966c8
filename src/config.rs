//! Command-line and environment configuration, loaded once at startup.

use crate::gemini::{GeminiConfig, ResponseModality};
use crate::supervisor::RunSettings;
use clap::{ArgAction, Parser};
use std::path::Path;
use std::time::Duration;

/// Default location of the optional environment file.
pub const ENV_FILE: &str = ".env";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a professional and detailed AI assistant. \
Please provide as thorough an answer as possible to the user's questions.";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--{0} must be greater than zero")]
    Zero(&'static str),

    #[error("at least one non-empty --termination-phrase is required")]
    NoTerminationPhrase,
}

/// Talk to Gemini Live with your voice and screen.
#[derive(Debug, Parser, Clone)]
#[command(name = "screenchat", version)]
pub struct AppConfig {
    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// System instruction sent at session setup
    #[arg(long, env = "SYSTEM_PROMPT", default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,

    #[arg(long, default_value = "models/gemini-2.0-flash-exp")]
    pub model: String,

    #[arg(long, default_value = "v1alpha")]
    pub api_version: String,

    #[arg(long, value_enum, default_value = "audio")]
    pub response_modality: ResponseModality,

    #[arg(long = "connect-timeout-secs", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Base unit for retry delays and frame cadence
    #[arg(long = "time-unit-ms", default_value_t = 1000)]
    pub time_unit_ms: u64,

    /// Capacity of the outbound audio and frame queues
    #[arg(long, default_value_t = 5)]
    pub outbound_capacity: usize,

    /// Capacity of the playback queue (unbounded when unset)
    #[arg(long)]
    pub inbound_capacity: Option<usize>,

    /// Time units between screen frames
    #[arg(long, default_value_t = 2)]
    pub frame_interval_units: u32,

    /// Reply text that ends the conversation (case-insensitive)
    #[arg(
        long = "termination-phrase",
        action = ArgAction::Append,
        default_value = "goodbye",
        value_name = "PHRASE"
    )]
    pub termination_phrases: Vec<String>,

    /// PulseAudio source to record from
    #[arg(long, env = "SCREENCHAT_INPUT_DEVICE")]
    pub input_device: Option<String>,

    /// PulseAudio sink to play to
    #[arg(long, env = "SCREENCHAT_OUTPUT_DEVICE")]
    pub output_device: Option<String>,

    /// Don't capture the screen
    #[arg(long, default_value_t = false)]
    pub no_screen: bool,

    /// Debug logging for this crate
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

/// Load `KEY=value` lines from `path` into the process environment.
/// Variables that are already set keep their value. `Ok(false)` when the
/// file does not exist.
pub fn load_env_file(path: &Path) -> Result<bool, dotenvy::Error> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_unit_ms == 0 {
            return Err(ConfigError::Zero("time-unit-ms"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Zero("connect-timeout-secs"));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Zero("outbound-capacity"));
        }
        if self.inbound_capacity == Some(0) {
            return Err(ConfigError::Zero("inbound-capacity"));
        }
        if self.frame_interval_units == 0 {
            return Err(ConfigError::Zero("frame-interval-units"));
        }
        if self.termination_phrases.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::NoTerminationPhrase);
        }
        Ok(())
    }

    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.api_key.clone(),
            api_version: self.api_version.clone(),
            model: self.model.clone(),
            response_modality: self.response_modality,
            system_instruction: Some(self.system_prompt.clone()).filter(|p| !p.is_empty()),
            transcribe_output: true,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            time_unit: Duration::from_millis(self.time_unit_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            outbound_capacity: self.outbound_capacity,
            inbound_capacity: self.inbound_capacity,
            frame_interval_units: self.frame_interval_units,
            termination_phrases: self
                .termination_phrases
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            ..RunSettings::default()
        }
    }
}
