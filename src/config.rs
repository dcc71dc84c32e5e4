//! Typed per-run configuration for the standard pipeline stages.
//!
//! Every stage has a fixed option record with enumerated fields and explicit
//! defaults. Requests carry raw JSON sections keyed by stage name; validation
//! parses each section with `deny_unknown_fields`, so a misspelled or
//! unsupported option fails submission instead of being silently dropped.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::pipeline::names;

/// Episode flavor a run produces; selects planning templates downstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    #[default]
    RaceReview,
    QualifyingAnalysis,
    NewsUpdate,
}

impl EpisodeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RaceReview => "race_review",
            Self::QualifyingAnalysis => "qualifying_analysis",
            Self::NewsUpdate => "news_update",
        }
    }
}

/// Whether a run produces audio or stops after the script.
///
/// Text-only runs drop the voice-synthesis and audio-production stages from
/// the compiled plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStyle {
    #[default]
    Full,
    TextOnly,
}

/// Depth of technical commentary in the content outline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalLevel {
    Basic,
    #[default]
    Mixed,
    Advanced,
}

/// Script register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStyle {
    #[default]
    Conversational,
    Formal,
}

/// Container format for synthesized audio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Ogg,
    Wav,
}

/// Options recognized by the research stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct ResearchOptions {
    /// Bypass cached research data and fetch fresh sources.
    pub force_refresh: bool,
    /// Minimum number of sources the stage must gather.
    pub min_sources: u32,
}

impl Default for ResearchOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            min_sources: 5,
        }
    }
}

/// Options recognized by the content-planning stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct PlanningOptions {
    /// Target episode duration in seconds.
    pub target_duration_secs: u32,
    pub technical_level: TechnicalLevel,
}

impl Default for PlanningOptions {
    fn default() -> Self {
        Self {
            target_duration_secs: 1800,
            technical_level: TechnicalLevel::default(),
        }
    }
}

/// Options recognized by the script-generation stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct ScriptOptions {
    pub style: ScriptStyle,
    /// Number of host voices the script is written for.
    pub host_count: u8,
    /// Insert spoken transitions between outline sections.
    pub include_transitions: bool,
    /// Minimum words the generated script must contain.
    pub min_word_count: u32,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            style: ScriptStyle::default(),
            host_count: 2,
            include_transitions: true,
            min_word_count: 1500,
        }
    }
}

/// Options recognized by the voice-synthesis stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct VoiceOptions {
    pub format: AudioFormat,
    pub sample_rate_hz: u32,
    /// Emit SSML markup for emotion and emphasis control.
    pub use_ssml: bool,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            sample_rate_hz: 44_100,
            use_ssml: false,
        }
    }
}

/// Options recognized by the audio-production stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct AudioOptions {
    pub bitrate_kbps: u32,
    pub enable_sound_effects: bool,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            bitrate_kbps: 192,
            enable_sound_effects: true,
        }
    }
}

/// Raw run submission: event identity plus per-stage JSON option sections.
///
/// Sections are keyed by stage name; anything that is not a known stage, or
/// any field a stage does not recognize, fails validation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RunRequest {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub episode: EpisodeKind,
    #[serde(default)]
    pub output_style: OutputStyle,
    /// Per-stage option overrides, keyed by stage name.
    #[serde(default)]
    pub options: FxHashMap<String, Value>,
}

impl RunRequest {
    /// Request for the given episode kind with all stage defaults.
    #[must_use]
    pub fn new(episode: EpisodeKind) -> Self {
        Self {
            episode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    #[must_use]
    pub fn with_output_style(mut self, output_style: OutputStyle) -> Self {
        self.output_style = output_style;
        self
    }

    /// Adds one stage's option section as raw JSON.
    #[must_use]
    pub fn with_stage_options(mut self, stage: impl Into<String>, options: Value) -> Self {
        self.options.insert(stage.into(), options);
        self
    }
}

/// Fully validated run parameters: one typed record per stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub event_id: Option<String>,
    pub episode: EpisodeKind,
    pub output_style: OutputStyle,
    pub research: ResearchOptions,
    pub planning: PlanningOptions,
    pub script: ScriptOptions,
    pub voice: VoiceOptions,
    pub audio: AudioOptions,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            event_id: None,
            episode: EpisodeKind::default(),
            output_style: OutputStyle::default(),
            research: ResearchOptions::default(),
            planning: PlanningOptions::default(),
            script: ScriptOptions::default(),
            voice: VoiceOptions::default(),
            audio: AudioOptions::default(),
        }
    }
}

impl RunParams {
    /// Validates a raw request into typed per-stage records.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownStageSection`] for a section key that names no
    /// stage; [`ConfigError::UnrecognizedOption`] when a section contains a
    /// field its stage does not enumerate.
    pub fn validate(request: &RunRequest) -> Result<Self, ConfigError> {
        let mut params = Self {
            event_id: request.event_id.clone(),
            episode: request.episode,
            output_style: request.output_style,
            ..Self::default()
        };

        for (section, raw) in &request.options {
            match section.as_str() {
                names::RESEARCH => params.research = parse_section(section, raw)?,
                names::CONTENT_PLANNING => params.planning = parse_section(section, raw)?,
                names::SCRIPT_GENERATION => params.script = parse_section(section, raw)?,
                names::VOICE_SYNTHESIS => params.voice = parse_section(section, raw)?,
                names::AUDIO_PRODUCTION => params.audio = parse_section(section, raw)?,
                other => {
                    return Err(ConfigError::UnknownStageSection {
                        section: other.to_string(),
                    });
                }
            }
        }
        Ok(params)
    }

    /// The value seeded into the initial `request` namespace of a run.
    #[must_use]
    pub fn initial_namespace(&self) -> Value {
        json!({
            "event_id": self.event_id,
            "episode": self.episode,
            "output_style": self.output_style,
        })
    }
}

fn parse_section<T: for<'de> Deserialize<'de>>(
    section: &str,
    raw: &Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(raw.clone()).map_err(|source| ConfigError::UnrecognizedOption {
        stage: section.to_string(),
        source,
    })
}

/// Request validation failures. Always fatal; never retried.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("option section `{section}` does not name a pipeline stage")]
    #[diagnostic(
        code(castflow::config::unknown_stage_section),
        help("Valid sections: research, content_planning, script_generation, voice_synthesis, audio_production.")
    )]
    UnknownStageSection { section: String },

    #[error("stage `{stage}` rejected its option record: {source}")]
    #[diagnostic(
        code(castflow::config::unrecognized_option),
        help("Unknown options are rejected at validation, not ignored; check field names against the stage's option record.")
    )]
    UnrecognizedOption {
        stage: String,
        #[source]
        source: serde_json::Error,
    },
}
