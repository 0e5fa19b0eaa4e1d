use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::control::ControlBlock;
use crate::error::{ErrorKind, Stage, StageError};
use crate::events::now_utc_iso;
use crate::facts::AnalysisFacts;

/// Reference to an image: an http(s) URL, a `file://` URL, or a local
/// path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    pub fn local_path(&self) -> Option<&str> {
        if self.is_remote() {
            None
        } else {
            Some(self.0.strip_prefix("file://").unwrap_or(&self.0))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSize {
    #[default]
    Square1024,
    Square2048,
}

impl OutputSize {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "2048x2048" => OutputSize::Square2048,
            _ => OutputSize::Square1024,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputSize::Square1024 => "1024x1024",
            OutputSize::Square2048 => "2048x2048",
        }
    }

    pub fn dims(&self) -> (u32, u32) {
        match self {
            OutputSize::Square1024 => (1024, 1024),
            OutputSize::Square2048 => (2048, 2048),
        }
    }
}

impl Serialize for OutputSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OutputSize {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value.as_str().map(Self::parse).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Background {
    #[default]
    White,
    Transparent,
}

impl Background {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "transparent" => Background::Transparent,
            _ => Background::White,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Background::White => "white",
            Background::Transparent => "transparent",
        }
    }
}

impl Serialize for Background {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Background {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value.as_str().map(Self::parse).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    #[serde(default = "default_true")]
    pub preserve_labels: bool,
    #[serde(default)]
    pub output_size: OutputSize,
    #[serde(default)]
    pub background: Background,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            preserve_labels: true,
            output_size: OutputSize::default(),
            background: Background::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub flatlay: ImageRef,
    #[serde(default)]
    pub on_model: Option<ImageRef>,
    #[serde(default)]
    pub options: PipelineOptions,
    /// Pins the session id; a fresh one is minted per run when absent.
    /// Re-submitting with the same id reuses session-scoped uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PipelineRequest {
    pub fn new(flatlay: impl Into<String>) -> Self {
        Self {
            flatlay: ImageRef::new(flatlay),
            on_model: None,
            options: PipelineOptions::default(),
            session_id: None,
        }
    }

    /// Entry validation; the only place a VALIDATION error originates.
    pub fn validate(&self) -> Result<(), StageError> {
        if self.flatlay.as_str().trim().is_empty() {
            return Err(StageError::new(
                Stage::BackgroundRemoval,
                ErrorKind::Validation,
                "request is missing the flatlay image reference",
            ));
        }
        if let Some(on_model) = &self.on_model {
            if on_model.as_str().trim().is_empty() {
                return Err(StageError::new(
                    Stage::BackgroundRemoval,
                    ErrorKind::Validation,
                    "on_model image reference is present but empty",
                ));
            }
        }
        if let Some(session_id) = &self.session_id {
            if session_id.trim().is_empty() {
                return Err(StageError::new(
                    Stage::BackgroundRemoval,
                    ErrorKind::Validation,
                    "session_id is present but empty",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Transient per-request orchestration state. Created at request entry,
/// discarded at response, never persisted.
#[derive(Debug, Clone)]
pub struct PipelineSession {
    pub session_id: String,
    pub started_at: String,
    pub stage_status: IndexMap<Stage, StageStatus>,
    pub stage_timings_ms: IndexMap<String, f64>,
    pub qa_iterations: u32,
    pub error: Option<StageError>,
}

impl PipelineSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let mut stage_status = IndexMap::new();
        for stage in Stage::ALL {
            stage_status.insert(stage, StageStatus::Pending);
        }
        Self {
            session_id: session_id.into(),
            started_at: now_utc_iso(),
            stage_status,
            stage_timings_ms: IndexMap::new(),
            qa_iterations: 0,
            error: None,
        }
    }

    pub fn with_fresh_id() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn mark_running(&mut self, stage: Stage) {
        self.stage_status.insert(stage, StageStatus::Running);
    }

    /// Records a completed stage call; repeated calls of the same stage
    /// (the QA re-render loop) accumulate.
    pub fn mark_succeeded(&mut self, stage: Stage, elapsed_ms: f64) {
        self.stage_status.insert(stage, StageStatus::Succeeded);
        *self
            .stage_timings_ms
            .entry(stage.name().to_string())
            .or_insert(0.0) += elapsed_ms;
    }

    pub fn mark_failed(&mut self, error: StageError, elapsed_ms: f64) {
        self.stage_status.insert(error.stage, StageStatus::Failed);
        *self
            .stage_timings_ms
            .entry(error.stage.name().to_string())
            .or_insert(0.0) += elapsed_ms;
        self.error = Some(error);
    }

    pub fn total_elapsed_ms(&self) -> f64 {
        self.stage_timings_ms.values().sum()
    }
}

/// The unit handed to the synthesis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationOutput {
    pub session_id: String,
    pub ts: String,
    pub facts: AnalysisFacts,
    pub control: ControlBlock,
    #[serde(default)]
    pub conflicts_found: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub processing_time_ms: f64,
    pub stage_timings: IndexMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub message: String,
    pub code: String,
    pub stage: String,
}

impl From<&StageError> for ResponseError {
    fn from(error: &StageError) -> Self {
        Self {
            message: error.message.clone(),
            code: error.kind.code().to_string(),
            stage: error.stage.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub session_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaned_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PipelineMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl PipelineResponse {
    pub fn completed(
        session: &PipelineSession,
        cleaned_image_url: String,
        render_url: String,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: "completed".to_string(),
            cleaned_image_url: Some(cleaned_image_url),
            render_url: Some(render_url),
            metrics: Some(PipelineMetrics {
                processing_time_ms: session.total_elapsed_ms(),
                stage_timings: session.stage_timings_ms.clone(),
            }),
            error: None,
        }
    }

    /// Failure response; partial progress (a cleaned image produced
    /// before the failing stage) is still returned when available.
    pub fn failed(
        session: &PipelineSession,
        error: &StageError,
        cleaned_image_url: Option<String>,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: "failed".to_string(),
            cleaned_image_url,
            render_url: None,
            metrics: Some(PipelineMetrics {
                processing_time_ms: session.total_elapsed_ms(),
                stage_timings: session.stage_timings_ms.clone(),
            }),
            error: Some(ResponseError::from(error)),
        }
    }
}

/// Tolerant request parsing for the CLI/HTTP boundary: unknown option
/// values coerce to defaults, a missing options object is the default.
pub fn request_from_value(value: &Value) -> Result<PipelineRequest, StageError> {
    let empty = Map::new();
    let obj = value.as_object().unwrap_or(&empty);
    let flatlay = obj
        .get("flatlay")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| {
            StageError::new(
                Stage::BackgroundRemoval,
                ErrorKind::Validation,
                "request is missing the flatlay image reference",
            )
        })?;
    let on_model = obj
        .get("onModel")
        .or_else(|| obj.get("on_model"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .map(ImageRef::new);
    let session_id = obj
        .get("sessionId")
        .or_else(|| obj.get("session_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let options_value = obj.get("options").cloned().unwrap_or(Value::Null);
    let options = if options_value.is_object() {
        let opts = options_value.as_object().map(Map::clone).unwrap_or_default();
        PipelineOptions {
            preserve_labels: opts
                .get("preserveLabels")
                .or_else(|| opts.get("preserve_labels"))
                .and_then(Value::as_bool)
                .unwrap_or(true),
            output_size: opts
                .get("outputSize")
                .or_else(|| opts.get("output_size"))
                .and_then(Value::as_str)
                .map(OutputSize::parse)
                .unwrap_or_default(),
            background: opts
                .get("backgroundColor")
                .or_else(|| opts.get("background"))
                .and_then(Value::as_str)
                .map(Background::parse)
                .unwrap_or_default(),
        }
    } else {
        PipelineOptions::default()
    };

    let request = PipelineRequest {
        flatlay: ImageRef::new(flatlay),
        on_model,
        options,
        session_id,
    };
    request.validate()?;
    Ok(request)
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::error::{ErrorKind, Stage, StageError};

    use super::*;

    #[test]
    fn request_parses_camel_case_wire_shape() -> anyhow::Result<()> {
        let request = request_from_value(&json!({
            "flatlay": "https://img.example/flat.png",
            "onModel": "https://img.example/worn.png",
            "sessionId": "resume-1",
            "options": {"outputSize": "2048x2048", "backgroundColor": "transparent"},
        }))
        .map_err(anyhow::Error::from)?;
        assert_eq!(request.flatlay.as_str(), "https://img.example/flat.png");
        assert!(request.on_model.is_some());
        assert_eq!(request.session_id.as_deref(), Some("resume-1"));
        assert_eq!(request.options.output_size, OutputSize::Square2048);
        assert_eq!(request.options.background, Background::Transparent);
        assert!(request.options.preserve_labels);
        Ok(())
    }

    #[test]
    fn request_without_flatlay_is_a_validation_error() {
        let err = request_from_value(&json!({"options": {}})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn unknown_option_values_coerce_to_defaults() -> anyhow::Result<()> {
        let request = request_from_value(&json!({
            "flatlay": "flat.png",
            "options": {"outputSize": "4096x4096", "backgroundColor": "plaid"},
        }))
        .map_err(anyhow::Error::from)?;
        assert_eq!(request.options.output_size, OutputSize::Square1024);
        assert_eq!(request.options.background, Background::White);
        Ok(())
    }

    #[test]
    fn image_ref_distinguishes_remote_and_local() {
        assert!(ImageRef::new("https://a/b.png").is_remote());
        assert_eq!(ImageRef::new("file:///tmp/a.png").local_path(), Some("/tmp/a.png"));
        assert_eq!(ImageRef::new("shots/a.png").local_path(), Some("shots/a.png"));
    }

    #[test]
    fn session_accumulates_repeated_stage_timings() {
        let mut session = PipelineSession::new("session-1");
        session.mark_succeeded(Stage::Rendering, 100.0);
        session.mark_succeeded(Stage::Rendering, 50.0);
        session.mark_succeeded(Stage::Qa, 20.0);
        assert_eq!(session.stage_timings_ms["rendering"], 150.0);
        assert_eq!(session.total_elapsed_ms(), 170.0);
    }

    #[test]
    fn failure_response_keeps_partial_progress() {
        let mut session = PipelineSession::new("session-2");
        session.mark_succeeded(Stage::BackgroundRemoval, 80.0);
        let error = StageError::new(Stage::Enrichment, ErrorKind::Timeout, "deadline exceeded");
        session.mark_failed(error.clone(), 30_000.0);

        let response =
            PipelineResponse::failed(&session, &error, Some("file:///tmp/clean.png".to_string()));
        assert_eq!(response.status, "failed");
        assert_eq!(response.cleaned_image_url.as_deref(), Some("file:///tmp/clean.png"));
        let error = response.error.as_ref().expect("error present");
        assert_eq!(error.code, "TIMEOUT");
        assert_eq!(error.stage, "enrichment");

        let value = serde_json::to_value(&response).expect("serializes");
        assert!(value.get("render_url").is_none());
        assert_eq!(value["metrics"]["stage_timings"]["background_removal"], json!(80.0));
    }
}
