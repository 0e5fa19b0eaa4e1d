use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// The six pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BackgroundRemoval,
    Analysis,
    Enrichment,
    Consolidation,
    Rendering,
    Qa,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::BackgroundRemoval,
        Stage::Analysis,
        Stage::Enrichment,
        Stage::Consolidation,
        Stage::Rendering,
        Stage::Qa,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::BackgroundRemoval => "background_removal",
            Stage::Analysis => "analysis",
            Stage::Enrichment => "enrichment",
            Stage::Consolidation => "consolidation",
            Stage::Rendering => "rendering",
            Stage::Qa => "qa",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed failure classification. Every surfaced pipeline error carries
/// exactly one of these; the orchestrator never substitutes a generic
/// error for a classified one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Configuration,
    Transport,
    Timeout,
    Parse,
    Schema,
    Quota,
    ContentBlocked,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Parse => "PARSE",
            ErrorKind::Schema => "SCHEMA",
            ErrorKind::Quota => "QUOTA",
            ErrorKind::ContentBlocked => "CONTENT_BLOCKED",
        }
    }

    /// Status the (external) HTTP entry layer should map this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Quota => 429,
            ErrorKind::Transport => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Configuration
            | ErrorKind::Parse
            | ErrorKind::Schema
            | ErrorKind::ContentBlocked => 500,
        }
    }

    pub fn retriable(&self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Quota)
    }
}

/// A classified failure from one pipeline stage.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{stage} failed ({}): {message}", kind.code())]
pub struct StageError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    /// Provider-suggested delay for QUOTA failures, when given.
    pub retry_after_ms: Option<u64>,
}

impl StageError {
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, delay_ms: u64) -> Self {
        self.retry_after_ms = Some(delay_ms);
        self
    }

    /// Re-tag an error produced by an adapter with the stage the
    /// orchestrator ran it under.
    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// The `error` object of a failure response.
    pub fn to_response_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("message".to_string(), json!(self.message));
        out.insert("code".to_string(), json!(self.kind.code()));
        out.insert("stage".to_string(), json!(self.stage.name()));
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ErrorKind, Stage, StageError};

    #[test]
    fn stage_names_are_stable() {
        let names: Vec<&str> = Stage::ALL.iter().map(|stage| stage.name()).collect();
        assert_eq!(
            names,
            vec![
                "background_removal",
                "analysis",
                "enrichment",
                "consolidation",
                "rendering",
                "qa"
            ]
        );
    }

    #[test]
    fn kind_codes_serialize_screaming_snake() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_value(ErrorKind::ContentBlocked)?, json!("CONTENT_BLOCKED"));
        assert_eq!(serde_json::to_value(ErrorKind::Timeout)?, json!("TIMEOUT"));
        assert_eq!(ErrorKind::Quota.code(), "QUOTA");
        Ok(())
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Configuration.http_status(), 500);
        assert_eq!(ErrorKind::Quota.http_status(), 429);
        assert_eq!(ErrorKind::Transport.http_status(), 502);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::Schema.http_status(), 500);
    }

    #[test]
    fn response_value_names_stage_and_code() {
        let err = StageError::new(Stage::Enrichment, ErrorKind::Timeout, "deadline exceeded");
        let value = err.to_response_value();
        assert_eq!(value["stage"], json!("enrichment"));
        assert_eq!(value["code"], json!("TIMEOUT"));
        assert_eq!(value["message"], json!("deadline exceeded"));
    }

    #[test]
    fn display_includes_stage_and_code() {
        let err = StageError::new(Stage::Rendering, ErrorKind::Quota, "rate limited")
            .with_retry_after(1500);
        assert_eq!(err.to_string(), "rendering failed (QUOTA): rate limited");
        assert_eq!(err.retry_after_ms, Some(1500));
    }
}
