//! Ghost-mannequin rendering pipeline: stage adapters, the consolidation
//! engine, and the orchestrator that drives a session from flatlay to
//! reviewed render.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use hollowcast_contracts::cache::{upload_cache_key, UploadCache};
use hollowcast_contracts::control::derive_control;
use hollowcast_contracts::error::{ErrorKind, Stage, StageError};
use hollowcast_contracts::events::{now_utc_iso, EventPayload, EventWriter};
use hollowcast_contracts::facts::fallback::synthesize_fallback;
use hollowcast_contracts::facts::normalize::{
    normalize_loose, normalize_strict, palette_from_enrichment, palette_is_structured,
    NormalizeError,
};
use hollowcast_contracts::facts::{AnalysisFacts, EXPECTED_KEYS};
use hollowcast_contracts::session::{
    ConsolidationOutput, ImageRef, PipelineOptions, PipelineRequest, PipelineResponse,
    PipelineSession,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-stage deadlines in milliseconds. Each external call gets the
/// deadline of the stage it runs under; the orchestrator reclassifies a
/// transport failure that lands past the deadline as TIMEOUT.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub background_removal_ms: u64,
    pub analysis_ms: u64,
    pub enrichment_ms: u64,
    pub consolidation_ms: u64,
    pub rendering_ms: u64,
    pub qa_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            background_removal_ms: 30_000,
            analysis_ms: 60_000,
            enrichment_ms: 60_000,
            consolidation_ms: 45_000,
            rendering_ms: 120_000,
            qa_ms: 60_000,
        }
    }
}

/// Retry budget for transient adapter failures. Only TRANSPORT and
/// QUOTA kinds are retried; a QUOTA error with a provider-suggested
/// delay waits that long instead of the backoff step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: vec![250, 1_000],
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(
        &self,
        mut operation: impl FnMut() -> Result<T, StageError>,
    ) -> Result<T, StageError> {
        let mut attempt: u32 = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.kind.retriable() || attempt >= self.max_attempts.max(1) {
                        return Err(err);
                    }
                    let backoff = self
                        .backoff_ms
                        .get((attempt - 1) as usize)
                        .or_else(|| self.backoff_ms.last())
                        .copied()
                        .unwrap_or(1_000);
                    let delay = err.retry_after_ms.unwrap_or(backoff);
                    std::thread::sleep(Duration::from_millis(delay));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub analysis_model: String,
    pub enrichment_model: String,
    pub reconcile_model: String,
    pub render_model: String,
    pub review_model: String,
    pub timeouts: StageTimeouts,
    pub retry: RetryPolicy,
    pub qa_enabled: bool,
    pub qa_max_iterations: u32,
    pub reconcile_enabled: bool,
    /// When reconciliation is disabled, still attempt one model call
    /// under the strict timeout before taking the deterministic merge.
    pub reconcile_when_disabled_attempt: bool,
    pub reconcile_strict_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.hollowcast.dev".to_string(),
            api_key: None,
            analysis_model: "vision-structural-1".to_string(),
            enrichment_model: "vision-enrichment-1".to_string(),
            reconcile_model: "merge-writer-1".to_string(),
            render_model: "ghost-render-1".to_string(),
            review_model: "vision-review-1".to_string(),
            timeouts: StageTimeouts::default(),
            retry: RetryPolicy::default(),
            qa_enabled: true,
            qa_max_iterations: 2,
            reconcile_enabled: true,
            reconcile_when_disabled_attempt: false,
            reconcile_strict_timeout_ms: 15_000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base) = non_empty_env("HOLLOWCAST_API_BASE") {
            config.api_base = base;
        }
        config.api_key = non_empty_env("HOLLOWCAST_API_KEY");
        if let Some(model) = non_empty_env("HOLLOWCAST_ANALYSIS_MODEL") {
            config.analysis_model = model;
        }
        if let Some(model) = non_empty_env("HOLLOWCAST_ENRICHMENT_MODEL") {
            config.enrichment_model = model;
        }
        if let Some(model) = non_empty_env("HOLLOWCAST_RECONCILE_MODEL") {
            config.reconcile_model = model;
        }
        if let Some(model) = non_empty_env("HOLLOWCAST_RENDER_MODEL") {
            config.render_model = model;
        }
        if let Some(model) = non_empty_env("HOLLOWCAST_REVIEW_MODEL") {
            config.review_model = model;
        }
        if let Some(flag) = non_empty_env("HOLLOWCAST_QA_ENABLED") {
            config.qa_enabled = env_flag(&flag);
        }
        if let Some(raw) = non_empty_env("HOLLOWCAST_QA_MAX_ITERATIONS") {
            if let Ok(count) = raw.parse() {
                config.qa_max_iterations = count;
            }
        }
        if let Some(flag) = non_empty_env("HOLLOWCAST_RECONCILE_ENABLED") {
            config.reconcile_enabled = env_flag(&flag);
        }
        if let Some(flag) = non_empty_env("HOLLOWCAST_RECONCILE_WHEN_DISABLED") {
            config.reconcile_when_disabled_attempt = env_flag(&flag);
        }
        config
    }
}

// ---------------------------------------------------------------------------
// Stage adapter contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedImage {
    pub url: String,
    pub processing_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Render {
    pub url: String,
    pub processing_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QaVerdict {
    pub overall_score: f64,
    pub passed: bool,
    /// Human-readable discrepancies; fed back into the re-render as
    /// correction directives.
    pub deltas: Vec<String>,
}

pub trait BackgroundRemover {
    fn remove(&self, image: &ImageRef, deadline: Duration) -> Result<CleanedImage, StageError>;
}

pub trait StructureAnalyzer {
    fn analyze(
        &self,
        image_url: &str,
        session_id: &str,
        deadline: Duration,
    ) -> Result<Value, StageError>;
}

pub trait EnrichmentAnalyzer {
    fn analyze(
        &self,
        image_url: &str,
        session_id: &str,
        deadline: Duration,
    ) -> Result<Value, StageError>;
}

pub trait Reconciler {
    fn reconcile(&self, prompt: &str, deadline: Duration) -> Result<String, StageError>;
}

pub trait ImageSynthesizer {
    fn synthesize(
        &self,
        cleaned_url: &str,
        consolidation: &ConsolidationOutput,
        reference_url: Option<&str>,
        options: &PipelineOptions,
        deadline: Duration,
    ) -> Result<Render, StageError>;
}

pub trait QualityReviewer {
    fn review(
        &self,
        render_url: &str,
        consolidation: &ConsolidationOutput,
        deadline: Duration,
    ) -> Result<QaVerdict, StageError>;
}

pub trait AssetUploader {
    fn upload(&self, bytes: &[u8], role: &str) -> Result<String, StageError>;
}

/// The full adapter set the orchestrator drives. Adapters are narrow on
/// purpose: each one owns exactly one external call shape.
pub struct StageAdapters {
    pub remover: Box<dyn BackgroundRemover>,
    pub structure: Box<dyn StructureAnalyzer>,
    pub enrichment: Box<dyn EnrichmentAnalyzer>,
    pub reconciler: Box<dyn Reconciler>,
    pub synthesizer: Box<dyn ImageSynthesizer>,
    pub reviewer: Box<dyn QualityReviewer>,
    pub uploader: Box<dyn AssetUploader>,
}

impl StageAdapters {
    pub fn http(config: &EngineConfig) -> Self {
        Self {
            remover: Box::new(HttpBackgroundRemover::new(config)),
            structure: Box::new(HttpStructureAnalyzer::new(config)),
            enrichment: Box::new(HttpEnrichmentAnalyzer::new(config)),
            reconciler: Box::new(HttpReconciler::new(config)),
            synthesizer: Box::new(HttpImageSynthesizer::new(config)),
            reviewer: Box::new(HttpQualityReviewer::new(config)),
            uploader: Box::new(HttpAssetUploader::new(config)),
        }
    }

    /// Offline adapters that synthesize plausible artifacts on disk;
    /// no network, no credentials.
    pub fn dryrun(run_dir: &Path) -> Self {
        Self {
            remover: Box::new(DryrunBackgroundRemover {
                run_dir: run_dir.to_path_buf(),
            }),
            structure: Box::new(DryrunStructureAnalyzer),
            enrichment: Box::new(DryrunEnrichmentAnalyzer),
            reconciler: Box::new(DryrunReconciler),
            synthesizer: Box::new(DryrunImageSynthesizer {
                run_dir: run_dir.to_path_buf(),
                counter: AtomicU32::new(0),
            }),
            reviewer: Box::new(DryrunQualityReviewer),
            uploader: Box::new(DryrunAssetUploader {
                run_dir: run_dir.to_path_buf(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP adapters
// ---------------------------------------------------------------------------

const STRUCTURE_PROMPT: &str = "Analyze this garment photograph for rendering. Report category, \
silhouette, every visible label with its location and a normalized bounding box, details that \
must be preserved exactly, hollow regions a ghost-mannequin render must keep open, construction \
details, and what is visible of the garment interior. Reply with a single JSON object.";

const ENRICHMENT_PROMPT: &str = "Analyze this garment photograph for color and fabric fidelity. \
Report the palette as hex values (dominant, accent, trim, pattern colors, per-region hints), \
color precision with saturation and brightness, the fabric weave, drape stiffness, transparency \
and sheen, fabric behavior at edges and folds, and rendering guidance (view, framing, shadow \
style). Reply with a single JSON object.";

const REVIEW_PROMPT: &str = "Compare this rendered image against the expected garment facts. \
Score overall fidelity from 0 to 1, decide pass or fail, and list each discrepancy as a short \
imperative correction. Reply with a single JSON object carrying overall_score, passed, and \
deltas.";

pub struct HttpBackgroundRemover {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpBackgroundRemover {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl BackgroundRemover for HttpBackgroundRemover {
    fn remove(&self, image: &ImageRef, deadline: Duration) -> Result<CleanedImage, StageError> {
        let stage = Stage::BackgroundRemoval;
        let key = bearer_key(&self.api_key, stage)?;
        let image_value = image_payload(stage, image)?;
        self.retry.run(|| {
            let response = self
                .http
                .post(format!("{}/v1/images/remove-background", self.api_base))
                .bearer_auth(key)
                .timeout(deadline)
                .json(&json!({ "image": image_value }))
                .send()
                .map_err(|err| transport_error(stage, "background removal request", &err))?;
            let payload = json_or_stage_error(stage, "background removal", response)?;
            let url = payload
                .get("cleaned_image_url")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StageError::new(
                        stage,
                        ErrorKind::Parse,
                        "background removal response is missing cleaned_image_url",
                    )
                })?;
            Ok(CleanedImage {
                url: url.to_string(),
                processing_ms: payload
                    .get("processing_ms")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
            })
        })
    }
}

pub struct HttpStructureAnalyzer {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl HttpStructureAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.analysis_model.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl StructureAnalyzer for HttpStructureAnalyzer {
    fn analyze(
        &self,
        image_url: &str,
        session_id: &str,
        deadline: Duration,
    ) -> Result<Value, StageError> {
        let stage = Stage::Analysis;
        let key = bearer_key(&self.api_key, stage)?;
        vision_document(
            &self.http,
            &self.api_base,
            key,
            &self.model,
            stage,
            "structural analysis",
            image_url,
            STRUCTURE_PROMPT,
            session_id,
            deadline,
            &self.retry,
        )
    }
}

pub struct HttpEnrichmentAnalyzer {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl HttpEnrichmentAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.enrichment_model.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl EnrichmentAnalyzer for HttpEnrichmentAnalyzer {
    fn analyze(
        &self,
        image_url: &str,
        session_id: &str,
        deadline: Duration,
    ) -> Result<Value, StageError> {
        let stage = Stage::Enrichment;
        let key = bearer_key(&self.api_key, stage)?;
        vision_document(
            &self.http,
            &self.api_base,
            key,
            &self.model,
            stage,
            "enrichment analysis",
            image_url,
            ENRICHMENT_PROMPT,
            session_id,
            deadline,
            &self.retry,
        )
    }
}

pub struct HttpReconciler {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl HttpReconciler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.reconcile_model.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl Reconciler for HttpReconciler {
    fn reconcile(&self, prompt: &str, deadline: Duration) -> Result<String, StageError> {
        let stage = Stage::Consolidation;
        let key = bearer_key(&self.api_key, stage)?;
        self.retry.run(|| {
            let response = self
                .http
                .post(format!("{}/v1/text/generate", self.api_base))
                .bearer_auth(key)
                .timeout(deadline)
                .json(&json!({
                    "model": self.model,
                    "prompt": prompt,
                    "response_format": "json",
                }))
                .send()
                .map_err(|err| transport_error(stage, "reconciliation request", &err))?;
            let payload = json_or_stage_error(stage, "reconciliation", response)?;
            Ok(payload
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string())
        })
    }
}

pub struct HttpImageSynthesizer {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

impl HttpImageSynthesizer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.render_model.clone(),
        }
    }
}

impl ImageSynthesizer for HttpImageSynthesizer {
    // No adapter-level retry: the orchestrator owns the single QUOTA
    // retry for rendering.
    fn synthesize(
        &self,
        cleaned_url: &str,
        consolidation: &ConsolidationOutput,
        reference_url: Option<&str>,
        options: &PipelineOptions,
        deadline: Duration,
    ) -> Result<Render, StageError> {
        let stage = Stage::Rendering;
        let key = bearer_key(&self.api_key, stage)?;
        let mut body = json!({
            "model": self.model,
            "image_url": cleaned_url,
            "directives": consolidation,
            "size": options.output_size.as_str(),
            "background": options.background.as_str(),
        });
        if let Some(reference) = reference_url {
            body["reference_url"] = json!(reference);
        }
        let response = self
            .http
            .post(format!("{}/v1/images/render", self.api_base))
            .bearer_auth(key)
            .timeout(deadline)
            .json(&body)
            .send()
            .map_err(|err| transport_error(stage, "render request", &err))?;
        let payload = json_or_stage_error(stage, "render", response)?;
        if let Some(code) = payload.pointer("/error/code").and_then(Value::as_str) {
            if code.contains("blocked") || code.contains("safety") {
                return Err(StageError::new(
                    stage,
                    ErrorKind::ContentBlocked,
                    format!("render rejected by content policy ({code})"),
                ));
            }
        }
        let url = payload
            .get("render_url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StageError::new(stage, ErrorKind::Parse, "render response is missing render_url")
            })?;
        Ok(Render {
            url: url.to_string(),
            processing_ms: payload
                .get("processing_ms")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        })
    }
}

pub struct HttpQualityReviewer {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl HttpQualityReviewer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.review_model.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl QualityReviewer for HttpQualityReviewer {
    fn review(
        &self,
        render_url: &str,
        consolidation: &ConsolidationOutput,
        deadline: Duration,
    ) -> Result<QaVerdict, StageError> {
        let stage = Stage::Qa;
        let key = bearer_key(&self.api_key, stage)?;
        let facts = serde_json::to_string_pretty(&consolidation.facts).unwrap_or_default();
        let prompt = format!("{REVIEW_PROMPT}\n\nExpected facts:\n{facts}");
        let doc = vision_document(
            &self.http,
            &self.api_base,
            key,
            &self.model,
            stage,
            "quality review",
            render_url,
            &prompt,
            &consolidation.session_id,
            deadline,
            &self.retry,
        )?;
        let overall_score = doc
            .get("overall_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        Ok(QaVerdict {
            overall_score,
            passed: doc
                .get("passed")
                .and_then(Value::as_bool)
                .unwrap_or(overall_score >= 0.85),
            deltas: doc
                .get("deltas")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|row| !row.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

pub struct HttpAssetUploader {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpAssetUploader {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl AssetUploader for HttpAssetUploader {
    fn upload(&self, bytes: &[u8], role: &str) -> Result<String, StageError> {
        let stage = Stage::Rendering;
        let key = bearer_key(&self.api_key, stage)?;
        self.retry.run(|| {
            let part = reqwest::blocking::multipart::Part::bytes(bytes.to_vec())
                .file_name(format!("{role}.png"))
                .mime_str("image/png")
                .map_err(|err| {
                    StageError::new(stage, ErrorKind::Transport, format!("upload part: {err}"))
                })?;
            let form = reqwest::blocking::multipart::Form::new()
                .text("role", role.to_string())
                .part("file", part);
            let response = self
                .http
                .post(format!("{}/v1/assets", self.api_base))
                .bearer_auth(key)
                .multipart(form)
                .send()
                .map_err(|err| transport_error(stage, "asset upload", &err))?;
            let payload = json_or_stage_error(stage, "asset upload", response)?;
            payload
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    StageError::new(stage, ErrorKind::Parse, "upload response is missing url")
                })
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn vision_document(
    http: &HttpClient,
    api_base: &str,
    key: &str,
    model: &str,
    stage: Stage,
    context: &str,
    image_url: &str,
    prompt: &str,
    session_id: &str,
    deadline: Duration,
    retry: &RetryPolicy,
) -> Result<Value, StageError> {
    retry.run(|| {
        let response = http
            .post(format!("{api_base}/v1/vision/analyze"))
            .bearer_auth(key)
            .timeout(deadline)
            .json(&json!({
                "model": model,
                "image_url": image_url,
                "prompt": prompt,
                "session_id": session_id,
            }))
            .send()
            .map_err(|err| transport_error(stage, context, &err))?;
        let payload = json_or_stage_error(stage, context, response)?;
        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        extract_json_block(content).ok_or_else(|| {
            StageError::new(
                stage,
                ErrorKind::Parse,
                format!(
                    "{context} returned no JSON document: {}",
                    truncate_text(content, 200)
                ),
            )
        })
    })
}

fn bearer_key(api_key: &Option<String>, stage: Stage) -> Result<&str, StageError> {
    api_key.as_deref().ok_or_else(|| {
        StageError::new(
            stage,
            ErrorKind::Configuration,
            "HOLLOWCAST_API_KEY is not set",
        )
    })
}

fn transport_error(stage: Stage, context: &str, err: &reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::new(
            stage,
            ErrorKind::Timeout,
            format!("{context} hit the stage deadline: {err}"),
        )
    } else {
        StageError::new(stage, ErrorKind::Transport, format!("{context} failed: {err}"))
    }
}

fn json_or_stage_error(
    stage: Stage,
    context: &str,
    response: HttpResponse,
) -> Result<Value, StageError> {
    let status = response.status();
    if status.as_u16() == 429 {
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1_000));
        let mut err = StageError::new(
            stage,
            ErrorKind::Quota,
            format!("{context} rate limited (429)"),
        );
        if let Some(delay) = retry_after_ms {
            err = err.with_retry_after(delay);
        }
        return Err(err);
    }
    if !status.is_success() {
        let code = status.as_u16();
        let body = response.text().unwrap_or_default();
        return Err(StageError::new(
            stage,
            ErrorKind::Transport,
            format!("{context} failed ({code}): {}", truncate_text(&body, 512)),
        ));
    }
    response.json::<Value>().map_err(|err| {
        StageError::new(
            stage,
            ErrorKind::Parse,
            format!("{context} returned invalid JSON: {err}"),
        )
    })
}

fn image_payload(stage: Stage, image: &ImageRef) -> Result<Value, StageError> {
    if image.is_remote() {
        return Ok(json!({ "url": image.as_str() }));
    }
    let path = image.local_path().unwrap_or_default();
    let bytes = std::fs::read(path).map_err(|err| {
        StageError::new(
            stage,
            ErrorKind::Transport,
            format!("image read failed ({path}): {err}"),
        )
    })?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(json!({
        "data_url": format!("data:{};base64,{encoded}", mime_for_path(path)),
    }))
}

// ---------------------------------------------------------------------------
// Dryrun adapters
// ---------------------------------------------------------------------------

pub struct DryrunBackgroundRemover {
    run_dir: PathBuf,
}

impl BackgroundRemover for DryrunBackgroundRemover {
    fn remove(&self, _image: &ImageRef, _deadline: Duration) -> Result<CleanedImage, StageError> {
        let path = self.run_dir.join("cleaned.png");
        image::RgbImage::from_pixel(96, 96, image::Rgb([255, 255, 255]))
            .save(&path)
            .map_err(|err| {
                StageError::new(
                    Stage::BackgroundRemoval,
                    ErrorKind::Transport,
                    format!("dryrun cleaned image write failed: {err}"),
                )
            })?;
        Ok(CleanedImage {
            url: file_url(&path),
            processing_ms: 1.0,
        })
    }
}

pub struct DryrunStructureAnalyzer;

impl StructureAnalyzer for DryrunStructureAnalyzer {
    fn analyze(
        &self,
        _image_url: &str,
        _session_id: &str,
        _deadline: Duration,
    ) -> Result<Value, StageError> {
        Ok(json!({
            "category": "hoodie",
            "silhouette": "relaxed",
            "labels_found": [{
                "text": "HOLLOWCAST",
                "label_type": "brand",
                "location": "inner collar",
                "bbox_norm": [0.42, 0.08, 0.58, 0.14],
                "visible": true,
                "legibility": 0.9,
                "preserve": true,
            }],
            "preserve_details": [{"element": "drawstring tips", "priority": "high"}],
            "hollow_regions": [
                {"region": "neckline", "inner_description": "ribbed collar interior"},
                {"region": "sleeves"},
            ],
            "construction_details": ["kangaroo pocket", "flatlock seams"],
            "interior_analysis": ["ribbed collar interior", "contrast lining"],
        }))
    }
}

pub struct DryrunEnrichmentAnalyzer;

impl EnrichmentAnalyzer for DryrunEnrichmentAnalyzer {
    fn analyze(
        &self,
        image_url: &str,
        _session_id: &str,
        _deadline: Duration,
    ) -> Result<Value, StageError> {
        // Colors are derived from the image reference so repeated runs
        // over the same input stay stable.
        let digest = Sha256::digest(image_url.as_bytes());
        let hex_at =
            |i: usize| format!("#{:02X}{:02X}{:02X}", digest[i], digest[i + 1], digest[i + 2]);
        Ok(json!({
            "palette": {
                "dominant_hex": hex_at(0),
                "accent_hex": hex_at(3),
                "trim_hex": hex_at(6),
            },
            "color_precision": {"saturation": "medium", "brightness": "medium"},
            "fabric": {"weave": "fleece", "drape_stiffness": 0.55},
            "fabric_behavior": {"edge_finish": "coverstitched hems"},
            "rendering_guidance": {"view": "front", "shadow_style": "soft_contact"},
            "confidence_scores": {"color": 0.8, "fabric": 0.7},
        }))
    }
}

pub struct DryrunReconciler;

impl Reconciler for DryrunReconciler {
    // Returns no document, so offline consolidation always takes the
    // deterministic merge.
    fn reconcile(&self, _prompt: &str, _deadline: Duration) -> Result<String, StageError> {
        Ok(String::new())
    }
}

pub struct DryrunImageSynthesizer {
    run_dir: PathBuf,
    counter: AtomicU32,
}

impl ImageSynthesizer for DryrunImageSynthesizer {
    fn synthesize(
        &self,
        _cleaned_url: &str,
        consolidation: &ConsolidationOutput,
        _reference_url: Option<&str>,
        options: &PipelineOptions,
        _deadline: Duration,
    ) -> Result<Render, StageError> {
        let (width, height) = options.output_size.dims();
        let color = parse_hex_rgb(&consolidation.control.palette.dominant_hex)
            .unwrap_or(image::Rgb([136, 136, 136]));
        let index = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.run_dir.join(format!("render-{index}.png"));
        image::RgbImage::from_pixel(width, height, color)
            .save(&path)
            .map_err(|err| {
                StageError::new(
                    Stage::Rendering,
                    ErrorKind::Transport,
                    format!("dryrun render write failed: {err}"),
                )
            })?;
        Ok(Render {
            url: file_url(&path),
            processing_ms: 1.0,
        })
    }
}

pub struct DryrunQualityReviewer;

impl QualityReviewer for DryrunQualityReviewer {
    fn review(
        &self,
        _render_url: &str,
        _consolidation: &ConsolidationOutput,
        _deadline: Duration,
    ) -> Result<QaVerdict, StageError> {
        Ok(QaVerdict {
            overall_score: 0.92,
            passed: true,
            deltas: Vec::new(),
        })
    }
}

pub struct DryrunAssetUploader {
    run_dir: PathBuf,
}

impl AssetUploader for DryrunAssetUploader {
    fn upload(&self, bytes: &[u8], role: &str) -> Result<String, StageError> {
        let stamp = chrono::Utc::now().timestamp_millis();
        let path = self.run_dir.join(format!("{role}-{stamp}.png"));
        std::fs::write(&path, bytes).map_err(|err| {
            StageError::new(
                Stage::Rendering,
                ErrorKind::Transport,
                format!("dryrun upload write failed: {err}"),
            )
        })?;
        Ok(file_url(&path))
    }
}

// ---------------------------------------------------------------------------
// Consolidation
// ---------------------------------------------------------------------------

/// Merges the two analysis documents into one render-ready unit. Total:
/// every input pair produces a valid `ConsolidationOutput`, through the
/// model path, field-by-field recovery, or the deterministic merge.
pub fn consolidate(
    reconciler: &dyn Reconciler,
    config: &EngineConfig,
    events: &EventWriter,
    session_id: &str,
    preserve_labels: bool,
    structural: &Value,
    enrichment: &Value,
) -> ConsolidationOutput {
    let (facts, conflicts_found) =
        reconcile_documents(reconciler, config, events, structural, enrichment);
    let control = derive_control(&facts, preserve_labels);
    ConsolidationOutput {
        session_id: session_id.to_string(),
        ts: now_utc_iso(),
        facts,
        control,
        conflicts_found,
    }
}

fn reconcile_documents(
    reconciler: &dyn Reconciler,
    config: &EngineConfig,
    events: &EventWriter,
    structural: &Value,
    enrichment: &Value,
) -> (AnalysisFacts, Vec<String>) {
    let deadline_ms = if config.reconcile_enabled {
        config.timeouts.consolidation_ms
    } else if config.reconcile_when_disabled_attempt {
        config.reconcile_strict_timeout_ms
    } else {
        return fallback_merge(events, structural, enrichment, "reconciliation disabled");
    };

    let prompt = build_reconciliation_prompt(structural, enrichment);
    let reply = match reconciler.reconcile(&prompt, Duration::from_millis(deadline_ms)) {
        Ok(reply) => reply,
        Err(err) => return fallback_merge(events, structural, enrichment, &err.to_string()),
    };
    let Some(raw) = extract_json_block(&reply) else {
        return fallback_merge(
            events,
            structural,
            enrichment,
            "reconciler returned no JSON document",
        );
    };

    let repaired = apply_targeted_repairs(raw, structural, enrichment);
    let conflicts = conflict_list(&repaired);
    match normalize_strict(&repaired) {
        Ok(facts) => (facts, conflicts),
        Err(NormalizeError::InvalidField(detail)) => {
            let mut payload = EventPayload::new();
            payload.insert("detail".to_string(), json!(detail));
            let _ = events.emit("consolidation_recovered", payload);
            (normalize_loose(&repaired), conflicts)
        }
        Err(err) => fallback_merge(events, structural, enrichment, &err.to_string()),
    }
}

fn fallback_merge(
    events: &EventWriter,
    structural: &Value,
    enrichment: &Value,
    reason: &str,
) -> (AnalysisFacts, Vec<String>) {
    let mut payload = EventPayload::new();
    payload.insert("reason".to_string(), json!(reason));
    let _ = events.emit("consolidation_fallback", payload);
    (synthesize_fallback(structural, enrichment), Vec::new())
}

/// Known reconciler failure shapes, repaired from the source documents
/// before normalization: a dropped interior analysis and a flattened or
/// missing palette.
fn apply_targeted_repairs(mut raw: Value, structural: &Value, enrichment: &Value) -> Value {
    let Some(obj) = raw.as_object_mut() else {
        return raw;
    };
    let interior_missing = obj
        .get("interior_analysis")
        .and_then(Value::as_array)
        .map(|rows| rows.is_empty())
        .unwrap_or(true);
    if interior_missing {
        if let Some(rows) = structural.get("interior_analysis").and_then(Value::as_array) {
            if !rows.is_empty() {
                obj.insert("interior_analysis".to_string(), Value::Array(rows.clone()));
            }
        }
    }
    let palette_ok = obj.get("palette").map(palette_is_structured).unwrap_or(false);
    if !palette_ok {
        if let Ok(palette) = serde_json::to_value(palette_from_enrichment(enrichment)) {
            obj.insert("palette".to_string(), palette);
        }
    }
    raw
}

fn conflict_list(doc: &Value) -> Vec<String> {
    doc.get("conflicts_found")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|row| !row.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn build_reconciliation_prompt(structural: &Value, enrichment: &Value) -> String {
    let keys = EXPECTED_KEYS.join(", ");
    let structural = serde_json::to_string_pretty(structural).unwrap_or_default();
    let enrichment = serde_json::to_string_pretty(enrichment).unwrap_or_default();
    format!(
        "Merge the two garment analysis documents below into one. The structural document wins \
for geometry, labels, hollow regions, construction, and interior; the enrichment document wins \
for palette, color precision, fabric, and fabric behavior. List every disagreement you resolved \
in a conflicts_found array of short strings. Reply with a single fenced JSON object using only \
these top-level keys: {keys}, conflicts_found.\n\n\
Structural analysis:\n{structural}\n\nEnrichment analysis:\n{enrichment}\n"
    )
}

/// Pulls the first JSON object out of model prose: a fenced code block
/// first, then a balanced-brace scan over the raw text.
pub fn extract_json_block(text: &str) -> Option<Value> {
    if let Some(candidate) = fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    let candidate = balanced_object(text)?;
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(Value::is_object)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives sessions through the stage sequence. Each run mints a fresh
/// session id unless the request pins one; events from every run append
/// to the run directory's `events.jsonl`. Adapters are injected so tests
/// and the offline mode swap in their own.
pub struct PipelineEngine {
    config: EngineConfig,
    adapters: StageAdapters,
    run_dir: PathBuf,
    events: EventWriter,
    cache: UploadCache,
    cancel: Arc<AtomicBool>,
}

impl PipelineEngine {
    pub fn new(
        config: EngineConfig,
        adapters: StageAdapters,
        run_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let run_dir = run_dir.into();
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating run directory {}", run_dir.display()))?;
        let session_id = Uuid::new_v4().to_string();
        let events = EventWriter::new(run_dir.join("events.jsonl"), session_id);
        let cache = UploadCache::new(run_dir.join("uploads.json"));
        Ok(Self {
            config,
            adapters,
            run_dir,
            events,
            cache,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Session id of the most recent run.
    pub fn session_id(&self) -> &str {
        self.events.session_id()
    }

    /// Shared flag checked before each stage; setting it fails the next
    /// stage instead of interrupting an in-flight call.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&mut self, request: &PipelineRequest) -> PipelineResponse {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.events = EventWriter::new(self.run_dir.join("events.jsonl"), session_id.clone());
        let mut session = PipelineSession::new(session_id);
        let mut payload = EventPayload::new();
        payload.insert("flatlay".to_string(), json!(request.flatlay.as_str()));
        payload.insert("has_on_model".to_string(), json!(request.on_model.is_some()));
        payload.insert(
            "output_size".to_string(),
            json!(request.options.output_size.as_str()),
        );
        let _ = self.events.emit("pipeline_started", payload);

        if let Err(err) = request.validate() {
            session.mark_failed(err.clone(), 0.0);
            let _ = self.events.stage_failed(&err, 0.0);
            return PipelineResponse::failed(&session, &err, None);
        }

        match self.execute(&mut session, request) {
            Ok((cleaned_url, render_url)) => {
                let mut payload = EventPayload::new();
                payload.insert("render_url".to_string(), json!(render_url));
                payload.insert("elapsed_ms".to_string(), json!(session.total_elapsed_ms()));
                payload.insert("qa_iterations".to_string(), json!(session.qa_iterations));
                let _ = self.events.emit("pipeline_completed", payload);
                PipelineResponse::completed(&session, cleaned_url, render_url)
            }
            Err((err, cleaned_url)) => {
                let mut payload = EventPayload::new();
                payload.insert("stage".to_string(), json!(err.stage.name()));
                payload.insert("code".to_string(), json!(err.kind.code()));
                payload.insert("message".to_string(), json!(err.message));
                let _ = self.events.emit("pipeline_failed", payload);
                PipelineResponse::failed(&session, &err, cleaned_url)
            }
        }
    }

    fn execute(
        &mut self,
        session: &mut PipelineSession,
        request: &PipelineRequest,
    ) -> Result<(String, String), (StageError, Option<String>)> {
        let timeouts = self.config.timeouts;
        let session_id = session.session_id.clone();

        let cleaned = Self::run_stage(
            &self.events,
            &self.cancel,
            session,
            Stage::BackgroundRemoval,
            timeouts.background_removal_ms,
            |deadline| self.adapters.remover.remove(&request.flatlay, deadline),
        )
        .map_err(|err| (err, None))?;

        let structural = Self::run_stage(
            &self.events,
            &self.cancel,
            session,
            Stage::Analysis,
            timeouts.analysis_ms,
            |deadline| {
                self.adapters
                    .structure
                    .analyze(&cleaned.url, &session_id, deadline)
            },
        )
        .map_err(|err| (err, Some(cleaned.url.clone())))?;

        let enrichment = Self::run_stage(
            &self.events,
            &self.cancel,
            session,
            Stage::Enrichment,
            timeouts.enrichment_ms,
            |deadline| {
                self.adapters
                    .enrichment
                    .analyze(&cleaned.url, &session_id, deadline)
            },
        )
        .map_err(|err| (err, Some(cleaned.url.clone())))?;

        let consolidation = Self::run_stage(
            &self.events,
            &self.cancel,
            session,
            Stage::Consolidation,
            timeouts.consolidation_ms,
            |_deadline| {
                Ok(consolidate(
                    self.adapters.reconciler.as_ref(),
                    &self.config,
                    &self.events,
                    &session_id,
                    request.options.preserve_labels,
                    &structural,
                    &enrichment,
                ))
            },
        )
        .map_err(|err| (err, Some(cleaned.url.clone())))?;

        let reference = match &request.on_model {
            Some(on_model) => match self.upload_reference(on_model) {
                Ok(url) => Some(url),
                Err(err) => {
                    let err = err.at_stage(Stage::Rendering);
                    session.mark_failed(err.clone(), 0.0);
                    let _ = self.events.stage_failed(&err, 0.0);
                    return Err((err, Some(cleaned.url.clone())));
                }
            },
            None => None,
        };

        // A QUOTA failure on the first render is honored exactly once.
        let render = match self.render_stage(
            session,
            &cleaned.url,
            &consolidation,
            reference.as_deref(),
            &request.options,
        ) {
            Ok(render) => render,
            Err(err) if err.kind == ErrorKind::Quota => {
                let delay = err
                    .retry_after_ms
                    .unwrap_or_else(|| self.config.retry.backoff_ms.first().copied().unwrap_or(1_000));
                std::thread::sleep(Duration::from_millis(delay));
                self.render_stage(
                    session,
                    &cleaned.url,
                    &consolidation,
                    reference.as_deref(),
                    &request.options,
                )
                .map_err(|err| (err, Some(cleaned.url.clone())))?
            }
            Err(err) => return Err((err, Some(cleaned.url.clone()))),
        };

        let mut render_url = render.url;
        if self.config.qa_enabled {
            let max_iterations = self.config.qa_max_iterations.max(1);
            let mut best_score = f64::MIN;
            let mut best_url = render_url.clone();
            for iteration in 1..=max_iterations {
                session.qa_iterations = iteration;
                let verdict = Self::run_stage(
                    &self.events,
                    &self.cancel,
                    session,
                    Stage::Qa,
                    timeouts.qa_ms,
                    |deadline| {
                        self.adapters
                            .reviewer
                            .review(&render_url, &consolidation, deadline)
                    },
                )
                .map_err(|err| (err, Some(cleaned.url.clone())))?;

                let mut payload = EventPayload::new();
                payload.insert("iteration".to_string(), json!(iteration));
                payload.insert("overall_score".to_string(), json!(verdict.overall_score));
                payload.insert("passed".to_string(), json!(verdict.passed));
                let _ = self.events.emit("qa_iteration", payload);

                if verdict.overall_score > best_score {
                    best_score = verdict.overall_score;
                    best_url = render_url.clone();
                }
                if verdict.passed {
                    break;
                }
                if iteration == max_iterations {
                    // Out of budget: ship the best render seen.
                    render_url = best_url.clone();
                    break;
                }
                let corrected = with_corrections(&consolidation, &verdict.deltas);
                let render = self
                    .render_stage(
                        session,
                        &cleaned.url,
                        &corrected,
                        reference.as_deref(),
                        &request.options,
                    )
                    .map_err(|err| (err, Some(cleaned.url.clone())))?;
                render_url = render.url;
            }
        }

        Ok((cleaned.url, render_url))
    }

    fn render_stage(
        &self,
        session: &mut PipelineSession,
        cleaned_url: &str,
        consolidation: &ConsolidationOutput,
        reference: Option<&str>,
        options: &PipelineOptions,
    ) -> Result<Render, StageError> {
        Self::run_stage(
            &self.events,
            &self.cancel,
            session,
            Stage::Rendering,
            self.config.timeouts.rendering_ms,
            |deadline| {
                self.adapters
                    .synthesizer
                    .synthesize(cleaned_url, consolidation, reference, options, deadline)
            },
        )
    }

    fn run_stage<T>(
        events: &EventWriter,
        cancel: &AtomicBool,
        session: &mut PipelineSession,
        stage: Stage,
        timeout_ms: u64,
        operation: impl FnOnce(Duration) -> Result<T, StageError>,
    ) -> Result<T, StageError> {
        if cancel.load(Ordering::SeqCst) {
            let err = StageError::new(
                stage,
                ErrorKind::Transport,
                format!("session cancelled before {} was issued", stage.name()),
            );
            session.mark_failed(err.clone(), 0.0);
            let _ = events.stage_failed(&err, 0.0);
            return Err(err);
        }

        session.mark_running(stage);
        let _ = events.stage_started(stage);
        let started = Instant::now();
        let deadline = Duration::from_millis(timeout_ms);
        let result = operation(deadline);
        // Nanosecond floor keeps sub-millisecond stages visible in the
        // timing map.
        let elapsed_ms = started.elapsed().as_nanos().max(1) as f64 / 1e6;

        match result {
            Ok(value) => {
                session.mark_succeeded(stage, elapsed_ms);
                let _ = events.stage_completed(stage, elapsed_ms);
                Ok(value)
            }
            Err(err) => {
                let mut err = err.at_stage(stage);
                if err.kind == ErrorKind::Transport && started.elapsed() >= deadline {
                    err.kind = ErrorKind::Timeout;
                }
                session.mark_failed(err.clone(), elapsed_ms);
                let _ = events.stage_failed(&err, elapsed_ms);
                Err(err)
            }
        }
    }

    fn upload_reference(&mut self, image: &ImageRef) -> Result<String, StageError> {
        if image.is_remote() {
            return Ok(image.as_str().to_string());
        }
        let stage = Stage::Rendering;
        let path = image.local_path().unwrap_or_default();
        let bytes = std::fs::read(path).map_err(|err| {
            StageError::new(
                stage,
                ErrorKind::Transport,
                format!("on_model image read failed ({path}): {err}"),
            )
        })?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let key = upload_cache_key(&digest, "reference", self.events.session_id());
        if let Some(url) = self.cache.get_url(&key) {
            return Ok(url);
        }
        let url = self.adapters.uploader.upload(&bytes, "reference")?;
        if let Err(err) = self.cache.record_upload(&key, &url, "reference") {
            let mut payload = EventPayload::new();
            payload.insert("error".to_string(), json!(err.to_string()));
            let _ = self.events.emit("upload_cache_write_failed", payload);
        }
        Ok(url)
    }
}

fn with_corrections(consolidation: &ConsolidationOutput, deltas: &[String]) -> ConsolidationOutput {
    let mut corrected = consolidation.clone();
    for delta in deltas {
        let directive = format!("correction: {delta}");
        if !corrected.control.must.contains(&directive) {
            corrected.control.must.push(directive);
        }
    }
    corrected
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let head: String = text.chars().take(limit).collect();
        format!("{head}…")
    }
}

fn mime_for_path(path: &str) -> &'static str {
    match Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn parse_hex_rgb(raw: &str) -> Option<image::Rgb<u8>> {
    let digits = raw.strip_prefix('#')?;
    if digits.len() != 6 {
        return None;
    }
    let value = u32::from_str_radix(digits, 16).ok()?;
    Some(image::Rgb([
        (value >> 16) as u8,
        (value >> 8) as u8,
        value as u8,
    ]))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use hollowcast_contracts::control::MUST_PRESERVE_LABEL_TEXT;
    use hollowcast_contracts::facts::normalize::normalize_loose;

    use super::*;

    struct StubRemover;

    impl BackgroundRemover for StubRemover {
        fn remove(&self, _image: &ImageRef, _deadline: Duration) -> Result<CleanedImage, StageError> {
            Ok(CleanedImage {
                url: "file:///run/cleaned.png".to_string(),
                processing_ms: 4.0,
            })
        }
    }

    struct StubStructure(Value);

    impl StructureAnalyzer for StubStructure {
        fn analyze(&self, _: &str, _: &str, _: Duration) -> Result<Value, StageError> {
            Ok(self.0.clone())
        }
    }

    struct StubEnrichment(Value);

    impl EnrichmentAnalyzer for StubEnrichment {
        fn analyze(&self, _: &str, _: &str, _: Duration) -> Result<Value, StageError> {
            Ok(self.0.clone())
        }
    }

    struct TimeoutEnrichment;

    impl EnrichmentAnalyzer for TimeoutEnrichment {
        fn analyze(&self, _: &str, _: &str, _: Duration) -> Result<Value, StageError> {
            Err(StageError::new(
                Stage::Enrichment,
                ErrorKind::Timeout,
                "enrichment deadline exceeded",
            ))
        }
    }

    struct StubReconciler(String);

    impl Reconciler for StubReconciler {
        fn reconcile(&self, _: &str, _: Duration) -> Result<String, StageError> {
            Ok(self.0.clone())
        }
    }

    struct FailingReconciler;

    impl Reconciler for FailingReconciler {
        fn reconcile(&self, _: &str, _: Duration) -> Result<String, StageError> {
            Err(StageError::new(
                Stage::Consolidation,
                ErrorKind::Transport,
                "reconciler unreachable",
            ))
        }
    }

    struct ScriptedSynthesizer {
        calls: Arc<AtomicUsize>,
        quota_first: bool,
    }

    impl ImageSynthesizer for ScriptedSynthesizer {
        fn synthesize(
            &self,
            _: &str,
            _: &ConsolidationOutput,
            _: Option<&str>,
            _: &PipelineOptions,
            _: Duration,
        ) -> Result<Render, StageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.quota_first && call == 1 {
                return Err(StageError::new(
                    Stage::Rendering,
                    ErrorKind::Quota,
                    "render rate limited",
                )
                .with_retry_after(5));
            }
            Ok(Render {
                url: format!("file:///run/render-{call}.png"),
                processing_ms: 2.0,
            })
        }
    }

    struct ScriptedReviewer {
        verdicts: Mutex<VecDeque<QaVerdict>>,
    }

    impl ScriptedReviewer {
        fn passing() -> Self {
            Self {
                verdicts: Mutex::new(VecDeque::new()),
            }
        }

        fn scripted(verdicts: Vec<QaVerdict>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts.into()),
            }
        }
    }

    impl QualityReviewer for ScriptedReviewer {
        fn review(
            &self,
            _: &str,
            _: &ConsolidationOutput,
            _: Duration,
        ) -> Result<QaVerdict, StageError> {
            Ok(self
                .verdicts
                .lock()
                .expect("verdicts lock")
                .pop_front()
                .unwrap_or(QaVerdict {
                    overall_score: 0.9,
                    passed: true,
                    deltas: Vec::new(),
                }))
        }
    }

    struct CountingUploader {
        calls: Arc<AtomicUsize>,
    }

    impl AssetUploader for CountingUploader {
        fn upload(&self, _: &[u8], _: &str) -> Result<String, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("https://cdn.test/reference.png".to_string())
        }
    }

    fn structural_doc() -> Value {
        json!({
            "category": "hoodie",
            "silhouette": "relaxed",
            "labels_found": [{
                "text": "NORTHLOOM",
                "label_type": "brand",
                "location": "inner collar",
                "visible": true,
                "legibility": 0.9,
                "preserve": true,
            }],
            "hollow_regions": [{"region": "neckline"}],
            "construction_details": ["kangaroo pocket"],
            "interior_analysis": ["ribbed collar interior", "contrast lining"],
        })
    }

    fn enrichment_doc() -> Value {
        json!({
            "palette": {
                "dominant_hex": "#1A2B3C",
                "accent_hex": "#FFEE00",
                "trim_hex": "#101010",
            },
            "fabric": {"weave": "fleece", "drape_stiffness": 0.6},
        })
    }

    fn merged_reply() -> String {
        let doc = json!({
            "category": "hoodie",
            "silhouette": "relaxed",
            "labels_found": [{
                "text": "NORTHLOOM",
                "label_type": "brand",
                "location": "inner collar",
                "visible": true,
                "legibility": 0.9,
                "preserve": true,
            }],
            "hollow_regions": [{"region": "neckline"}],
            "interior_analysis": ["ribbed collar interior", "contrast lining"],
            "palette": {
                "dominant_hex": "#1A2B3C",
                "accent_hex": "#FFEE00",
                "trim_hex": "#101010",
            },
            "conflicts_found": ["fabric weave disagreed; kept enrichment"],
        });
        format!("Merged per instructions.\n```json\n{doc}\n```\n")
    }

    struct EngineParts {
        synth_calls: Arc<AtomicUsize>,
        upload_calls: Arc<AtomicUsize>,
    }

    fn stub_adapters(
        enrichment: Box<dyn EnrichmentAnalyzer>,
        reconciler: Box<dyn Reconciler>,
        reviewer: ScriptedReviewer,
        quota_first: bool,
    ) -> (StageAdapters, EngineParts) {
        let synth_calls = Arc::new(AtomicUsize::new(0));
        let upload_calls = Arc::new(AtomicUsize::new(0));
        let adapters = StageAdapters {
            remover: Box::new(StubRemover),
            structure: Box::new(StubStructure(structural_doc())),
            enrichment,
            reconciler,
            synthesizer: Box::new(ScriptedSynthesizer {
                calls: Arc::clone(&synth_calls),
                quota_first,
            }),
            reviewer: Box::new(reviewer),
            uploader: Box::new(CountingUploader {
                calls: Arc::clone(&upload_calls),
            }),
        };
        (
            adapters,
            EngineParts {
                synth_calls,
                upload_calls,
            },
        )
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_ms: vec![1, 1],
            },
            ..EngineConfig::default()
        }
    }

    fn test_events(temp: &tempfile::TempDir) -> EventWriter {
        EventWriter::new(temp.path().join("events.jsonl"), "session-test")
    }

    #[test]
    fn pipeline_completes_in_one_pass() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (adapters, parts) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::passing(),
            false,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;

        let response = engine.run(&PipelineRequest::new("file:///tmp/flat.png"));
        assert_eq!(response.status, "completed");
        assert_eq!(response.render_url.as_deref(), Some("file:///run/render-1.png"));
        assert_eq!(parts.synth_calls.load(Ordering::SeqCst), 1);

        let metrics = response.metrics.expect("metrics present");
        for stage in Stage::ALL {
            let elapsed = metrics.stage_timings[stage.name()];
            assert!(elapsed > 0.0, "{} timing missing", stage.name());
        }
        Ok(())
    }

    #[test]
    fn enrichment_timeout_is_isolated_to_its_stage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (adapters, parts) = stub_adapters(
            Box::new(TimeoutEnrichment),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::passing(),
            false,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;

        let response = engine.run(&PipelineRequest::new("file:///tmp/flat.png"));
        assert_eq!(response.status, "failed");
        assert_eq!(response.cleaned_image_url.as_deref(), Some("file:///run/cleaned.png"));
        assert!(response.render_url.is_none());
        assert_eq!(parts.synth_calls.load(Ordering::SeqCst), 0);

        let error = response.error.expect("error present");
        assert_eq!(error.stage, "enrichment");
        assert_eq!(error.code, "TIMEOUT");

        let metrics = response.metrics.expect("metrics present");
        assert!(metrics.stage_timings.contains_key("analysis"));
        assert!(!metrics.stage_timings.contains_key("rendering"));
        Ok(())
    }

    #[test]
    fn reconciler_failure_still_completes_via_fallback() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (adapters, _) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(FailingReconciler),
            ScriptedReviewer::passing(),
            false,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;

        let response = engine.run(&PipelineRequest::new("file:///tmp/flat.png"));
        assert_eq!(response.status, "completed");
        Ok(())
    }

    #[test]
    fn rendering_quota_is_retried_exactly_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (adapters, parts) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::passing(),
            true,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;

        let response = engine.run(&PipelineRequest::new("file:///tmp/flat.png"));
        assert_eq!(response.status, "completed");
        assert_eq!(parts.synth_calls.load(Ordering::SeqCst), 2);
        assert_eq!(response.render_url.as_deref(), Some("file:///run/render-2.png"));
        Ok(())
    }

    #[test]
    fn qa_loop_stops_at_cap_and_ships_best_render() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let verdict = |score: f64, deltas: &[&str]| QaVerdict {
            overall_score: score,
            passed: false,
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
        };
        let (adapters, parts) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::scripted(vec![
                verdict(0.5, &["left sleeve asymmetric"]),
                verdict(0.7, &["accent color drifted"]),
                verdict(0.6, &[]),
            ]),
            false,
        );
        let mut config = test_config();
        config.qa_max_iterations = 3;
        let mut engine = PipelineEngine::new(config, adapters, temp.path().join("run"))?;

        let response = engine.run(&PipelineRequest::new("file:///tmp/flat.png"));
        assert_eq!(response.status, "completed");
        assert_eq!(parts.synth_calls.load(Ordering::SeqCst), 3);
        // Best score came from the second render.
        assert_eq!(response.render_url.as_deref(), Some("file:///run/render-2.png"));
        Ok(())
    }

    #[test]
    fn cancellation_fails_the_next_stage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (adapters, parts) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::passing(),
            false,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;
        engine.cancel_handle().store(true, Ordering::SeqCst);

        let response = engine.run(&PipelineRequest::new("file:///tmp/flat.png"));
        assert_eq!(response.status, "failed");
        assert_eq!(parts.synth_calls.load(Ordering::SeqCst), 0);
        let error = response.error.expect("error present");
        assert_eq!(error.stage, "background_removal");
        assert_eq!(error.code, "TRANSPORT");
        assert!(error.message.contains("cancelled"));
        Ok(())
    }

    #[test]
    fn reference_upload_is_cached_within_a_session() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let on_model = temp.path().join("on-model.png");
        std::fs::write(&on_model, b"fake-on-model-bytes")?;

        let (adapters, parts) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::passing(),
            false,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;

        let mut request = PipelineRequest::new("file:///tmp/flat.png");
        request.on_model = Some(ImageRef::new(on_model.display().to_string()));
        request.session_id = Some("session-fixed".to_string());
        assert_eq!(engine.run(&request).status, "completed");
        assert_eq!(engine.run(&request).status, "completed");
        assert_eq!(parts.upload_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn each_run_mints_its_own_session_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (adapters, _) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::passing(),
            false,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;

        let request = PipelineRequest::new("file:///tmp/flat.png");
        let first = engine.run(&request);
        let second = engine.run(&request);
        assert_eq!(first.status, "completed");
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(engine.session_id(), second.session_id);
        Ok(())
    }

    #[test]
    fn pinned_session_id_is_carried_through_the_run() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (adapters, _) = stub_adapters(
            Box::new(StubEnrichment(enrichment_doc())),
            Box::new(StubReconciler(merged_reply())),
            ScriptedReviewer::passing(),
            false,
        );
        let mut engine = PipelineEngine::new(test_config(), adapters, temp.path().join("run"))?;

        let mut request = PipelineRequest::new("file:///tmp/flat.png");
        request.session_id = Some("session-pinned".to_string());
        let response = engine.run(&request);
        assert_eq!(response.session_id, "session-pinned");

        let log = std::fs::read_to_string(engine.run_dir().join("events.jsonl"))?;
        assert!(log.contains("session-pinned"));
        Ok(())
    }

    #[test]
    fn consolidate_takes_the_model_document_when_valid() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(&temp);
        let reconciler = StubReconciler(merged_reply());

        let output = consolidate(
            &reconciler,
            &test_config(),
            &events,
            "session-test",
            true,
            &structural_doc(),
            &enrichment_doc(),
        );
        assert_eq!(output.facts.palette.dominant_hex, "#1A2B3C");
        assert_eq!(output.conflicts_found.len(), 1);
        assert!(output
            .control
            .must
            .contains(&MUST_PRESERVE_LABEL_TEXT.to_string()));
        Ok(())
    }

    #[test]
    fn consolidate_falls_back_deterministically() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(&temp);

        let output = consolidate(
            &FailingReconciler,
            &test_config(),
            &events,
            "session-test",
            true,
            &structural_doc(),
            &enrichment_doc(),
        );
        assert!(output.conflicts_found.is_empty());
        assert_eq!(
            output.facts.labels_found,
            normalize_loose(&structural_doc()).labels_found
        );
        assert_eq!(output.facts.palette.dominant_hex, "#1A2B3C");

        let log = std::fs::read_to_string(events.path())?;
        assert!(log.contains("consolidation_fallback"));
        Ok(())
    }

    #[test]
    fn empty_reconciler_reply_takes_the_deterministic_merge() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(&temp);
        // The call succeeds but carries no JSON document at all.
        let reconciler = StubReconciler(String::new());

        let output = consolidate(
            &reconciler,
            &test_config(),
            &events,
            "session-test",
            true,
            &structural_doc(),
            &enrichment_doc(),
        );
        assert!(output.conflicts_found.is_empty());
        assert_eq!(
            output.facts.labels_found,
            normalize_loose(&structural_doc()).labels_found
        );
        assert_eq!(output.facts.palette.dominant_hex, "#1A2B3C");

        let log = std::fs::read_to_string(events.path())?;
        assert!(log.contains("consolidation_fallback"));
        assert!(log.contains("no JSON document"));
        Ok(())
    }

    #[test]
    fn consolidate_recovers_field_by_field_from_wrong_types() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(&temp);
        let doc = json!({
            "category": 7,
            "labels_found": [{"text": "NORTHLOOM", "preserve": true, "visible": true}],
            "palette": {"dominant_hex": "#1A2B3C", "accent_hex": "#FFEE00", "trim_hex": "#101010"},
            "conflicts_found": ["category disagreed"],
        });
        let reconciler = StubReconciler(format!("```json\n{doc}\n```"));

        let output = consolidate(
            &reconciler,
            &test_config(),
            &events,
            "session-test",
            true,
            &structural_doc(),
            &enrichment_doc(),
        );
        assert_eq!(output.facts.category, "");
        assert_eq!(output.facts.labels_found.len(), 1);
        assert_eq!(output.conflicts_found, vec!["category disagreed".to_string()]);

        let log = std::fs::read_to_string(events.path())?;
        assert!(log.contains("consolidation_recovered"));
        Ok(())
    }

    #[test]
    fn consolidate_repairs_dropped_interior_and_palette() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(&temp);
        // The reconciler dropped interior_analysis and flattened the
        // palette to a single string.
        let doc = json!({
            "category": "hoodie",
            "labels_found": [],
            "palette": "navy",
        });
        let reconciler = StubReconciler(format!("```json\n{doc}\n```"));

        let output = consolidate(
            &reconciler,
            &test_config(),
            &events,
            "session-test",
            true,
            &structural_doc(),
            &enrichment_doc(),
        );
        assert_eq!(
            output.facts.interior_analysis,
            vec!["ribbed collar interior".to_string(), "contrast lining".to_string()]
        );
        assert_eq!(output.facts.palette.dominant_hex, "#1A2B3C");
        Ok(())
    }

    struct CountingReconciler {
        calls: Arc<AtomicUsize>,
        reply: String,
    }

    impl Reconciler for CountingReconciler {
        fn reconcile(&self, _: &str, _: Duration) -> Result<String, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn reconcile_disabled_skips_the_model_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(&temp);
        let calls = Arc::new(AtomicUsize::new(0));
        let reconciler = CountingReconciler {
            calls: Arc::clone(&calls),
            reply: merged_reply(),
        };

        let mut config = test_config();
        config.reconcile_enabled = false;
        let output = consolidate(
            &reconciler,
            &config,
            &events,
            "session-test",
            true,
            &structural_doc(),
            &enrichment_doc(),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(output.conflicts_found.is_empty());

        // Opting back in under the strict timeout makes exactly one call.
        config.reconcile_when_disabled_attempt = true;
        let output = consolidate(
            &reconciler,
            &config,
            &events,
            "session-test",
            true,
            &structural_doc(),
            &enrichment_doc(),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.conflicts_found.len(), 1);
        Ok(())
    }

    #[test]
    fn extract_json_block_handles_model_prose() {
        let fenced = "Here you go.\n```json\n{\"category\": \"dress\"}\n```\nDone.";
        assert_eq!(
            extract_json_block(fenced).and_then(|v| v["category"].as_str().map(String::from)),
            Some("dress".to_string())
        );

        let bare = "The result is {\"category\": \"coat\", \"notes\": \"has } in string\"} as requested";
        let value = extract_json_block(bare).expect("bare object");
        assert_eq!(value["category"], json!("coat"));

        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block("```json\n[1, 2]\n```"), None);
    }

    #[test]
    fn retry_policy_retries_transient_kinds_only() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: vec![1],
        };

        let attempts = AtomicUsize::new(0);
        let result = policy.run(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(StageError::new(
                    Stage::Analysis,
                    ErrorKind::Transport,
                    "connection reset",
                ))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.ok(), Some(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let attempts = AtomicUsize::new(0);
        let result: Result<(), StageError> = policy.run(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StageError::new(
                Stage::Analysis,
                ErrorKind::Parse,
                "bad document",
            ))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parse_hex_rgb_round_trips() {
        assert_eq!(parse_hex_rgb("#1A2B3C"), Some(image::Rgb([0x1A, 0x2B, 0x3C])));
        assert_eq!(parse_hex_rgb("1A2B3C"), None);
        assert_eq!(parse_hex_rgb("#XYZ123"), None);
    }
}
