use serde::{Deserialize, Serialize};

use crate::facts::normalize::resolve_palette_chain;
use crate::facts::{AnalysisFacts, Palette};

pub const MUST_WHITE_BACKGROUND: &str = "pure_white_background";
pub const MUST_INTERIOR_HOLLOWS: &str = "render_interior_hollows";
pub const MUST_PRESERVE_BRAND_LABELS: &str = "preserve_brand_labels";
pub const MUST_PRESERVE_LABEL_TEXT: &str = "preserve_label_text";

pub const BASE_BAN: [&str; 4] = ["mannequins", "humans", "props", "reflections"];

const DEFAULT_VIEW: &str = "front";
const DEFAULT_FRAMING: &str = "centered full garment";
const DEFAULT_SHADOW: &str = "soft_contact";

/// A label the renderer must keep readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelKeep {
    pub text: String,
    pub bbox_norm: Option<[f64; 4]>,
    pub min_legibility: f64,
}

/// Rendering directives computed purely from `AnalysisFacts`; holds no
/// information not traceable to the facts plus fixed defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ControlBlock {
    pub must: Vec<String>,
    pub ban: Vec<String>,
    pub palette: Palette,
    pub label_visibility_required: bool,
    pub label_keep: Vec<LabelKeep>,
    pub view: String,
    pub framing: String,
    pub shadow_style: String,
}

/// Pure, total, deterministic derivation of the control block.
/// `preserve_labels` mirrors the request option; when false, label
/// directives are suppressed even for preserved labels.
pub fn derive_control(facts: &AnalysisFacts, preserve_labels: bool) -> ControlBlock {
    let mut must = vec![MUST_WHITE_BACKGROUND.to_string()];
    if !facts.hollow_regions.is_empty() {
        must.push(MUST_INTERIOR_HOLLOWS.to_string());
    }

    let preserved: Vec<_> = facts
        .labels_found
        .iter()
        .filter(|label| label.preserve && label.visible)
        .collect();
    let label_visibility_required = preserve_labels && !preserved.is_empty();
    if label_visibility_required {
        must.push(MUST_PRESERVE_BRAND_LABELS.to_string());
        must.push(MUST_PRESERVE_LABEL_TEXT.to_string());
    }

    let mut ban: Vec<String> = BASE_BAN.iter().map(|item| (*item).to_string()).collect();
    for item in &facts.must_not {
        if !ban.contains(item) {
            ban.push(item.clone());
        }
    }

    let label_keep = if label_visibility_required {
        preserved
            .iter()
            .map(|label| LabelKeep {
                text: label.text.clone(),
                bbox_norm: label.bbox_norm,
                min_legibility: label.legibility.max(0.8),
            })
            .collect()
    } else {
        Vec::new()
    };

    let guidance = facts.rendering_guidance.as_ref();
    ControlBlock {
        must,
        ban,
        palette: resolve_palette_chain(facts.palette.clone()),
        label_visibility_required,
        label_keep,
        view: guidance
            .and_then(|g| g.view.clone())
            .unwrap_or_else(|| DEFAULT_VIEW.to_string()),
        framing: guidance
            .and_then(|g| g.framing.clone())
            .unwrap_or_else(|| DEFAULT_FRAMING.to_string()),
        shadow_style: guidance
            .and_then(|g| g.shadow_style.clone())
            .unwrap_or_else(|| DEFAULT_SHADOW.to_string()),
    }
}
