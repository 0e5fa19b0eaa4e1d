use serde_json::{Map, Value};

use super::{
    AnalysisFacts, ColorPrecision, ConfidenceScores, ConstructionPrecision, FabricBehavior,
    FabricProfile, GarmentLabel, HollowKind, HollowRegion, LabelType, Palette, PreserveDetail,
    Priority, QaTargets, RenderingGuidance, Sheen, Transparency, DEFAULT_HEX, EXPECTED_KEYS,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("facts document is not a JSON object")]
    NotAnObject,
    #[error("facts document carries no recognized keys")]
    NoRecognizedKeys,
    #[error("facts document failed typed validation: {0}")]
    InvalidField(String),
}

/// Strict mode: used for the model-produced consolidation output.
/// Requires a JSON object with at least one recognized key and
/// correctly-typed fields; enum values outside the allowed set still
/// coerce to their defaults. Callers fall back to [`normalize_loose`]
/// for field-by-field recovery when this fails.
pub fn normalize_strict(value: &Value) -> Result<AnalysisFacts, NormalizeError> {
    let obj = value.as_object().ok_or(NormalizeError::NotAnObject)?;
    if !EXPECTED_KEYS.iter().any(|key| obj.contains_key(*key)) {
        return Err(NormalizeError::NoRecognizedKeys);
    }
    let facts: AnalysisFacts = serde_json::from_value(value.clone())
        .map_err(|err| NormalizeError::InvalidField(err.to_string()))?;
    Ok(sanitize(facts))
}

/// Loose mode: total over any JSON value. Missing and wrong-typed
/// fields resolve to declared defaults, numeric-looking strings coerce,
/// arrays are filtered of null/empty elements, and individually invalid
/// fields are discarded without affecting their neighbors.
pub fn normalize_loose(value: &Value) -> AnalysisFacts {
    let empty = Map::new();
    let obj = value.as_object().unwrap_or(&empty);

    let facts = AnalysisFacts {
        category: clean_str(obj.get("category")).unwrap_or_default(),
        silhouette: clean_str(obj.get("silhouette")).unwrap_or_default(),
        labels_found: loose_labels(obj.get("labels_found")),
        preserve_details: loose_preserve_details(obj.get("preserve_details")),
        hollow_regions: loose_hollow_regions(obj.get("hollow_regions")),
        construction_details: loose_string_list(obj.get("construction_details")),
        interior_analysis: loose_string_list(obj.get("interior_analysis")),
        palette: loose_palette(obj.get("palette")),
        fabric: loose_fabric(obj.get("fabric")),
        color_precision: loose_color_precision(obj.get("color_precision")),
        fabric_behavior: loose_fabric_behavior(obj.get("fabric_behavior")),
        construction_precision: loose_construction_precision(obj.get("construction_precision")),
        rendering_guidance: loose_rendering_guidance(obj.get("rendering_guidance")),
        confidence_scores: loose_confidence_scores(obj.get("confidence_scores")),
        must_not: loose_string_list(obj.get("must_not")),
        qa_targets: loose_qa_targets(obj.get("qa_targets")),
    };
    sanitize(facts)
}

/// Shared post-pass: resolves the palette fallback chain, clamps unit
/// values, and filters empty array elements. Applied by both modes so a
/// valid record is a fixed point of normalization.
pub fn sanitize(mut facts: AnalysisFacts) -> AnalysisFacts {
    facts.palette = resolve_palette_chain(facts.palette);
    facts.fabric.drape_stiffness = clamp_unit(facts.fabric.drape_stiffness);

    for label in &mut facts.labels_found {
        label.legibility = clamp_unit(label.legibility);
        if let Some(bbox) = &mut label.bbox_norm {
            for component in bbox.iter_mut() {
                *component = clamp_unit(*component);
            }
        }
    }
    facts.labels_found.retain(|label| {
        !label.text.trim().is_empty() || !label.location.trim().is_empty()
    });
    facts
        .preserve_details
        .retain(|detail| !detail.element.trim().is_empty());
    facts.construction_details.retain(|row| !row.trim().is_empty());
    facts.interior_analysis.retain(|row| !row.trim().is_empty());
    facts.must_not.retain(|row| !row.trim().is_empty());

    if let Some(scores) = &mut facts.confidence_scores {
        scores.color_fidelity = scores.color_fidelity.map(clamp_unit);
        scores.fabric_realism = scores.fabric_realism.map(clamp_unit);
        scores.overall = scores.overall.map(clamp_unit);
    }

    if facts.qa_targets.delta_e_max <= 0.0 {
        facts.qa_targets.delta_e_max = QaTargets::default().delta_e_max;
    }
    if facts.qa_targets.edge_halo_max_pct <= 0.0 {
        facts.qa_targets.edge_halo_max_pct = QaTargets::default().edge_halo_max_pct;
    }
    if facts.qa_targets.symmetry_tolerance <= 0.0 {
        facts.qa_targets.symmetry_tolerance = QaTargets::default().symmetry_tolerance;
    }
    if facts.qa_targets.min_resolution == 0 {
        facts.qa_targets.min_resolution = QaTargets::default().min_resolution;
    }
    facts
}

/// `#RRGGBB` with ascii hex digits; nothing looser counts as a color.
pub fn is_hex_color(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 7 && bytes[0] == b'#' && bytes[1..].iter().all(u8::is_ascii_hexdigit)
}

/// Applies the explicit priority chain: dominant falls back to neutral
/// gray, accent to dominant, trim to accent (post-fallback).
pub fn resolve_palette_chain(palette: Palette) -> Palette {
    let dominant = valid_hex(&palette.dominant_hex).unwrap_or_else(|| DEFAULT_HEX.to_string());
    let accent = valid_hex(&palette.accent_hex).unwrap_or_else(|| dominant.clone());
    let trim = valid_hex(&palette.trim_hex).unwrap_or_else(|| accent.clone());
    Palette {
        dominant_hex: dominant,
        accent_hex: accent,
        trim_hex: trim,
        pattern_hexes: palette
            .pattern_hexes
            .into_iter()
            .filter(|hex| is_hex_color(hex))
            .collect(),
        region_hints: palette
            .region_hints
            .into_iter()
            .filter(|(region, hex)| !region.trim().is_empty() && is_hex_color(hex))
            .collect(),
    }
}

/// True when a raw palette value has usable structure: an object with at
/// least one valid color among the three primary slots.
pub fn palette_is_structured(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    ["dominant_hex", "accent_hex", "trim_hex"]
        .iter()
        .any(|key| {
            obj.get(*key)
                .and_then(Value::as_str)
                .map(|hex| is_hex_color(hex.trim()))
                .unwrap_or(false)
        })
}

/// Rebuilds a palette from an enrichment document: its own palette when
/// structured, else its color-precision fields. The consolidation
/// engine uses this as a targeted repair.
pub fn palette_from_enrichment(enrichment: &Value) -> Palette {
    if let Some(palette) = enrichment.get("palette") {
        if palette_is_structured(palette) {
            return resolve_palette_chain(loose_palette(Some(palette)));
        }
    }
    let empty = Map::new();
    let obj = enrichment
        .get("color_precision")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    resolve_palette_chain(Palette {
        dominant_hex: clean_str(obj.get("dominant_hex")).unwrap_or_default(),
        accent_hex: clean_str(obj.get("accent_hex")).unwrap_or_default(),
        trim_hex: clean_str(obj.get("trim_hex")).unwrap_or_default(),
        pattern_hexes: Vec::new(),
        region_hints: Default::default(),
    })
}

fn valid_hex(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    is_hex_color(trimmed).then(|| trimmed.to_string())
}

fn clean_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn coerce_u32(value: Option<&Value>) -> Option<u32> {
    coerce_f64(value)
        .filter(|raw| raw.is_finite() && *raw >= 0.0)
        .map(|raw| raw.round() as u32)
}

fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value {
        Some(Value::Bool(flag)) => Some(*flag),
        Some(Value::Number(number)) => number.as_i64().map(|raw| raw != 0),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn clamp_unit(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn object_rows(value: Option<&Value>) -> Vec<&Map<String, Value>> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_object)
                .filter(|row| !row.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn loose_labels(value: Option<&Value>) -> Vec<GarmentLabel> {
    object_rows(value)
        .into_iter()
        .map(|row| GarmentLabel {
            text: clean_str(row.get("text")).unwrap_or_default(),
            label_type: clean_str(row.get("label_type"))
                .map(|raw| LabelType::parse(&raw))
                .unwrap_or_default(),
            location: clean_str(row.get("location")).unwrap_or_default(),
            bbox_norm: loose_bbox(row.get("bbox_norm")),
            visible: coerce_bool(row.get("visible")).unwrap_or(true),
            legibility: coerce_f64(row.get("legibility")).unwrap_or(0.5),
            preserve: coerce_bool(row.get("preserve")).unwrap_or(true),
            priority: clean_str(row.get("priority"))
                .map(|raw| Priority::parse(&raw))
                .unwrap_or_default(),
        })
        .collect()
}

fn loose_bbox(value: Option<&Value>) -> Option<[f64; 4]> {
    let rows = value?.as_array()?;
    if rows.len() != 4 {
        return None;
    }
    let mut bbox = [0.0; 4];
    for (slot, row) in bbox.iter_mut().zip(rows) {
        *slot = coerce_f64(Some(row))?;
    }
    Some(bbox)
}

fn loose_preserve_details(value: Option<&Value>) -> Vec<PreserveDetail> {
    object_rows(value)
        .into_iter()
        .map(|row| PreserveDetail {
            element: clean_str(row.get("element")).unwrap_or_default(),
            priority: clean_str(row.get("priority"))
                .map(|raw| Priority::parse(&raw))
                .unwrap_or_default(),
            location: clean_str(row.get("location")),
            notes: clean_str(row.get("notes")),
        })
        .collect()
}

fn loose_hollow_regions(value: Option<&Value>) -> Vec<HollowRegion> {
    object_rows(value)
        .into_iter()
        .map(|row| HollowRegion {
            region: clean_str(row.get("region"))
                .map(|raw| HollowKind::parse(&raw))
                .unwrap_or_default(),
            keep_hollow: coerce_bool(row.get("keep_hollow")).unwrap_or(true),
            inner_description: clean_str(row.get("inner_description")),
        })
        .collect()
}

fn loose_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(|row| clean_str(Some(row)))
            .collect(),
        // A bare string stands in for a one-element list.
        Some(Value::String(_)) => clean_str(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn loose_palette(value: Option<&Value>) -> Palette {
    let empty = Map::new();
    let obj = value.and_then(Value::as_object).unwrap_or(&empty);
    Palette {
        dominant_hex: clean_str(obj.get("dominant_hex")).unwrap_or_default(),
        accent_hex: clean_str(obj.get("accent_hex")).unwrap_or_default(),
        trim_hex: clean_str(obj.get("trim_hex")).unwrap_or_default(),
        pattern_hexes: loose_string_list(obj.get("pattern_hexes")),
        region_hints: obj
            .get("region_hints")
            .and_then(Value::as_object)
            .map(|hints| {
                hints
                    .iter()
                    .filter_map(|(region, hex)| {
                        clean_str(Some(hex)).map(|hex| (region.clone(), hex))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn loose_fabric(value: Option<&Value>) -> FabricProfile {
    let empty = Map::new();
    let obj = value.and_then(Value::as_object).unwrap_or(&empty);
    FabricProfile {
        weave: clean_str(obj.get("weave")).unwrap_or_default(),
        drape_stiffness: coerce_f64(obj.get("drape_stiffness")).unwrap_or(0.5),
        transparency: clean_str(obj.get("transparency"))
            .map(|raw| Transparency::parse(&raw))
            .unwrap_or_default(),
        sheen: clean_str(obj.get("sheen"))
            .map(|raw| Sheen::parse(&raw))
            .unwrap_or_default(),
    }
}

fn loose_color_precision(value: Option<&Value>) -> Option<ColorPrecision> {
    let obj = value?.as_object()?;
    Some(ColorPrecision {
        dominant_hex: clean_str(obj.get("dominant_hex")),
        accent_hex: clean_str(obj.get("accent_hex")),
        trim_hex: clean_str(obj.get("trim_hex")),
        color_temperature: clean_str(obj.get("color_temperature")),
        saturation_level: clean_str(obj.get("saturation_level")),
    })
}

fn loose_fabric_behavior(value: Option<&Value>) -> Option<FabricBehavior> {
    let obj = value?.as_object()?;
    Some(FabricBehavior {
        drape_quality: clean_str(obj.get("drape_quality")),
        wrinkle_tendency: clean_str(obj.get("wrinkle_tendency")),
        surface_texture: clean_str(obj.get("surface_texture")),
        stretch: clean_str(obj.get("stretch")),
    })
}

fn loose_construction_precision(value: Option<&Value>) -> Option<ConstructionPrecision> {
    let obj = value?.as_object()?;
    Some(ConstructionPrecision {
        seam_visibility: clean_str(obj.get("seam_visibility")),
        edge_finishing: clean_str(obj.get("edge_finishing")),
        stitching_contrast: coerce_bool(obj.get("stitching_contrast")),
        hardware_finish: clean_str(obj.get("hardware_finish")),
        closure_visibility: clean_str(obj.get("closure_visibility")),
    })
}

fn loose_rendering_guidance(value: Option<&Value>) -> Option<RenderingGuidance> {
    let obj = value?.as_object()?;
    Some(RenderingGuidance {
        view: clean_str(obj.get("view")),
        framing: clean_str(obj.get("framing")),
        shadow_style: clean_str(obj.get("shadow_style")),
        lighting_preference: clean_str(obj.get("lighting_preference")),
        detail_sharpness: clean_str(obj.get("detail_sharpness")),
    })
}

fn loose_confidence_scores(value: Option<&Value>) -> Option<ConfidenceScores> {
    let obj = value?.as_object()?;
    Some(ConfidenceScores {
        color_fidelity: coerce_f64(obj.get("color_fidelity")),
        fabric_realism: coerce_f64(obj.get("fabric_realism")),
        overall: coerce_f64(obj.get("overall")),
    })
}

fn loose_qa_targets(value: Option<&Value>) -> QaTargets {
    let defaults = QaTargets::default();
    let empty = Map::new();
    let obj = value.and_then(Value::as_object).unwrap_or(&empty);
    QaTargets {
        delta_e_max: coerce_f64(obj.get("delta_e_max")).unwrap_or(defaults.delta_e_max),
        edge_halo_max_pct: coerce_f64(obj.get("edge_halo_max_pct"))
            .unwrap_or(defaults.edge_halo_max_pct),
        symmetry_tolerance: coerce_f64(obj.get("symmetry_tolerance"))
            .unwrap_or(defaults.symmetry_tolerance),
        min_resolution: coerce_u32(obj.get("min_resolution")).unwrap_or(defaults.min_resolution),
    }
}
