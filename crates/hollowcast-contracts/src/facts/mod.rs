pub mod fallback;
pub mod normalize;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Neutral gray used wherever a color cannot be resolved.
pub const DEFAULT_HEX: &str = "#888888";

/// Top-level keys the normalizer recognizes on a facts document.
/// A strict-mode input must carry at least one of these.
pub const EXPECTED_KEYS: [&str; 15] = [
    "category",
    "silhouette",
    "labels_found",
    "preserve_details",
    "hollow_regions",
    "construction_details",
    "interior_analysis",
    "palette",
    "fabric",
    "color_precision",
    "fabric_behavior",
    "construction_precision",
    "rendering_guidance",
    "confidence_scores",
    "must_not",
];

macro_rules! catch_all_enum {
    ($name:ident, $default:ident, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Self {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($text => Self::$variant,)+
                    _ => Self::$default,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        // Unknown or wrong-typed values coerce to the default rather
        // than failing the whole document.
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = Value::deserialize(deserializer)?;
                Ok(match value.as_str() {
                    Some(text) => Self::parse(text),
                    None => Self::$default,
                })
            }
        }
    };
}

catch_all_enum!(LabelType, Other, {
    Brand => "brand",
    Size => "size",
    Care => "care",
    Composition => "composition",
    Origin => "origin",
    Other => "other",
});

catch_all_enum!(Priority, Normal, {
    Critical => "critical",
    High => "high",
    Normal => "normal",
    Low => "low",
});

catch_all_enum!(HollowKind, Other, {
    Neckline => "neckline",
    Sleeves => "sleeves",
    FrontOpening => "front_opening",
    Hem => "hem",
    Vents => "vents",
    Other => "other",
});

catch_all_enum!(Transparency, Opaque, {
    Opaque => "opaque",
    SemiSheer => "semi_sheer",
    Sheer => "sheer",
});

catch_all_enum!(Sheen, Matte, {
    Matte => "matte",
    Subtle => "subtle",
    Glossy => "glossy",
});

/// One detected text or brand marker on the garment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GarmentLabel {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub label_type: LabelType,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub bbox_norm: Option<[f64; 4]>,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_legibility")]
    pub legibility: f64,
    #[serde(default = "default_true")]
    pub preserve: bool,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PreserveDetail {
    #[serde(default)]
    pub element: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HollowRegion {
    #[serde(default)]
    pub region: HollowKind,
    #[serde(default = "default_true")]
    pub keep_hollow: bool,
    #[serde(default)]
    pub inner_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    #[serde(default = "default_hex")]
    pub dominant_hex: String,
    #[serde(default = "default_hex")]
    pub accent_hex: String,
    #[serde(default = "default_hex")]
    pub trim_hex: String,
    #[serde(default)]
    pub pattern_hexes: Vec<String>,
    #[serde(default)]
    pub region_hints: IndexMap<String, String>,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            dominant_hex: DEFAULT_HEX.to_string(),
            accent_hex: DEFAULT_HEX.to_string(),
            trim_hex: DEFAULT_HEX.to_string(),
            pattern_hexes: Vec::new(),
            region_hints: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricProfile {
    #[serde(default)]
    pub weave: String,
    #[serde(default = "default_stiffness")]
    pub drape_stiffness: f64,
    #[serde(default)]
    pub transparency: Transparency,
    #[serde(default)]
    pub sheen: Sheen,
}

impl Default for FabricProfile {
    fn default() -> Self {
        Self {
            weave: String::new(),
            drape_stiffness: default_stiffness(),
            transparency: Transparency::Opaque,
            sheen: Sheen::Matte,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ColorPrecision {
    #[serde(default)]
    pub dominant_hex: Option<String>,
    #[serde(default)]
    pub accent_hex: Option<String>,
    #[serde(default)]
    pub trim_hex: Option<String>,
    #[serde(default)]
    pub color_temperature: Option<String>,
    #[serde(default)]
    pub saturation_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FabricBehavior {
    #[serde(default)]
    pub drape_quality: Option<String>,
    #[serde(default)]
    pub wrinkle_tendency: Option<String>,
    #[serde(default)]
    pub surface_texture: Option<String>,
    #[serde(default)]
    pub stretch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConstructionPrecision {
    #[serde(default)]
    pub seam_visibility: Option<String>,
    #[serde(default)]
    pub edge_finishing: Option<String>,
    #[serde(default)]
    pub stitching_contrast: Option<bool>,
    #[serde(default)]
    pub hardware_finish: Option<String>,
    #[serde(default)]
    pub closure_visibility: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RenderingGuidance {
    #[serde(default)]
    pub view: Option<String>,
    #[serde(default)]
    pub framing: Option<String>,
    #[serde(default)]
    pub shadow_style: Option<String>,
    #[serde(default)]
    pub lighting_preference: Option<String>,
    #[serde(default)]
    pub detail_sharpness: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfidenceScores {
    #[serde(default)]
    pub color_fidelity: Option<f64>,
    #[serde(default)]
    pub fabric_realism: Option<f64>,
    #[serde(default)]
    pub overall: Option<f64>,
}

/// Numeric quality targets the reviewer compares a render against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaTargets {
    #[serde(default = "default_delta_e")]
    pub delta_e_max: f64,
    #[serde(default = "default_edge_halo")]
    pub edge_halo_max_pct: f64,
    #[serde(default = "default_symmetry")]
    pub symmetry_tolerance: f64,
    #[serde(default = "default_min_resolution")]
    pub min_resolution: u32,
}

impl Default for QaTargets {
    fn default() -> Self {
        Self {
            delta_e_max: default_delta_e(),
            edge_halo_max_pct: default_edge_halo(),
            symmetry_tolerance: default_symmetry(),
            min_resolution: default_min_resolution(),
        }
    }
}

/// The unified, validated description of the garment. Constructed once
/// per session by the consolidation engine and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalysisFacts {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub silhouette: String,
    #[serde(default)]
    pub labels_found: Vec<GarmentLabel>,
    #[serde(default)]
    pub preserve_details: Vec<PreserveDetail>,
    #[serde(default)]
    pub hollow_regions: Vec<HollowRegion>,
    #[serde(default)]
    pub construction_details: Vec<String>,
    #[serde(default)]
    pub interior_analysis: Vec<String>,
    #[serde(default)]
    pub palette: Palette,
    #[serde(default)]
    pub fabric: FabricProfile,
    #[serde(default)]
    pub color_precision: Option<ColorPrecision>,
    #[serde(default)]
    pub fabric_behavior: Option<FabricBehavior>,
    #[serde(default)]
    pub construction_precision: Option<ConstructionPrecision>,
    #[serde(default)]
    pub rendering_guidance: Option<RenderingGuidance>,
    #[serde(default)]
    pub confidence_scores: Option<ConfidenceScores>,
    #[serde(default)]
    pub must_not: Vec<String>,
    #[serde(default)]
    pub qa_targets: QaTargets,
}

impl AnalysisFacts {
    /// True when at least one label must stay readable in the render.
    pub fn has_preserved_label(&self) -> bool {
        self.labels_found
            .iter()
            .any(|label| label.preserve && label.visible)
    }
}

fn default_true() -> bool {
    true
}

fn default_legibility() -> f64 {
    0.5
}

fn default_stiffness() -> f64 {
    0.5
}

fn default_hex() -> String {
    DEFAULT_HEX.to_string()
}

fn default_delta_e() -> f64 {
    3.0
}

fn default_edge_halo() -> f64 {
    1.0
}

fn default_symmetry() -> f64 {
    0.05
}

fn default_min_resolution() -> u32 {
    1024
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn enums_catch_unknown_values() {
        assert_eq!(LabelType::parse("BRAND"), LabelType::Brand);
        assert_eq!(LabelType::parse("hologram"), LabelType::Other);
        assert_eq!(Priority::parse("urgent"), Priority::Normal);
        assert_eq!(HollowKind::parse("front_opening"), HollowKind::FrontOpening);
        assert_eq!(Transparency::parse("gauze"), Transparency::Opaque);
        assert_eq!(Sheen::parse("glossy"), Sheen::Glossy);
    }

    #[test]
    fn enum_deserialize_coerces_wrong_types() -> anyhow::Result<()> {
        let label: GarmentLabel = serde_json::from_value(json!({
            "text": "ACME",
            "label_type": 42,
            "priority": null,
        }))?;
        assert_eq!(label.label_type, LabelType::Other);
        assert_eq!(label.priority, Priority::Normal);
        assert!(label.visible);
        assert!(label.preserve);
        Ok(())
    }

    #[test]
    fn facts_deserialize_from_empty_object() -> anyhow::Result<()> {
        let facts: AnalysisFacts = serde_json::from_value(json!({}))?;
        assert_eq!(facts.palette.dominant_hex, DEFAULT_HEX);
        assert_eq!(facts.qa_targets.min_resolution, 1024);
        assert!(facts.labels_found.is_empty());
        assert!(facts.color_precision.is_none());
        Ok(())
    }

    #[test]
    fn wrong_typed_scalar_fails_typed_deserialization() {
        // Strict-mode validation relies on this failing; the loose
        // normalizer recovers such documents field by field.
        let result = serde_json::from_value::<AnalysisFacts>(json!({
            "labels_found": [{"legibility": "very high"}],
        }));
        assert!(result.is_err());
    }
}
