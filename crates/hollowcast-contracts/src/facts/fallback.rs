use serde_json::Value;

use super::normalize::normalize_loose;
use super::AnalysisFacts;

/// Model-free synthesis of `AnalysisFacts` straight from the two source
/// documents. Structure, labels, and interior data come from the
/// structural analysis; color and fabric from the enrichment analysis;
/// everything else keeps its declared default. Always succeeds.
pub fn synthesize_fallback(structural: &Value, enrichment: &Value) -> AnalysisFacts {
    let structural = normalize_loose(structural);
    let enrichment = normalize_loose(enrichment);

    AnalysisFacts {
        category: structural.category,
        silhouette: structural.silhouette,
        labels_found: structural.labels_found,
        preserve_details: structural.preserve_details,
        hollow_regions: structural.hollow_regions,
        construction_details: structural.construction_details,
        interior_analysis: structural.interior_analysis,
        palette: enrichment.palette,
        fabric: enrichment.fabric,
        color_precision: enrichment.color_precision,
        fabric_behavior: enrichment.fabric_behavior,
        ..AnalysisFacts::default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::facts::normalize::normalize_loose;
    use crate::facts::DEFAULT_HEX;

    use super::synthesize_fallback;

    fn structural_doc() -> serde_json::Value {
        json!({
            "category": "jacket",
            "silhouette": "cropped",
            "labels_found": [
                {"text": "NORTHWIND", "label_type": "brand", "location": "inner collar",
                 "visible": true, "preserve": true, "legibility": 0.9},
                {"text": "M", "label_type": "size", "location": "side seam",
                 "visible": false, "preserve": false},
            ],
            "hollow_regions": [{"region": "neckline", "keep_hollow": true}],
            "interior_analysis": ["contrast lining visible at collar"],
            "construction_details": ["raglan sleeves"],
        })
    }

    fn enrichment_doc() -> serde_json::Value {
        json!({
            "palette": {"dominant_hex": "#1B3A57", "accent_hex": "#C0C0C0"},
            "fabric": {"weave": "twill", "drape_stiffness": 0.7, "sheen": "subtle"},
            "color_precision": {"dominant_hex": "#1B3A57", "color_temperature": "cool"},
        })
    }

    #[test]
    fn fallback_copies_structure_and_color_sources() {
        let facts = synthesize_fallback(&structural_doc(), &enrichment_doc());

        let expected_labels = normalize_loose(&structural_doc()).labels_found;
        assert_eq!(facts.labels_found, expected_labels);
        assert_eq!(facts.category, "jacket");
        assert_eq!(facts.hollow_regions.len(), 1);
        assert_eq!(facts.interior_analysis, vec!["contrast lining visible at collar"]);

        assert_eq!(facts.palette.dominant_hex, "#1B3A57");
        assert_eq!(facts.fabric.weave, "twill");
        assert!(facts.color_precision.is_some());

        // Everything outside the two named sources stays default.
        assert!(facts.rendering_guidance.is_none());
        assert!(facts.confidence_scores.is_none());
        assert!(facts.must_not.is_empty());
    }

    #[test]
    fn fallback_survives_garbage_sources() {
        let facts = synthesize_fallback(&json!(null), &json!("not a document"));
        assert!(facts.labels_found.is_empty());
        assert_eq!(facts.palette.dominant_hex, DEFAULT_HEX);
    }
}
