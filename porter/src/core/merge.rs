//! Pure content-merge strategies.
//!
//! Each strategy transforms (existing, incoming) into merged content
//! without touching the filesystem; the write layer handles persistence.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::warn;

use crate::core::plan::{MergeMarkers, MergeStrategy};

/// Apply a merge strategy to existing content.
pub fn merge_content(
    existing: &str,
    incoming: &str,
    strategy: MergeStrategy,
    markers: Option<&MergeMarkers>,
) -> Result<String> {
    match strategy {
        MergeStrategy::AppendSection => Ok(append_section(existing, incoming)),
        MergeStrategy::ReplaceSectionByMarker => {
            let markers = markers
                .ok_or_else(|| anyhow!("replace_section_by_marker requires merge markers"))?;
            Ok(replace_section_by_marker(existing, incoming, markers))
        }
        MergeStrategy::JsonMerge => json_merge(existing, incoming),
        MergeStrategy::TomlMerge => {
            // Structural TOML merging is intentionally unimplemented; appending
            // keeps both halves visible instead of silently guessing table
            // semantics.
            warn!("toml_merge falls back to append_section");
            Ok(append_section(existing, incoming))
        }
    }
}

fn append_section(existing: &str, incoming: &str) -> String {
    format!("{existing}\n{incoming}")
}

/// Replace the span between `begin`/`end` markers, keeping the markers.
/// Falls back to appending when either marker is absent.
fn replace_section_by_marker(existing: &str, incoming: &str, markers: &MergeMarkers) -> String {
    let Some(start) = existing.find(&markers.begin) else {
        return append_section(existing, incoming);
    };
    let search_from = start + markers.begin.len();
    let Some(end_rel) = existing[search_from..].find(&markers.end) else {
        return append_section(existing, incoming);
    };
    let end = search_from + end_rel;

    let mut merged = String::with_capacity(existing.len() + incoming.len());
    merged.push_str(&existing[..start]);
    merged.push_str(&markers.begin);
    merged.push('\n');
    merged.push_str(incoming);
    merged.push('\n');
    merged.push_str(&markers.end);
    merged.push_str(&existing[end + markers.end.len()..]);
    merged
}

/// Deep-merge incoming JSON into existing JSON. Incoming keys win on
/// conflict; nested objects merge recursively; other types overwrite.
fn json_merge(existing: &str, incoming: &str) -> Result<String> {
    let mut base: Value =
        serde_json::from_str(existing).context("parse existing content for json_merge")?;
    let overlay: Value =
        serde_json::from_str(incoming).context("parse incoming content for json_merge")?;

    deep_merge(&mut base, overlay);
    let mut rendered = serde_json::to_string_pretty(&base).context("serialize merged json")?;
    rendered.push('\n');
    Ok(rendered)
}

fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> MergeMarkers {
        MergeMarkers {
            begin: "# BEGIN porter".to_string(),
            end: "# END porter".to_string(),
        }
    }

    #[test]
    fn append_section_joins_with_newline() {
        let merged =
            merge_content("line one", "line two", MergeStrategy::AppendSection, None).expect("merge");
        assert_eq!(merged, "line one\nline two");
    }

    /// Content strictly outside the marker span must be untouched.
    #[test]
    fn replace_by_marker_preserves_surrounding_content() {
        let existing = "header\n# BEGIN porter\nold body\n# END porter\nfooter\n";
        let merged = merge_content(
            existing,
            "new body",
            MergeStrategy::ReplaceSectionByMarker,
            Some(&markers()),
        )
        .expect("merge");

        assert!(merged.starts_with("header\n"));
        assert!(merged.ends_with("footer\n"));
        assert!(merged.contains("# BEGIN porter\nnew body\n# END porter"));
        assert!(!merged.contains("old body"));
    }

    #[test]
    fn replace_by_marker_falls_back_to_append_when_marker_missing() {
        let merged = merge_content(
            "no markers here",
            "incoming",
            MergeStrategy::ReplaceSectionByMarker,
            Some(&markers()),
        )
        .expect("merge");
        assert_eq!(merged, "no markers here\nincoming");
    }

    #[test]
    fn replace_by_marker_requires_markers() {
        let err = merge_content("x", "y", MergeStrategy::ReplaceSectionByMarker, None)
            .expect_err("should fail");
        assert!(err.to_string().contains("requires merge markers"));
    }

    #[test]
    fn json_merge_is_recursive_and_incoming_wins() {
        let existing = r#"{"a": {"x": 1, "y": 2}, "b": "keep", "c": [1, 2]}"#;
        let incoming = r#"{"a": {"y": 9, "z": 3}, "c": [7]}"#;

        let merged =
            merge_content(existing, incoming, MergeStrategy::JsonMerge, None).expect("merge");
        let value: Value = serde_json::from_str(&merged).expect("parse merged");

        assert_eq!(value["a"]["x"], 1);
        assert_eq!(value["a"]["y"], 9);
        assert_eq!(value["a"]["z"], 3);
        assert_eq!(value["b"], "keep");
        assert_eq!(value["c"], serde_json::json!([7]));
    }

    #[test]
    fn json_merge_rejects_invalid_json() {
        let err = merge_content("not json", "{}", MergeStrategy::JsonMerge, None)
            .expect_err("should fail");
        assert!(err.to_string().contains("json_merge"));
    }

    #[test]
    fn toml_merge_appends() {
        let merged = merge_content("[a]\nx = 1", "[b]\ny = 2", MergeStrategy::TomlMerge, None)
            .expect("merge");
        assert_eq!(merged, "[a]\nx = 1\n[b]\ny = 2");
    }
}
