//! Normalizes a subagent's final text into a short narrative for chat replies.

/// Marker a subagent result starts with when the iteration ceiling was hit.
pub const INCOMPLETE_MARKER: &str = "[INCOMPLETE]";

pub const NO_RESULT: &str = "⚠️ No result produced.";
pub const INCOMPLETE_RESULT: &str = "⚠️ Task completed with no output (incomplete).";

const NARRATIVE_MAX_CHARS: usize = 300;

/// First non-empty paragraph of `result`, capped at 300 characters.
///
/// Empty results and results flagged as incomplete map to fixed markers.
pub fn extract_narrative(result: Option<&str>) -> String {
    let Some(text) = result.filter(|r| !r.trim().is_empty()) else {
        return NO_RESULT.to_string();
    };
    if text.starts_with(INCOMPLETE_MARKER) {
        return INCOMPLETE_RESULT.to_string();
    }

    let paragraph = text
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or_default();

    if paragraph.chars().count() > NARRATIVE_MAX_CHARS {
        let head: String = paragraph.chars().take(NARRATIVE_MAX_CHARS - 3).collect();
        format!("{head}...")
    } else {
        paragraph.to_string()
    }
}
