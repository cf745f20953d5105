use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

/// Wire shape emitted by the block compiler: an intent comment carrying the
/// quoted prompt, immediately followed by the trigger statement echoing an
/// escaped copy. A dangling comment without a well-formed trigger is not a
/// marker.
static MARKER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\n?[ \t]*/\* ✨ AI Request: "((?:[^"\\]|\\.)*)" \*/\n[ \t]*\{ console\.log\('AI_MAGIC_TRIGGER: (?:[^'\\]|\\.)*'\); \}\n?"#,
    )
    .expect("marker pattern is valid")
});

/// One marker occurrence: the free-text intent and the exact span that must
/// be replaced verbatim, scaffold included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub prompt: String,
    pub full_match: String,
    pub span: Range<usize>,
}

/// Scans raw source text for every marker occurrence, in order. Pure: same
/// input, same ordered list. Duplicated prompts are reported once per
/// occurrence; callers deduplicate if they need to.
pub fn extract_markers(raw: &str) -> Vec<Marker> {
    MARKER_PATTERN
        .captures_iter(raw)
        .filter_map(|captures| {
            let full = captures.get(0)?;
            let prompt = captures.get(1)?;
            Some(Marker {
                prompt: prompt.as_str().to_string(),
                full_match: full.as_str().to_string(),
                span: full.range(),
            })
        })
        .collect()
}

/// Escapes a prompt for embedding in the trigger statement: `'` -> `\'`,
/// `"` -> `\"`.
pub fn escape_prompt(prompt: &str) -> String {
    prompt.replace('\'', "\\'").replace('"', "\\\"")
}

/// Emits the exact marker wire shape for a prompt at the given indentation.
pub fn emit_marker(prompt: &str, indent: &str) -> String {
    let quoted = prompt.replace('"', "\\\"");
    let escaped = escape_prompt(prompt);
    format!(
        "\n{indent}/* ✨ AI Request: \"{quoted}\" */\n{indent}{{ console.log('AI_MAGIC_TRIGGER: {escaped}'); }}\n"
    )
}
