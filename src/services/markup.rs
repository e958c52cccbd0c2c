//! In-band text markup understood by some TTS backends: dialect markers and voice tags.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const DIALECT_MARKERS: &[(&str, &str)] = &[
    ("sichuan", "<|Sichuan|>"),
    ("henan", "<|Henan|>"),
    ("yue", "<|Yue|>"),
    ("shanghai", "<|Shanghai|>"),
];

/// Canonical dialect name for the aliases users type.
pub fn normalize_dialect(dialect: &str) -> String {
    let d = dialect.trim().to_lowercase();
    match d.as_str() {
        "sichuanese" => "sichuan".to_string(),
        "henanese" => "henan".to_string(),
        "cantonese" | "yueyu" => "yue".to_string(),
        "shanghainese" => "shanghai".to_string(),
        "chinese" | "putonghua" => "mandarin".to_string(),
        _ => d,
    }
}

/// Marker for a dialect, `None` for mandarin and anything unknown.
pub fn dialect_marker(dialect: &str) -> Option<&'static str> {
    let normalized = normalize_dialect(dialect);
    DIALECT_MARKERS
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, marker)| *marker)
}

/// Removes every known dialect marker from the text.
pub fn remove_dialect_markers(text: &str) -> String {
    let mut out = text.to_string();
    for (_, marker) in DIALECT_MARKERS {
        if out.contains(marker) {
            out = out.replace(marker, "");
        }
    }
    out.trim_start().to_string()
}

/// Prefixes `marker`, replacing whatever marker the text already carries.
pub fn apply_dialect_marker(text: &str, marker: &str) -> String {
    format!("{}{}", marker, remove_dialect_markers(text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagSyntax {
    /// `[laughter]`
    #[default]
    Bracket,
    /// `<|laughter|>`
    AngleBar,
}

impl TagSyntax {
    fn render(self, tag: &str) -> String {
        match self {
            TagSyntax::Bracket => format!("[{}]", tag),
            TagSyntax::AngleBar => format!("<|{}|>", tag),
        }
    }
}

/// Rewrites `[tag]` markup for a provider.
///
/// Tags in `allowed` are kept (rendered in `syntax`), every other bracketed
/// word is removed. Brackets that do not look like a tag are left alone.
pub fn filter_voice_tags(text: &str, allowed: &HashSet<String>, syntax: TagSyntax) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(']') {
            Some(close) if is_tag_word(&after[..close]) => {
                let tag = after[..close].trim().to_lowercase();
                rest = &after[close + 1..];
                if allowed.contains(&tag) {
                    out.push_str(&syntax.render(&tag));
                } else {
                    rest = close_gap(&mut out, rest);
                }
            }
            _ => {
                out.push('[');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Tags the text carries, lowercased, in order of appearance.
pub fn voice_tags_in(text: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        match after.find(']') {
            Some(close) if is_tag_word(&after[..close]) => {
                tags.push(after[..close].trim().to_lowercase());
                rest = &after[close + 1..];
            }
            _ => rest = after,
        }
    }
    tags
}

fn is_tag_word(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty()
        && s.len() <= 32
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Drops the single space a removed tag leaves between `out` and `rest`.
fn close_gap<'a>(out: &mut String, rest: &'a str) -> &'a str {
    let next = rest.chars().next();
    if out.ends_with(' ')
        && next.map_or(true, |c| matches!(c, ' ' | '.' | ',' | '!' | '?' | ';' | ':'))
    {
        out.pop();
        rest
    } else if out.is_empty() {
        rest.trim_start_matches(' ')
    } else {
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_dialect_aliases() {
        assert_eq!(normalize_dialect("Sichuanese"), "sichuan");
        assert_eq!(normalize_dialect(" cantonese "), "yue");
        assert_eq!(normalize_dialect("chinese"), "mandarin");
        assert_eq!(dialect_marker("yueyu"), Some("<|Yue|>"));
        assert_eq!(dialect_marker("mandarin"), None);
        assert_eq!(dialect_marker("klingon"), None);
    }

    #[test]
    fn test_apply_marker_never_doubles() {
        let once = apply_dialect_marker("要得", "<|Sichuan|>");
        assert_eq!(once, "<|Sichuan|>要得");
        assert_eq!(apply_dialect_marker(&once, "<|Sichuan|>"), once);
        assert_eq!(apply_dialect_marker(&once, "<|Henan|>"), "<|Henan|>要得");
        assert_eq!(remove_dialect_markers("<|Yue|>好 <|Sichuan|>嘛"), "好 嘛");
    }

    #[test]
    fn test_filter_voice_tags() {
        let text = "That is funny [laughter] right [cough] ok";
        assert_eq!(
            filter_voice_tags(text, &allowed(&["laughter"]), TagSyntax::Bracket),
            "That is funny [laughter] right ok"
        );
        assert_eq!(
            filter_voice_tags(text, &allowed(&[]), TagSyntax::Bracket),
            "That is funny right ok"
        );
        assert_eq!(
            filter_voice_tags(text, &allowed(&["laughter", "cough"]), TagSyntax::AngleBar),
            "That is funny <|laughter|> right <|cough|> ok"
        );
    }

    #[test]
    fn test_removed_tags_leave_other_spacing_alone() {
        let none = allowed(&[]);
        assert_eq!(
            filter_voice_tags("Well,  you know [cough] it.  Fine [sigh]", &none, TagSyntax::Bracket),
            "Well,  you know it.  Fine"
        );
        assert_eq!(filter_voice_tags("[sigh] hi", &none, TagSyntax::Bracket), "hi");
        assert_eq!(filter_voice_tags("wait [pause].", &none, TagSyntax::Bracket), "wait.");
        assert_eq!(filter_voice_tags(" a  b ", &none, TagSyntax::Bracket), " a  b ");
    }

    #[test]
    fn test_non_tag_brackets_survive() {
        let text = "see [figure 2, left] and [a";
        assert_eq!(
            filter_voice_tags(text, &allowed(&[]), TagSyntax::Bracket),
            "see [figure 2, left] and [a"
        );
        assert_eq!(voice_tags_in("[Sigh] fine [pause]"), vec!["sigh", "pause"]);
    }
}
