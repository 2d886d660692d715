//! Output path templates.
//!
//! A template is a relative path such as `{playlist}/{artist} - {song_name}`.
//! Collection placeholders are filled by the resolver, item placeholders by
//! the output writer once the item's metadata is known.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::TemplateError;

pub const PLACEHOLDERS: [&str; 12] = [
    "artist",
    "album",
    "song_name",
    "release_year",
    "disc_number",
    "track_number",
    "id",
    "track_id",
    "album_id",
    "album_num",
    "playlist",
    "playlist_num",
];

pub const DEFAULT_TEMPLATE: &str = "{artist} - {song_name}";

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(?P<name>[^{}]*)\}").expect("valid regex"));

pub fn is_placeholder(name: &str) -> bool {
    PLACEHOLDERS.contains(&name)
}

/// Checks that braces are balanced and every `{name}` is a known placeholder.
pub fn validate(template: &str) -> Result<(), TemplateError> {
    let mut depth = 0i32;
    for ch in template.chars() {
        match ch {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        if !(0..=1).contains(&depth) {
            return Err(TemplateError::Unbalanced(template.to_string()));
        }
    }
    if depth != 0 {
        return Err(TemplateError::Unbalanced(template.to_string()));
    }

    for captures in PLACEHOLDER_RE.captures_iter(template) {
        let name = &captures["name"];
        if !is_placeholder(name) {
            return Err(TemplateError::UnknownPlaceholder(name.to_string()));
        }
    }
    Ok(())
}

/// Substitutes the placeholders for which `lookup` returns a value and
/// leaves the rest untouched. Substituted values are sanitized so they can
/// never introduce a path separator or a placeholder.
pub fn render<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER_RE
        .replace_all(template, |captures: &Captures<'_>| {
            let name = &captures["name"];
            match lookup(name) {
                Some(value) => sanitize_component(&value),
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}

pub fn fill(template: &str, values: &[(&str, String)]) -> String {
    render(template, |name| {
        values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.clone())
    })
}

pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            // Braces in a value would be read as placeholders by a later pass.
            '{' => '(',
            '}' => ')',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    cleaned.trim().trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_every_known_placeholder() {
        let template = PLACEHOLDERS
            .iter()
            .map(|name| format!("{{{name}}}"))
            .collect::<Vec<_>>()
            .join("/");
        assert_eq!(validate(&template), Ok(()));
        assert_eq!(validate(DEFAULT_TEMPLATE), Ok(()));
    }

    #[test]
    fn rejects_unknown_placeholder() {
        assert_eq!(
            validate("{artist}/{genre}"),
            Err(TemplateError::UnknownPlaceholder("genre".to_string()))
        );
    }

    #[test]
    fn rejects_unbalanced_braces() {
        assert!(matches!(
            validate("{artist"),
            Err(TemplateError::Unbalanced(_))
        ));
        assert!(matches!(
            validate("artist}"),
            Err(TemplateError::Unbalanced(_))
        ));
        assert!(matches!(
            validate("{{artist}}"),
            Err(TemplateError::Unbalanced(_))
        ));
    }

    #[test]
    fn fill_keeps_unknown_values_for_later() {
        let rendered = fill(
            "{playlist}/{playlist_num} - {song_name}",
            &[
                ("playlist", "Road Trip".to_string()),
                ("playlist_num", "07".to_string()),
            ],
        );
        assert_eq!(rendered, "Road Trip/07 - {song_name}");
    }

    #[test]
    fn substituted_values_cannot_add_directories() {
        let rendered = fill("{artist}/{song_name}", &[
            ("artist", "AC/DC".to_string()),
            ("song_name", "What?".to_string()),
        ]);
        assert_eq!(rendered, "AC_DC/What_");
    }

    #[test]
    fn substituted_values_cannot_add_placeholders() {
        let rendered = fill(
            "{playlist}/{song_name}",
            &[("playlist", "{artist} Hits".to_string())],
        );
        assert_eq!(rendered, "(artist) Hits/{song_name}");
        assert_eq!(validate(&rendered), Ok(()));
    }
}
