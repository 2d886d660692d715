use std::collections::HashMap;

use fluent_bundle::{FluentArgs, FluentBundle, FluentResource, FluentValue};
use unic_langid::LanguageIdentifier;

const EN_US: &str = include_str!("../locales/en-US/main.ftl");

macro_rules! lang {
    ($lang:literal) => {
        $lang
            .parse::<LanguageIdentifier>()
            .expect("invalid language")
    };
}

pub struct Localizer {
    current: LanguageIdentifier,
    bundles: HashMap<LanguageIdentifier, FluentBundle<FluentResource>>,
}

impl Localizer {
    pub fn new(default_language: &str) -> Self {
        let mut bundles = HashMap::new();
        for lang in Self::available_languages() {
            if let Some(bundle) = build_bundle(&lang) {
                bundles.insert(lang.clone(), bundle);
            }
        }

        let mut current = parse_language(default_language).unwrap_or_else(|| lang!("en-US"));
        if !bundles.contains_key(&current) {
            current = lang!("en-US");
        }

        Self { current, bundles }
    }

    pub fn available_languages() -> Vec<LanguageIdentifier> {
        vec![lang!("en-US")]
    }

    pub fn text(&self, key: &str) -> String {
        self.format(key, None)
    }

    /// Formats `key` with named arguments.
    pub fn text_with<'a>(&self, key: &str, pairs: &[(&'a str, FluentValue<'a>)]) -> String {
        let mut args = FluentArgs::new();
        for (name, value) in pairs {
            args.set(*name, value.clone());
        }
        self.format(key, Some(&args))
    }

    pub fn format(&self, key: &str, args: Option<&FluentArgs>) -> String {
        let bundle = match self.bundles.get(&self.current) {
            Some(bundle) => bundle,
            None => return key.to_string(),
        };

        if let Some(message) = bundle.get_message(key) {
            if let Some(pattern) = message.value() {
                let mut errors = Vec::new();
                let value = bundle.format_pattern(pattern, args, &mut errors);
                if errors.is_empty() {
                    return value.to_string();
                }
            }
        }

        key.to_string()
    }
}

fn parse_language(language: &str) -> Option<LanguageIdentifier> {
    language.parse().ok()
}

fn build_bundle(lang: &LanguageIdentifier) -> Option<FluentBundle<FluentResource>> {
    let resource = FluentResource::try_new(EN_US.to_owned()).ok()?;
    let mut bundle = FluentBundle::new(vec![lang.clone()]);
    // Isolation marks show up as stray glyphs in iced text widgets.
    bundle.set_use_isolating(false);
    bundle.add_resource(resource).ok()?;
    Some(bundle)
}

pub fn number(value: usize) -> FluentValue<'static> {
    FluentValue::from(value as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_language_falls_back_to_english() {
        let localizer = Localizer::new("xx-YY");
        assert_eq!(localizer.text("button-download"), "Download");
        assert_eq!(localizer.text("no-such-key"), "no-such-key");
    }

    #[test]
    fn arguments_are_substituted() {
        let localizer = Localizer::new("en-US");
        let text = localizer.text_with(
            "phase-downloading",
            &[("current", number(2)), ("total", number(5))],
        );
        assert_eq!(text, "Downloading 2 of 5");
    }
}
