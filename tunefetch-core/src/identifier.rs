use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ParseError;

pub const CATALOG_HOST: &str = "open.spotify.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Album,
    Artist,
    Playlist,
    Track,
    Episode,
}

impl ContentKind {
    pub const ALL: [ContentKind; 5] = [
        ContentKind::Album,
        ContentKind::Artist,
        ContentKind::Playlist,
        ContentKind::Track,
        ContentKind::Episode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Album => "album",
            ContentKind::Artist => "artist",
            ContentKind::Playlist => "playlist",
            ContentKind::Track => "track",
            ContentKind::Episode => "episode",
        }
    }

    /// Case-sensitive lookup of a kind segment.
    pub fn from_segment(segment: &str) -> Option<ContentKind> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == segment)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentIdentifier {
    kind: ContentKind,
    id: String,
}

impl ContentIdentifier {
    pub fn new(kind: ContentKind, id: impl Into<String>) -> Result<Self, ParseError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ParseError::EmptyId);
        }
        Ok(Self { kind, id })
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ContentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spotify:{}:{}", self.kind, self.id)
    }
}

impl FromStr for ContentIdentifier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parses a catalog reference.
///
/// Two forms are accepted:
/// - `scheme:kind:id`, e.g. `spotify:album:4aawyAB9vmqN3uQ7FjRGTy`
/// - a URL on [`CATALOG_HOST`], e.g.
///   `https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M?si=abc`,
///   where the last two path segments are the kind and the id.
pub fn parse(reference: &str) -> Result<ContentIdentifier, ParseError> {
    let reference = reference.trim();
    let (kind, id) = if reference.contains("://") || reference.contains('/') {
        split_url(reference)?
    } else {
        split_uri(reference)?
    };

    let kind = ContentKind::from_segment(&kind).ok_or(ParseError::UnsupportedKind(kind))?;
    ContentIdentifier::new(kind, id)
}

fn split_uri(reference: &str) -> Result<(String, String), ParseError> {
    let parts: Vec<&str> = reference.split(':').collect();
    match parts.as_slice() {
        [_scheme, kind, id] => Ok((kind.to_string(), id.to_string())),
        _ => Err(ParseError::MalformedUri(reference.to_string())),
    }
}

fn split_url(reference: &str) -> Result<(String, String), ParseError> {
    let absolute = if reference.contains("://") {
        reference.to_string()
    } else {
        format!("https://{reference}")
    };
    let url = Url::parse(&absolute).map_err(|_| ParseError::MalformedUri(reference.to_string()))?;

    match url.host_str() {
        Some(host) if host == CATALOG_HOST => {}
        Some(host) => return Err(ParseError::UnrecognizedHost(host.to_string())),
        None => return Err(ParseError::UnrecognizedHost(String::new())),
    }

    // Query and fragment are not part of the path; empty segments come from
    // trailing or doubled slashes.
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [.., kind, id] => Ok((kind.to_string(), id.to_string())),
        _ => Err(ParseError::MissingPathSegments(reference.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(kind: ContentKind, id: &str) -> ContentIdentifier {
        ContentIdentifier::new(kind, id).unwrap()
    }

    #[test]
    fn parses_colon_form_for_every_kind() {
        for kind in ContentKind::ALL {
            let reference = format!("spotify:{}:abc123", kind.as_str());
            assert_eq!(parse(&reference).unwrap(), ident(kind, "abc123"));
        }
    }

    #[test]
    fn colon_form_needs_exactly_three_segments() {
        assert_eq!(
            parse("not-a-uri"),
            Err(ParseError::MalformedUri("not-a-uri".to_string()))
        );
        assert!(matches!(
            parse("spotify:album"),
            Err(ParseError::MalformedUri(_))
        ));
        assert!(matches!(
            parse("spotify:user:someone:playlist:xyz"),
            Err(ParseError::MalformedUri(_))
        ));
    }

    #[test]
    fn parses_url_form_and_strips_query() {
        assert_eq!(
            parse("https://open.spotify.com/album/XYZ?si=1").unwrap(),
            ident(ContentKind::Album, "XYZ")
        );
        assert_eq!(
            parse("https://open.spotify.com/playlist/P1/").unwrap(),
            ident(ContentKind::Playlist, "P1")
        );
        assert_eq!(
            parse("  https://open.spotify.com/intl-de/track/T9?si=a&b=c  ").unwrap(),
            ident(ContentKind::Track, "T9")
        );
        assert_eq!(
            parse("open.spotify.com/episode/E5").unwrap(),
            ident(ContentKind::Episode, "E5")
        );
    }

    #[test]
    fn rejects_foreign_hosts() {
        assert_eq!(
            parse("https://example.com/album/XYZ"),
            Err(ParseError::UnrecognizedHost("example.com".to_string()))
        );
    }

    #[test]
    fn url_needs_two_path_segments() {
        assert!(matches!(
            parse("https://open.spotify.com/album/"),
            Err(ParseError::MissingPathSegments(_))
        ));
        assert!(matches!(
            parse("https://open.spotify.com/?si=1"),
            Err(ParseError::MissingPathSegments(_))
        ));
    }

    #[test]
    fn kind_matching_is_case_sensitive() {
        assert_eq!(
            parse("spotify:Album:XYZ"),
            Err(ParseError::UnsupportedKind("Album".to_string()))
        );
        assert_eq!(
            parse("https://open.spotify.com/show/XYZ"),
            Err(ParseError::UnsupportedKind("show".to_string()))
        );
    }

    #[test]
    fn empty_id_is_rejected_at_parse_time() {
        assert_eq!(parse("spotify:track:"), Err(ParseError::EmptyId));
        assert_eq!(
            ContentIdentifier::new(ContentKind::Track, ""),
            Err(ParseError::EmptyId)
        );
    }

    #[test]
    fn from_str_and_display_agree() {
        let parsed: ContentIdentifier = "spotify:artist:A1".parse().unwrap();
        assert_eq!(parsed.to_string(), "spotify:artist:A1");
        assert_eq!(parsed.kind(), ContentKind::Artist);
        assert_eq!(parsed.id(), "A1");
    }
}
