//! Turns a content identifier into the ordered list of items to download.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ResolutionError;
use crate::identifier::{ContentIdentifier, ContentKind};
use crate::session::Session;
use crate::template;
use crate::webapi::{ItemRef, WebApiClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayableKind {
    Track,
    Episode,
    Unknown(String),
}

impl PlayableKind {
    pub fn from_type(value: &str) -> PlayableKind {
        match value {
            "track" => PlayableKind::Track,
            "episode" => PlayableKind::Episode,
            other => PlayableKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PlayableKind::Track => "track",
            PlayableKind::Episode => "episode",
            PlayableKind::Unknown(other) => other,
        }
    }
}

impl fmt::Display for PlayableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayableItem {
    pub kind: PlayableKind,
    pub id: String,
    pub library: PathBuf,
    pub output_template: String,
}

/// Ordered, never empty.
#[derive(Debug, Clone)]
pub struct ResolvedCollection {
    items: Vec<PlayableItem>,
}

impl ResolvedCollection {
    pub fn new(items: Vec<PlayableItem>) -> Result<Self, ResolutionError> {
        if items.is_empty() {
            return Err(ResolutionError::EmptyCollection);
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, index: usize) -> Option<&PlayableItem> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[PlayableItem] {
        &self.items
    }
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub output_template: String,
    pub music_dir: PathBuf,
    pub podcast_dir: PathBuf,
    pub save_metadata: bool,
}

impl ResolveOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_template: config.download.output_template.clone(),
            music_dir: config.general.music_dir.clone(),
            podcast_dir: config.general.podcast_dir.clone(),
            save_metadata: config.download.save_metadata,
        }
    }

    fn library_for(&self, kind: &PlayableKind) -> PathBuf {
        match kind {
            PlayableKind::Episode => self.podcast_dir.clone(),
            _ => self.music_dir.clone(),
        }
    }

    fn item(&self, kind: PlayableKind, id: String, values: &[(&str, String)]) -> PlayableItem {
        PlayableItem {
            library: self.library_for(&kind),
            output_template: template::fill(&self.output_template, values),
            kind,
            id,
        }
    }
}

#[async_trait]
pub trait CollectionResolver: Send + Sync {
    async fn resolve(
        &self,
        identifier: &ContentIdentifier,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError>;
}

/// Resolution for a single [`ContentKind`].
#[async_trait]
pub trait KindResolver: Send + Sync {
    async fn resolve(
        &self,
        api: &WebApiClient,
        id: &str,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError>;
}

pub struct AlbumResolver;
pub struct ArtistResolver;
pub struct PlaylistResolver;
pub struct TrackResolver;
pub struct EpisodeResolver;

pub fn resolver_for(kind: ContentKind) -> &'static dyn KindResolver {
    match kind {
        ContentKind::Album => &AlbumResolver,
        ContentKind::Artist => &ArtistResolver,
        ContentKind::Playlist => &PlaylistResolver,
        ContentKind::Track => &TrackResolver,
        ContentKind::Episode => &EpisodeResolver,
    }
}

fn position(index: usize) -> String {
    format!("{:02}", index + 1)
}

async fn album_items(
    api: &WebApiClient,
    album_id: &str,
    session: &Session,
    options: &ResolveOptions,
) -> Result<Vec<PlayableItem>, ResolutionError> {
    let tracks = api.album_tracks(session, album_id).await?;
    Ok(tracks
        .into_iter()
        .filter_map(|track| Some((PlayableKind::from_type(&track.kind), track.id?)))
        .enumerate()
        .map(|(index, (kind, id))| {
            options.item(
                kind,
                id,
                &[
                    ("album_num", position(index)),
                    ("album_id", album_id.to_string()),
                ],
            )
        })
        .collect())
}

#[async_trait]
impl KindResolver for AlbumResolver {
    async fn resolve(
        &self,
        api: &WebApiClient,
        id: &str,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError> {
        album_items(api, id, session, options).await
    }
}

#[async_trait]
impl KindResolver for ArtistResolver {
    async fn resolve(
        &self,
        api: &WebApiClient,
        id: &str,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError> {
        let albums = api.artist_albums(session, id).await?;
        debug!("artist {id} has {} albums", albums.len());
        let mut items = Vec::new();
        for album in albums {
            items.extend(album_items(api, &album.id, session, options).await?);
        }
        Ok(items)
    }
}

#[async_trait]
impl KindResolver for PlaylistResolver {
    async fn resolve(
        &self,
        api: &WebApiClient,
        id: &str,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError> {
        let playlist = api.playlist(session, id).await?;
        let entries = api.playlist_entries(session, id).await?;

        let mut items = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            // Local files and removed tracks have no catalog id.
            let Some(ItemRef { kind, id: Some(item_id) }) = entry.track else {
                debug!("skipping playlist entry {} without an id", index + 1);
                continue;
            };
            items.push(options.item(
                PlayableKind::from_type(&kind),
                item_id,
                &[
                    ("playlist", playlist.name.clone()),
                    ("playlist_num", position(index)),
                ],
            ));
        }
        Ok(items)
    }
}

#[async_trait]
impl KindResolver for TrackResolver {
    async fn resolve(
        &self,
        api: &WebApiClient,
        id: &str,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError> {
        let track = api.track(session, id).await?;
        Ok(vec![options.item(PlayableKind::Track, track.id, &[])])
    }
}

#[async_trait]
impl KindResolver for EpisodeResolver {
    async fn resolve(
        &self,
        api: &WebApiClient,
        id: &str,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError> {
        let episode = api.episode(session, id).await?;
        Ok(vec![options.item(PlayableKind::Episode, episode.id, &[])])
    }
}

#[derive(Debug, Clone)]
pub struct WebApiResolver {
    api: WebApiClient,
}

impl WebApiResolver {
    pub fn new(api: WebApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl CollectionResolver for WebApiResolver {
    async fn resolve(
        &self,
        identifier: &ContentIdentifier,
        session: &Session,
        options: &ResolveOptions,
    ) -> Result<Vec<PlayableItem>, ResolutionError> {
        let items = resolver_for(identifier.kind())
            .resolve(&self.api, identifier.id(), session, options)
            .await?;
        info!("resolved {identifier} to {} playable items", items.len());
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> ResolveOptions {
        ResolveOptions {
            output_template: "{playlist}/{playlist_num} - {artist} - {song_name}".to_string(),
            music_dir: PathBuf::from("/music"),
            podcast_dir: PathBuf::from("/podcasts"),
            save_metadata: true,
        }
    }

    async fn mount(server: &MockServer, route: &str, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn empty_collection_is_an_error() {
        assert!(matches!(
            ResolvedCollection::new(Vec::new()),
            Err(ResolutionError::EmptyCollection)
        ));
    }

    #[tokio::test]
    async fn playlist_keeps_order_and_fills_collection_placeholders() {
        let server = MockServer::start().await;
        mount(&server, "/playlists/P1", json!({"name": "Mix"})).await;
        mount(
            &server,
            "/playlists/P1/tracks",
            json!({
                "items": [
                    {"track": {"type": "track", "id": "t1"}},
                    {"track": {"type": "track", "id": null}},
                    {"track": {"type": "episode", "id": "e1"}},
                    {"track": null},
                    {"track": {"type": "chapter", "id": "c1"}}
                ],
                "next": null
            }),
        )
        .await;

        let resolver = WebApiResolver::new(WebApiClient::new(server.uri()));
        let identifier = ContentIdentifier::new(ContentKind::Playlist, "P1").unwrap();
        let items = resolver
            .resolve(&identifier, &Session::new("good"), &options())
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].kind, PlayableKind::Track);
        assert_eq!(items[0].library, PathBuf::from("/music"));
        assert_eq!(
            items[0].output_template,
            "Mix/01 - {artist} - {song_name}"
        );
        assert_eq!(items[1].kind, PlayableKind::Episode);
        assert_eq!(items[1].library, PathBuf::from("/podcasts"));
        assert_eq!(items[1].output_template, "Mix/03 - {artist} - {song_name}");
        assert_eq!(items[2].kind, PlayableKind::Unknown("chapter".to_string()));
    }

    #[tokio::test]
    async fn artist_expands_every_album() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/artists/AR/albums",
            json!({"items": [{"id": "al1", "name": "One"}, {"id": "al2", "name": "Two"}]}),
        )
        .await;
        mount(
            &server,
            "/albums/al1/tracks",
            json!({"items": [{"type": "track", "id": "a"}, {"type": "track", "id": "b"}]}),
        )
        .await;
        mount(
            &server,
            "/albums/al2/tracks",
            json!({"items": [{"type": "track", "id": "c"}]}),
        )
        .await;

        let mut options = options();
        options.output_template = "{album_id}/{album_num}".to_string();
        let resolver = WebApiResolver::new(WebApiClient::new(server.uri()));
        let identifier = ContentIdentifier::new(ContentKind::Artist, "AR").unwrap();
        let items = resolver
            .resolve(&identifier, &Session::new("good"), &options)
            .await
            .unwrap();

        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(items[1].output_template, "al1/02");
        assert_eq!(items[2].output_template, "al2/01");
    }

    #[tokio::test]
    async fn empty_album_resolves_to_no_items() {
        let server = MockServer::start().await;
        mount(&server, "/albums/EMPTY/tracks", json!({"items": []})).await;

        let resolver = WebApiResolver::new(WebApiClient::new(server.uri()));
        let identifier = ContentIdentifier::new(ContentKind::Album, "EMPTY").unwrap();
        let items = resolver
            .resolve(&identifier, &Session::new("good"), &options())
            .await
            .unwrap();
        assert!(ResolvedCollection::new(items).is_err());
    }

    #[tokio::test]
    async fn api_errors_surface_as_resolution_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tracks/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = WebApiResolver::new(WebApiClient::new(server.uri()));
        let identifier = ContentIdentifier::new(ContentKind::Track, "missing").unwrap();
        let error = resolver
            .resolve(&identifier, &Session::new("good"), &options())
            .await
            .unwrap_err();
        assert!(matches!(error, ResolutionError::Api(_)));
    }
}
