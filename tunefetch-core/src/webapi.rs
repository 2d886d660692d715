//! Thin JSON client for the catalog Web API.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::ApiError;
use crate::fetch::MediaMetadata;
use crate::guard::SessionProbe;
use crate::session::Session;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DOWNLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebApiClient {
    http: Client,
    base_url: String,
}

impl WebApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        session: &Session,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        debug!("GET {url}");
        let response = self
            .http
            .get(&url)
            .bearer_auth(session.access_token())
            .query(query)
            .send()
            .await
            .map_err(|source| ApiError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| ApiError::Decode { url, source })
    }

    fn same_origin(&self, link: &str) -> bool {
        match (Url::parse(&self.base_url), Url::parse(link)) {
            (Ok(base), Ok(link)) => base.origin() == link.origin(),
            _ => false,
        }
    }

    /// Collects every page of a paginated listing by following `next`.
    pub async fn get_all_pages<T: DeserializeOwned>(
        &self,
        session: &Session,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, ApiError> {
        let mut page: Page<T> = self.get_json(session, path, query).await?;
        let mut items = std::mem::take(&mut page.items);
        while let Some(next) = page.next.take() {
            if !self.same_origin(&next) {
                return Err(ApiError::ForeignLink { url: next });
            }
            page = self.get_json(session, &next, &[]).await?;
            items.append(&mut page.items);
        }
        Ok(items)
    }

    pub async fn me(&self, session: &Session) -> Result<UserObject, ApiError> {
        self.get_json(session, "me", &[]).await
    }

    pub async fn track(&self, session: &Session, id: &str) -> Result<TrackObject, ApiError> {
        self.get_json(session, &format!("tracks/{id}"), &[]).await
    }

    pub async fn episode(&self, session: &Session, id: &str) -> Result<EpisodeObject, ApiError> {
        self.get_json(session, &format!("episodes/{id}"), &[]).await
    }

    pub async fn album_tracks(
        &self,
        session: &Session,
        id: &str,
    ) -> Result<Vec<ItemRef>, ApiError> {
        self.get_all_pages(session, &format!("albums/{id}/tracks"), &[("limit", "50")])
            .await
    }

    pub async fn playlist(&self, session: &Session, id: &str) -> Result<PlaylistObject, ApiError> {
        self.get_json(session, &format!("playlists/{id}"), &[("fields", "name")])
            .await
    }

    pub async fn playlist_entries(
        &self,
        session: &Session,
        id: &str,
    ) -> Result<Vec<PlaylistEntry>, ApiError> {
        self.get_all_pages(
            session,
            &format!("playlists/{id}/tracks"),
            &[("limit", "100"), ("additional_types", "track,episode")],
        )
        .await
    }

    pub async fn artist_albums(
        &self,
        session: &Session,
        id: &str,
    ) -> Result<Vec<AlbumRef>, ApiError> {
        self.get_all_pages(
            session,
            &format!("artists/{id}/albums"),
            &[("include_groups", "album,single"), ("limit", "50")],
        )
        .await
    }

    pub async fn download_bytes(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ApiError::Http {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ApiError::Decode {
                url: url.to_string(),
                source,
            })?;
            if body.len() + chunk.len() > MAX_DOWNLOAD_BYTES {
                return Err(ApiError::TooLarge {
                    url: url.to_string(),
                    limit: MAX_DOWNLOAD_BYTES,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl SessionProbe for WebApiClient {
    async fn probe(&self, session: &Session) -> Result<(), ApiError> {
        self.me(session).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserObject {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub url: String,
}

/// Any listing entry that only needs a type and an id.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlbumRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistObject {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistEntry {
    #[serde(default)]
    pub track: Option<ItemRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<NamedRef>,
    #[serde(default)]
    pub album: Option<AlbumRef>,
    #[serde(default)]
    pub disc_number: Option<u32>,
    #[serde(default)]
    pub track_number: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub show: Option<NamedRef>,
    #[serde(default)]
    pub images: Vec<Image>,
}

fn year_of(date: Option<&str>) -> Option<String> {
    date.and_then(|d| d.get(..4)).map(str::to_string)
}

impl From<TrackObject> for MediaMetadata {
    fn from(track: TrackObject) -> Self {
        let album = track.album.as_ref();
        MediaMetadata {
            id: track.id,
            name: track.name,
            artists: track.artists.into_iter().map(|a| a.name).collect(),
            album: album.map(|a| a.name.clone()),
            album_id: album.map(|a| a.id.clone()),
            release_year: year_of(album.and_then(|a| a.release_date.as_deref())),
            disc_number: track.disc_number,
            track_number: track.track_number,
            cover_url: album.and_then(|a| a.images.first()).map(|i| i.url.clone()),
        }
    }
}

impl From<EpisodeObject> for MediaMetadata {
    fn from(episode: EpisodeObject) -> Self {
        let show = episode.show.map(|s| s.name);
        MediaMetadata {
            id: episode.id,
            name: episode.name,
            artists: show.iter().cloned().collect(),
            album: show,
            album_id: None,
            release_year: year_of(episode.release_date.as_deref()),
            disc_number: None,
            track_number: None,
            cover_url: episode.images.first().map(|i| i.url.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_accepts_valid_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "user-1"})))
            .mount(&server)
            .await;

        let client = WebApiClient::new(server.uri());
        assert!(client.probe(&Session::new("good")).await.is_ok());
    }

    #[tokio::test]
    async fn probe_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = WebApiClient::new(server.uri());
        let error = client.probe(&Session::new("stale")).await.unwrap_err();
        assert!(matches!(error, ApiError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn follows_next_links() {
        let server = MockServer::start().await;
        let second_page = format!("{}/albums/A1/tracks?offset=2", server.uri());
        Mock::given(method("GET"))
            .and(path("/albums/A1/tracks"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"type": "track", "id": "t3"}],
                "next": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/albums/A1/tracks"))
            .and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"type": "track", "id": "t1"}, {"type": "track", "id": "t2"}],
                "next": second_page
            })))
            .mount(&server)
            .await;

        let client = WebApiClient::new(server.uri());
        let items = client
            .album_tracks(&Session::new("good"), "A1")
            .await
            .unwrap();
        let ids: Vec<_> = items.iter().filter_map(|i| i.id.as_deref()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn refuses_next_links_to_other_hosts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/albums/A1/tracks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"type": "track", "id": "t1"}],
                "next": "https://elsewhere.example/albums/A1/tracks?offset=1"
            })))
            .mount(&server)
            .await;

        let client = WebApiClient::new(server.uri());
        let error = client
            .album_tracks(&Session::new("good"), "A1")
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ApiError::ForeignLink { ref url } if url.starts_with("https://elsewhere.example/")
        ));
    }

    #[tokio::test]
    async fn downloads_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cover.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
            .mount(&server)
            .await;

        let client = WebApiClient::new(server.uri());
        let bytes = client
            .download_bytes(&format!("{}/cover.jpg", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn track_metadata_takes_year_and_cover_from_album() {
        let track: TrackObject = serde_json::from_value(json!({
            "id": "t1",
            "name": "Song",
            "artists": [{"name": "A"}, {"name": "B"}],
            "album": {
                "id": "al1",
                "name": "Record",
                "release_date": "1999-03-01",
                "images": [{"url": "https://img/1"}]
            },
            "disc_number": 1,
            "track_number": 4
        }))
        .unwrap();
        let metadata = MediaMetadata::from(track);
        assert_eq!(metadata.release_year.as_deref(), Some("1999"));
        assert_eq!(metadata.cover_url.as_deref(), Some("https://img/1"));
        assert_eq!(metadata.artists, vec!["A", "B"]);
        assert_eq!(metadata.album_id.as_deref(), Some("al1"));
    }
}
