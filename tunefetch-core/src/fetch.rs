use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{AdvancedSettings, Quality};
use crate::dependency::resolve_binary;
use crate::error::DownloadError;
use crate::session::Session;
use crate::webapi::WebApiClient;

pub const ACCESS_TOKEN_ENV: &str = "TUNEFETCH_ACCESS_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub album_id: Option<String>,
    pub release_year: Option<String>,
    pub disc_number: Option<u32>,
    pub track_number: Option<u32>,
    pub cover_url: Option<String>,
}

impl MediaMetadata {
    pub fn artist(&self) -> String {
        self.artists.join(", ")
    }

    /// Value for an item-scoped template placeholder.
    pub fn template_value(&self, placeholder: &str) -> Option<String> {
        match placeholder {
            "artist" => Some(self.artist()),
            "album" => self.album.clone(),
            "song_name" => Some(self.name.clone()),
            "release_year" => self.release_year.clone(),
            "disc_number" => self.disc_number.map(|n| n.to_string()),
            "track_number" => self.track_number.map(|n| format!("{n:02}")),
            "id" | "track_id" => Some(self.id.clone()),
            "album_id" => self.album_id.clone(),
            _ => None,
        }
    }
}

type Completion = BoxFuture<'static, Result<(), DownloadError>>;

/// Audio bytes for one item plus the metadata describing it.
pub struct MediaStream {
    pub metadata: MediaMetadata,
    pub extension: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    completion: Option<Completion>,
}

impl MediaStream {
    pub fn new<R>(metadata: MediaMetadata, extension: impl Into<String>, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            metadata,
            extension: extension.into(),
            reader: Box::new(reader),
            completion: None,
        }
    }

    /// Attaches a check that runs after the reader hits end of stream, e.g.
    /// waiting on the producing process.
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn into_parts(
        self,
    ) -> (
        MediaMetadata,
        Box<dyn AsyncRead + Send + Unpin>,
        Option<Completion>,
    ) {
        (self.metadata, self.reader, self.completion)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("metadata", &self.metadata)
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch_track(
        &self,
        session: &Session,
        id: &str,
        quality: Quality,
    ) -> Result<MediaStream, DownloadError>;

    async fn fetch_episode(&self, session: &Session, id: &str)
        -> Result<MediaStream, DownloadError>;

    async fn cover_art(
        &self,
        session: &Session,
        metadata: &MediaMetadata,
    ) -> Result<Option<Vec<u8>>, DownloadError>;
}

/// Fetches metadata from the Web API and audio from an external helper
/// executable that writes the decoded stream to stdout.
#[derive(Debug, Clone)]
pub struct HelperFetcher {
    api: WebApiClient,
    helper_path: PathBuf,
    helper_args: Vec<String>,
    extension: String,
}

impl HelperFetcher {
    pub fn new(api: WebApiClient, settings: &AdvancedSettings) -> Self {
        Self {
            api,
            helper_path: settings.helper_path.clone(),
            helper_args: settings.helper_args.clone(),
            extension: settings.helper_extension.clone(),
        }
    }

    fn build_command(
        &self,
        binary: &Path,
        kind: &str,
        id: &str,
        quality: Option<Quality>,
    ) -> Command {
        let mut command = Command::new(binary);

        // Hide command window on Windows
        #[cfg(target_os = "windows")]
        {
            #[allow(unused_imports)]
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        if let Some(quality) = quality {
            command.arg("--quality").arg(quality.to_string());
        }
        for extra in &self.helper_args {
            command.arg(extra);
        }
        command.arg(kind).arg(id);
        command
    }

    async fn spawn_stream(
        &self,
        session: &Session,
        metadata: MediaMetadata,
        kind: &str,
        quality: Option<Quality>,
    ) -> Result<MediaStream, DownloadError> {
        let binary = resolve_binary(&self.helper_path).ok_or_else(|| {
            DownloadError::MissingHelper(self.helper_path.to_string_lossy().to_string())
        })?;

        let mut command = self.build_command(&binary, kind, &metadata.id, quality);
        command
            .env(ACCESS_TOKEN_ENV, session.access_token())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("streaming {kind} {} via {:?}", metadata.id, binary);
        let mut child = command
            .spawn()
            .map_err(|source| DownloadError::Spawn { source })?;
        let stdout = child.stdout.take().ok_or_else(|| DownloadError::Spawn {
            source: std::io::Error::new(std::io::ErrorKind::Other, "missing stdout"),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| DownloadError::Spawn {
            source: std::io::Error::new(std::io::ErrorKind::Other, "missing stderr"),
        })?;

        // stderr is drained on its own task while stdout is copied.
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });

        let completion: Completion = Box::pin(async move {
            let status = child
                .wait()
                .await
                .map_err(|source| DownloadError::Io { source })?;
            let stderr = stderr_task
                .await
                .map_err(|source| DownloadError::Join { source })?;
            if !stderr.is_empty() {
                debug!("stream helper: {}", stderr.trim_end());
            }
            if status.success() {
                Ok(())
            } else {
                Err(DownloadError::CommandFailed {
                    status: status.code(),
                    stderr,
                })
            }
        });

        Ok(MediaStream::new(metadata, self.extension.clone(), stdout).with_completion(completion))
    }
}

#[async_trait]
impl MediaFetcher for HelperFetcher {
    async fn fetch_track(
        &self,
        session: &Session,
        id: &str,
        quality: Quality,
    ) -> Result<MediaStream, DownloadError> {
        let metadata = MediaMetadata::from(self.api.track(session, id).await?);
        self.spawn_stream(session, metadata, "track", Some(quality))
            .await
    }

    async fn fetch_episode(
        &self,
        session: &Session,
        id: &str,
    ) -> Result<MediaStream, DownloadError> {
        let metadata = MediaMetadata::from(self.api.episode(session, id).await?);
        self.spawn_stream(session, metadata, "episode", None).await
    }

    async fn cover_art(
        &self,
        _session: &Session,
        metadata: &MediaMetadata,
    ) -> Result<Option<Vec<u8>>, DownloadError> {
        match &metadata.cover_url {
            Some(url) => Ok(Some(self.api.download_bytes(url).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> MediaMetadata {
        MediaMetadata {
            id: "t1".to_string(),
            name: "Song".to_string(),
            artists: vec!["A".to_string(), "B".to_string()],
            album: Some("Record".to_string()),
            album_id: Some("al1".to_string()),
            release_year: Some("2001".to_string()),
            disc_number: Some(1),
            track_number: Some(3),
            cover_url: None,
        }
    }

    #[test]
    fn template_values_cover_item_placeholders() {
        let metadata = metadata();
        assert_eq!(metadata.template_value("artist").as_deref(), Some("A, B"));
        assert_eq!(metadata.template_value("track_number").as_deref(), Some("03"));
        assert_eq!(metadata.template_value("track_id").as_deref(), Some("t1"));
        assert_eq!(metadata.template_value("playlist"), None);
    }

    #[test]
    fn command_puts_kind_and_id_last() {
        let settings = AdvancedSettings {
            helper_args: vec!["--bitrate".to_string(), "320".to_string()],
            ..AdvancedSettings::default()
        };
        let fetcher = HelperFetcher::new(WebApiClient::new("http://localhost"), &settings);
        let command = fetcher.build_command(
            Path::new("helper"),
            "track",
            "t1",
            Some(Quality::VeryHigh),
        );
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["--quality", "very_high", "--bitrate", "320", "track", "t1"]
        );
    }

    #[tokio::test]
    async fn missing_helper_is_reported() {
        let settings = AdvancedSettings {
            helper_path: PathBuf::from("./definitely/not/here/helper"),
            ..AdvancedSettings::default()
        };
        let fetcher = HelperFetcher::new(WebApiClient::new("http://localhost"), &settings);
        let error = fetcher
            .spawn_stream(&Session::new("t"), metadata(), "track", None)
            .await
            .unwrap_err();
        assert!(matches!(error, DownloadError::MissingHelper(_)));
    }
}
