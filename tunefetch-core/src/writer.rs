use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::fetch::{MediaMetadata, MediaStream};
use crate::template;

/// Destination of one item, without the audio extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

#[async_trait]
pub trait OutputWriter: Send + Sync {
    async fn create_output(
        &self,
        library: &Path,
        template: &str,
        metadata: &MediaMetadata,
    ) -> Result<OutputTarget, DownloadError>;

    async fn write_stream(
        &self,
        target: &OutputTarget,
        stream: MediaStream,
    ) -> Result<PersistedFile, DownloadError>;

    async fn write_metadata_tags(
        &self,
        file: &PersistedFile,
        metadata: &MediaMetadata,
    ) -> Result<(), DownloadError>;

    async fn write_cover_art(&self, file: &PersistedFile, image: &[u8])
        -> Result<(), DownloadError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsOutputWriter;

impl FsOutputWriter {
    pub fn new() -> Self {
        Self
    }
}

/// Renders the item placeholders left in `template` and joins the result
/// under `library`. Placeholders without a value render empty and empty or
/// relative (`.`/`..`) components are dropped, so the result always stays
/// inside `library`.
pub fn output_path(library: &Path, template: &str, metadata: &MediaMetadata) -> PathBuf {
    let rendered = template::render(template, |name| {
        Some(metadata.template_value(name).unwrap_or_default())
    });

    let mut path = library.to_path_buf();
    let mut pushed = false;
    for component in Path::new(&rendered).components() {
        if let Component::Normal(part) = component {
            let part = part.to_string_lossy();
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            path.push(part);
            pushed = true;
        }
    }
    if !pushed {
        path.push(template::sanitize_component(&metadata.id));
    }
    path
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

async fn remove_partial(path: &Path) {
    if let Err(error) = fs::remove_file(path).await {
        warn!("failed to remove partial file {:?}: {error}", path);
    }
}

#[async_trait]
impl OutputWriter for FsOutputWriter {
    async fn create_output(
        &self,
        library: &Path,
        template: &str,
        metadata: &MediaMetadata,
    ) -> Result<OutputTarget, DownloadError> {
        let path = output_path(library, template, metadata);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| DownloadError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        Ok(OutputTarget { path })
    }

    async fn write_stream(
        &self,
        target: &OutputTarget,
        stream: MediaStream,
    ) -> Result<PersistedFile, DownloadError> {
        let final_path = append_extension(&target.path, &stream.extension);
        let part_path = append_extension(&final_path, "part");
        let (_, mut reader, completion) = stream.into_parts();

        let write_result = async {
            let mut file = fs::File::create(&part_path).await?;
            let bytes = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok::<u64, std::io::Error>(bytes)
        }
        .await;

        let bytes = match write_result {
            Ok(bytes) => bytes,
            Err(source) => {
                remove_partial(&part_path).await;
                return Err(DownloadError::Write {
                    path: final_path,
                    source,
                });
            }
        };

        if let Some(completion) = completion {
            if let Err(error) = completion.await {
                remove_partial(&part_path).await;
                return Err(error);
            }
        }

        fs::rename(&part_path, &final_path)
            .await
            .map_err(|source| DownloadError::Write {
                path: final_path.clone(),
                source,
            })?;
        debug!("wrote {bytes} bytes to {:?}", final_path);

        Ok(PersistedFile {
            path: final_path,
            bytes,
        })
    }

    async fn write_metadata_tags(
        &self,
        file: &PersistedFile,
        metadata: &MediaMetadata,
    ) -> Result<(), DownloadError> {
        let path = file.path.with_extension("info.json");
        let content = serde_json::to_vec_pretty(metadata).map_err(|source| {
            DownloadError::Metadata {
                path: path.clone(),
                source,
            }
        })?;
        fs::write(&path, content)
            .await
            .map_err(|source| DownloadError::Write { path, source })
    }

    async fn write_cover_art(
        &self,
        file: &PersistedFile,
        image: &[u8],
    ) -> Result<(), DownloadError> {
        let path = file.path.with_extension("jpg");
        fs::write(&path, image)
            .await
            .map_err(|source| DownloadError::Write { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata() -> MediaMetadata {
        MediaMetadata {
            id: "t1".to_string(),
            name: "Mr. Song".to_string(),
            artists: vec!["AC/DC".to_string()],
            album: None,
            ..MediaMetadata::default()
        }
    }

    #[test]
    fn missing_values_and_traversal_are_dropped() {
        let library = Path::new("/music");
        let path = output_path(library, "{album}/../{artist} - {song_name}", &metadata());
        assert_eq!(path, PathBuf::from("/music/AC_DC - Mr. Song"));

        let path = output_path(library, "{album}", &metadata());
        assert_eq!(path, PathBuf::from("/music/t1"));
    }

    #[test]
    fn collection_names_are_not_expanded_again() {
        let template = template::fill(
            "{playlist}/{song_name}",
            &[("playlist", "{artist} Hits".to_string())],
        );
        let path = output_path(Path::new("/music"), &template, &metadata());
        assert_eq!(path, PathBuf::from("/music/(artist) Hits/Mr. Song"));

        let template = template::fill("{playlist}/{song_name}", &[("playlist", "{album}".to_string())]);
        let path = output_path(Path::new("/music"), &template, &metadata());
        assert_eq!(path, PathBuf::from("/music/(album)/Mr. Song"));
    }

    #[tokio::test]
    async fn stream_lands_under_final_name_without_part_file() {
        let dir = tempdir().unwrap();
        let writer = FsOutputWriter::new();
        let target = writer
            .create_output(dir.path(), "Mix/{artist} - {song_name}", &metadata())
            .await
            .unwrap();

        let stream = MediaStream::new(metadata(), "ogg", &b"audio"[..]);
        let file = writer.write_stream(&target, stream).await.unwrap();

        assert_eq!(file.path, dir.path().join("Mix").join("AC_DC - Mr. Song.ogg"));
        assert_eq!(file.bytes, 5);
        assert_eq!(std::fs::read(&file.path).unwrap(), b"audio");
        assert!(!append_extension(&file.path, "part").exists());

        writer.write_metadata_tags(&file, &metadata()).await.unwrap();
        writer.write_cover_art(&file, b"jpeg").await.unwrap();
        let sidecar = dir.path().join("Mix").join("AC_DC - Mr. Song.info.json");
        let decoded: MediaMetadata =
            serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
        assert_eq!(decoded, metadata());
        assert!(dir.path().join("Mix").join("AC_DC - Mr. Song.jpg").exists());
    }

    #[tokio::test]
    async fn failed_completion_removes_partial_file() {
        let dir = tempdir().unwrap();
        let writer = FsOutputWriter::new();
        let target = writer
            .create_output(dir.path(), "{song_name}", &metadata())
            .await
            .unwrap();

        let stream = MediaStream::new(metadata(), "ogg", &b"half"[..]).with_completion(
            Box::pin(async {
                Err(DownloadError::CommandFailed {
                    status: Some(1),
                    stderr: "boom".to_string(),
                })
            }),
        );
        let error = writer.write_stream(&target, stream).await.unwrap_err();
        assert!(matches!(error, DownloadError::CommandFailed { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
