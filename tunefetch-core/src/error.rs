use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("invalid output template: {0}")]
    Template(#[from] TemplateError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    #[error("unbalanced braces in template {0:?}")]
    Unbalanced(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed uri {0:?}: expected scheme:kind:id")]
    MalformedUri(String),
    #[error("unrecognized host {0:?}")]
    UnrecognizedHost(String),
    #[error("url {0:?} needs a kind and an id in its path")]
    MissingPathSegments(String),
    #[error("unsupported content type {0:?}")]
    UnsupportedKind(String),
    #[error("reference has an empty id")]
    EmptyId,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("refusing to follow pagination link to {url}")]
    ForeignLink { url: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("session expired, please log in again")]
    SessionExpired,
    #[error("login failed: {0}")]
    ReauthenticationFailed(String),
    #[error("login timed out after {0} seconds")]
    Timeout(u64),
    #[error("login request failed: {source}")]
    Http {
        #[source]
        source: reqwest::Error,
    },
    #[error("login redirect listener error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to access credentials at {path:?}: {source}")]
    CredentialsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode credentials at {path:?}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no playable items found in collection")]
    EmptyCollection,
    #[error("failed to resolve collection: {0}")]
    ResolverFailure(String),
    #[error("failed to resolve collection: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to initialize download archive at {path:?}: {source}")]
    Initialize {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to access archive storage at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to execute archive query: {source}")]
    Query {
        #[source]
        source: rusqlite::Error,
    },
}

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("failed to launch dependency check for {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("metadata lookup failed: {0}")]
    Api(#[from] ApiError),
    #[error("stream helper not found: {0}")]
    MissingHelper(String),
    #[error("failed to spawn stream helper: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("stream helper failed with status {status:?}: {stderr}")]
    CommandFailed { status: Option<i32>, stderr: String },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode metadata for {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("download canceled")]
    Canceled,
    #[error("io error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
    #[error("task execution error: {source}")]
    Join {
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Synchronous rejection of a download request; no job is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("enter a URL or URI to download")]
    EmptyReference,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("a download is already running")]
    Busy,
}

#[derive(Debug, Error)]
pub enum TunefetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Request(#[from] RequestError),
}

pub type Result<T> = std::result::Result<T, TunefetchError>;
