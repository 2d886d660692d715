pub mod archive;
pub mod auth;
pub mod config;
pub mod dependency;
pub mod download;
pub mod error;
pub mod fetch;
pub mod guard;
pub mod history;
pub mod identifier;
pub mod logging;
pub mod reporter;
pub mod resolver;
pub mod session;
pub mod template;
pub mod webapi;
pub mod writer;

pub use archive::DownloadArchive;
pub use auth::{AuthEvent, AuthHandle, Authenticator, PkceAuthenticator, ReauthFlow};
pub use config::{
    AdvancedSettings, AuthSettings, Config, DownloadSettings, GeneralSettings, LogSettings,
    Quality,
};
pub use dependency::HelperCheck;
pub use download::{
    Collaborators, DownloadJob, DownloadService, FailureKind, JobHandle, JobPhase, JobStatus,
    ProgressEvent,
};
pub use error::{
    ApiError, ArchiveError, AuthError, ConfigError, DependencyError, DownloadError, ParseError,
    RequestError, ResolutionError, TemplateError, TunefetchError,
};
pub use fetch::{HelperFetcher, MediaFetcher, MediaMetadata, MediaStream};
pub use guard::{SessionGuard, SessionProbe, SessionStatus};
pub use history::{HistoryEntry, HistoryTracker};
pub use identifier::{ContentIdentifier, ContentKind};
pub use logging::{LogManager, LogManagerBuilder};
pub use reporter::{ProgressObserver, ProgressReporter};
pub use resolver::{
    CollectionResolver, KindResolver, PlayableItem, PlayableKind, ResolveOptions,
    ResolvedCollection, WebApiResolver,
};
pub use session::{CredentialStore, Session, SessionCell};
pub use webapi::WebApiClient;
pub use writer::{FsOutputWriter, OutputTarget, OutputWriter, PersistedFile};

pub type Result<T> = std::result::Result<T, TunefetchError>;
