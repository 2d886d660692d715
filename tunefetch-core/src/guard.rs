use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::session::Session;

/// One lightweight authenticated call used to check a session.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn probe(&self, session: &Session) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Usable,
    Expired,
}

#[derive(Clone)]
pub struct SessionGuard {
    probe: Arc<dyn SessionProbe>,
}

impl SessionGuard {
    pub fn new(probe: Arc<dyn SessionProbe>) -> Self {
        Self { probe }
    }

    /// Network and authorization failures are not told apart: either one
    /// means the user has to log in again.
    pub async fn ensure_usable(&self, session: &Session) -> SessionStatus {
        match self.probe.probe(session).await {
            Ok(()) => {
                debug!("session accepted by remote service");
                SessionStatus::Usable
            }
            Err(error) => {
                warn!("session validation failed: {error}");
                SessionStatus::Expired
            }
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TokenProbe {
        accepted: &'static str,
    }

    #[async_trait]
    impl SessionProbe for TokenProbe {
        async fn probe(&self, session: &Session) -> Result<(), ApiError> {
            if session.access_token() == self.accepted {
                Ok(())
            } else {
                Err(ApiError::Status {
                    url: "me".to_string(),
                    status: 401,
                })
            }
        }
    }

    #[tokio::test]
    async fn rejected_probe_means_expired() {
        let guard = SessionGuard::new(Arc::new(TokenProbe { accepted: "fresh" }));
        assert_eq!(
            guard.ensure_usable(&Session::new("stale")).await,
            SessionStatus::Expired
        );
        assert_eq!(
            guard.ensure_usable(&Session::new("fresh")).await,
            SessionStatus::Usable
        );
    }
}
