//! Access token storage adapters.

use std::path::{Path, PathBuf};

use crate::application::ports::{TokenSource, TokenSourceError};
use crate::domain::session::AccessToken;

use super::settings::TokenLocation;

/// Token fixed at startup (environment variable).
#[derive(Debug, Clone)]
pub struct InlineTokenSource {
    token: Option<AccessToken>,
}

impl InlineTokenSource {
    /// Wrap a raw token; blank input means no token.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self {
            token: AccessToken::new(raw),
        }
    }
}

impl TokenSource for InlineTokenSource {
    fn load(&self) -> Result<Option<AccessToken>, TokenSourceError> {
        Ok(self.token.clone())
    }
}

/// Token read from a file on every load, so a rotated token is picked up on
/// the next connect.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    /// Read tokens from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Token file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenSource for FileTokenSource {
    fn load(&self) -> Result<Option<AccessToken>, TokenSourceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(AccessToken::new(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "Token file not found");
                Ok(None)
            }
            Err(source) => Err(TokenSourceError::Read {
                location: self.path.display().to_string(),
                source,
            }),
        }
    }
}

/// Build the token source for a configured location.
#[must_use]
pub fn token_source(location: &TokenLocation) -> Box<dyn TokenSource> {
    match location {
        TokenLocation::Inline(raw) => Box::new(InlineTokenSource::new(raw)),
        TokenLocation::File(path) => Box::new(FileTokenSource::new(path.clone())),
        TokenLocation::Unset => Box::new(InlineTokenSource { token: None }),
    }
}
