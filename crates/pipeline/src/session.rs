//! Remote enhancement session capability.
//!
//! A session is one automated interactive page on the enhancement service:
//! it is opened, becomes ready, accepts exactly one file, and eventually
//! exposes a result URL. The batch coordinator only talks to these traits.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Error type for remote session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Could not start a browser session
    #[error("Failed to open session: {0}")]
    Open(String),

    /// The session started but the tool page did not load
    #[error("Failed to navigate to page: {0}")]
    Navigation(String),

    /// The upload control could not be located on the page
    #[error("Upload element not found: {0}")]
    ElementNotFound(String),

    /// The file could not be handed to the upload control
    #[error("Failed to submit file: {0}")]
    Submit(String),

    /// The driver answered with something unexpected
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network failure talking to the driver
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Browser flags for new sessions.
///
/// `None` means the flag is not forced either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub headless: Option<bool>,
    pub private_mode: Option<bool>,
}

/// One live remote session.
///
/// Sessions are owned by exactly one slot; `close` is called once on every exit path.
#[async_trait]
pub trait RemoteSession: Send {
    /// Whether the page is loaded and ready to accept an upload
    async fn is_ready(&mut self) -> Result<bool, SessionError>;

    /// Hand a local file to the page's upload control
    async fn submit(&mut self, file: &Path) -> Result<(), SessionError>;

    /// Returns the result URL once the service has produced one
    async fn poll_result(&mut self) -> Result<Option<String>, SessionError>;

    /// Tear the session down. Errors are logged, never returned.
    async fn close(&mut self);
}

/// Creates sessions that are opened and navigated to the tool page.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn RemoteSession>, SessionError>;
}
