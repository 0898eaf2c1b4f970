//! Remote client seams.
//!
//! The wire protocol lives outside this crate. Bootstrap only needs three
//! things from it: a way to build a client, a way to resume or create an
//! authorization, and a way to invoke requests. Those are the [`Client`],
//! [`ClientFactory`] and [`Login`] traits below.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::{Cancellation, Cancelled};

use super::SessionOptions;

/// Key under which credentials are persisted inside a namespace.
pub const SESSION_KEY: &str = "session";

/// Errors reported by a remote client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Connection could not be established or was lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server refused the request.
    #[error("request rejected ({code}): {message}")]
    Rejected { code: i32, message: String },

    /// The server asked the caller to wait before retrying.
    #[error("flood wait: retry after {0:?}")]
    FloodWait(Duration),

    /// The shared cancellation context fired.
    #[error("client operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for ClientError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl ClientError {
    /// Returns true if the shared cancellation context caused this error.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Remote method name.
    pub method: String,
    /// Encoded arguments.
    pub body: Vec<u8>,
}

impl Request {
    /// Creates a request.
    pub fn new(method: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            body: body.into(),
        }
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Encoded result.
    pub body: Vec<u8>,
}

/// Persisted authorization for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Data center the auth key belongs to.
    pub dc: u32,
    /// Opaque authorization key.
    pub auth_key: Vec<u8>,
    /// Account id, once known.
    pub user_id: Option<i64>,
    /// When the authorization was created.
    pub created_at: DateTime<Utc>,
}

impl Credentials {
    /// Creates credentials stamped with the current time.
    #[must_use]
    pub fn new(dc: u32, auth_key: Vec<u8>, user_id: Option<i64>) -> Self {
        Self {
            dc,
            auth_key,
            user_id,
            created_at: Utc::now(),
        }
    }

    /// Encodes for storage under [`SESSION_KEY`].
    ///
    /// # Errors
    /// Returns the serializer error message.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| e.to_string())
    }

    /// Decodes a stored value.
    ///
    /// # Errors
    /// Returns the deserializer error message for unreadable values.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

/// A live connection to the remote service.
pub trait Client: Send + Sync {
    /// Tries to resume a previous authorization.
    ///
    /// Returns `Ok(false)` when the server no longer accepts `credentials`.
    fn resume(&self, credentials: &Credentials, cancel: &Cancellation) -> Result<bool, ClientError>;

    /// Performs one remote call.
    fn invoke(&self, request: &Request, cancel: &Cancellation) -> Result<Response, ClientError>;
}

/// Builds clients from per-invocation options.
pub trait ClientFactory: Send + Sync {
    /// Constructs a client. Middlewares are applied by the caller.
    fn connect(
        &self,
        options: &SessionOptions,
        cancel: &Cancellation,
    ) -> Result<Arc<dyn Client>, ClientError>;
}

/// Interactive first-use authorization.
pub trait Login: Send + Sync {
    /// Authorizes `client` and returns credentials to persist.
    fn login(&self, client: &dyn Client, cancel: &Cancellation) -> Result<Credentials, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_roundtrip() {
        let creds = Credentials::new(2, vec![1, 2, 3], Some(42));
        let bytes = creds.to_bytes().unwrap();
        assert_eq!(Credentials::from_bytes(&bytes).unwrap(), creds);
    }

    #[test]
    fn test_credentials_reject_garbage() {
        assert!(Credentials::from_bytes(b"not json").is_err());
        assert!(Credentials::from_bytes(br#"{"dc":1}"#).is_err());
    }

    #[test]
    fn test_client_error_cancelled() {
        assert!(ClientError::from(Cancelled).is_cancelled());
        assert!(!ClientError::Transport("reset".into()).is_cancelled());
        assert!(ClientError::FloodWait(Duration::from_secs(3))
            .to_string()
            .contains("3s"));
    }
}
