//! Session bootstrap.
//!
//! Turns a namespace plus per-invocation options into a live, authenticated
//! client and hands it to a task:
//!
//! ```text
//! Engine::open(ns) ─► SessionOptions ─► ClientFactory::connect
//!                                              │
//!                               compose(middlewares, first = outermost)
//!                                              │
//!             Credentials in ns? ── resume ok ─┼─► task(&Session)
//!                    │ no / unreadable / rejected
//!                    └──► Login::login ─► persist ─┘
//! ```
//!
//! Bootstrap is a single synchronous call. Every step observes the shared
//! [`Cancellation`] and reports [`SessionError::Cancelled`] once it fired.

mod client;
mod middleware;

pub use client::{
    Client, ClientError, ClientFactory, Credentials, Login, Request, Response, SESSION_KEY,
};
pub use middleware::{compose, FloodWait, Middleware, RateLimit};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cancel::{Cancellation, Cancelled};
use crate::storage::{validate_namespace, ConfigError, Engine, NamespaceHandle, StorageError};
use crate::storage::DEFAULT_NAMESPACE;

/// Failure while authenticating.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Resume or login was refused or failed remotely.
    #[error(transparent)]
    Remote(ClientError),

    /// Persisted credentials could not be read or written.
    #[error("credential storage failed: {0}")]
    Storage(StorageError),

    /// Fresh credentials could not be encoded.
    #[error("failed to encode credentials: {0}")]
    Encode(String),
}

/// Errors from [`Bootstrap`], tagged by the step that failed.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Options were invalid.
    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),

    /// The namespace could not be opened.
    #[error("failed to open namespace '{namespace}': {source}")]
    Open {
        /// Namespace name.
        namespace: String,
        /// Storage failure.
        #[source]
        source: StorageError,
    },

    /// The client could not be constructed.
    #[error("failed to construct client: {0}")]
    Client(#[source] ClientError),

    /// Resume or login failed.
    #[error("authentication failed: {0}")]
    Auth(#[source] AuthError),

    /// The shared cancellation context fired.
    #[error("session bootstrap cancelled")]
    Cancelled,
}

impl From<Cancelled> for SessionError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl SessionError {
    fn open(namespace: &str, source: StorageError) -> Self {
        if source.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Open {
            namespace: namespace.to_string(),
            source,
        }
    }

    fn client(source: ClientError) -> Self {
        if source.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Client(source)
    }

    fn remote(source: ClientError) -> Self {
        if source.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Auth(AuthError::Remote(source))
    }

    fn storage(source: StorageError) -> Self {
        if source.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Auth(AuthError::Storage(source))
    }

    /// Returns true if the shared cancellation context caused this error.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true for transient failures worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Open { source, .. } => matches!(source, StorageError::Locked(_)),
            Self::Client(e) | Self::Auth(AuthError::Remote(e)) => {
                matches!(e, ClientError::Transport(_) | ClientError::FloodWait(_))
            }
            Self::Config(_) | Self::Auth(_) => false,
        }
    }
}

/// SOCKS5 proxy endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Proxy {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
}

impl Proxy {
    const SCHEME: &'static str = "socks5://";
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Proxy {
    /// Renders the URL with the password masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::SCHEME)?;
        if let Some(user) = &self.username {
            write!(f, "{user}")?;
            if self.password.is_some() {
                f.write_str(":***")?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Proxy {
    type Err = ConfigError;

    /// Parses `socks5://[user[:pass]@]host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            option: "proxy".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = s
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| invalid("only socks5:// proxies are supported"))?;
        let (userinfo, endpoint) = match rest.rsplit_once('@') {
            Some((userinfo, endpoint)) => (Some(userinfo), endpoint),
            None => (None, rest),
        };
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must not be zero"));
        }

        let (username, password) = match userinfo {
            None => (None, None),
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(info.to_string()), None),
            },
        };
        if username.as_deref() == Some("") {
            return Err(invalid("empty user name"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }
}

/// User-facing session settings, before a namespace is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Namespace holding the account's credentials.
    pub namespace: String,
    /// Optional SOCKS5 proxy.
    pub proxy: Option<Proxy>,
    /// Optional NTP host used instead of the system clock.
    pub ntp: Option<String>,
    /// How long the client keeps reconnecting. Zero retries forever.
    pub reconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            proxy: None,
            ntp: None,
            reconnect_timeout: Self::DEFAULT_RECONNECT_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Default reconnection window.
    pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    /// Checks the namespace name and time source.
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` naming the offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = validate_namespace(&self.namespace) {
            return Err(ConfigError::InvalidValue {
                option: "namespace".to_string(),
                value: self.namespace.clone(),
                reason: e.to_string(),
            });
        }
        if let Some(host) = &self.ntp {
            if host.trim().is_empty() || host.contains(char::is_whitespace) {
                return Err(ConfigError::InvalidValue {
                    option: "ntp".to_string(),
                    value: host.clone(),
                    reason: "expected a host name".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Immutable options handed to [`ClientFactory::connect`].
#[derive(Clone)]
pub struct SessionOptions {
    namespace: NamespaceHandle,
    proxy: Option<Proxy>,
    ntp: Option<String>,
    reconnect_timeout: Duration,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.middlewares.iter().map(|m| m.name()).collect();
        f.debug_struct("SessionOptions")
            .field("namespace", &self.namespace.name())
            .field("proxy", &self.proxy)
            .field("ntp", &self.ntp)
            .field("reconnect_timeout", &self.reconnect_timeout)
            .field("middlewares", &names)
            .finish()
    }
}

impl SessionOptions {
    /// Assembles options from a config and an opened namespace.
    #[must_use]
    pub fn new(
        config: &SessionConfig,
        namespace: NamespaceHandle,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        Self {
            namespace,
            proxy: config.proxy.clone(),
            ntp: config.ntp.clone(),
            reconnect_timeout: config.reconnect_timeout,
            middlewares,
        }
    }

    /// Namespace holding this account's state.
    #[must_use]
    pub fn namespace(&self) -> &NamespaceHandle {
        &self.namespace
    }

    /// SOCKS5 proxy the client dials through.
    #[must_use]
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// External time source host.
    #[must_use]
    pub fn ntp(&self) -> Option<&str> {
        self.ntp.as_deref()
    }

    /// How long the client keeps reconnecting; zero means forever.
    #[must_use]
    pub fn reconnect_timeout(&self) -> Duration {
        self.reconnect_timeout
    }

    /// True when the client should retry connecting without limit.
    #[must_use]
    pub fn retries_unbounded(&self) -> bool {
        self.reconnect_timeout.is_zero()
    }

    /// Middlewares in application order, outermost first.
    #[must_use]
    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// Wraps `client` in every middleware.
    #[must_use]
    pub fn wrap(&self, client: Arc<dyn Client>) -> Arc<dyn Client> {
        compose(client, &self.middlewares)
    }
}

/// How the session was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Persisted credentials were accepted.
    Resumed,
    /// A fresh login ran and its credentials were stored.
    LoggedIn,
}

/// A live, authenticated client bound to one namespace.
pub struct Session {
    client: Arc<dyn Client>,
    options: SessionOptions,
    outcome: AuthOutcome,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("options", &self.options)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Client with every middleware applied.
    #[must_use]
    pub fn client(&self) -> &dyn Client {
        self.client.as_ref()
    }

    /// Namespace the credentials live in.
    #[must_use]
    pub fn namespace(&self) -> &NamespaceHandle {
        self.options.namespace()
    }

    /// Options the client was built from.
    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Whether stored credentials were reused.
    #[must_use]
    pub fn outcome(&self) -> AuthOutcome {
        self.outcome
    }
}

/// Builder for one session bootstrap.
pub struct Bootstrap<'a> {
    engine: &'a Engine,
    cancel: Cancellation,
    config: SessionConfig,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl<'a> Bootstrap<'a> {
    /// Starts a bootstrap against `engine` with default settings.
    #[must_use]
    pub fn new(engine: &'a Engine, cancel: &Cancellation) -> Self {
        Self {
            engine,
            cancel: cancel.clone(),
            config: SessionConfig::default(),
            middlewares: Vec::new(),
        }
    }

    /// Replaces the session settings.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Appends a middleware. Earlier middlewares wrap later ones.
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Appends several middlewares in order.
    #[must_use]
    pub fn middlewares(mut self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    /// Opens the namespace, builds and authenticates the client.
    ///
    /// # Errors
    /// A [`SessionError`] tagged by the failing step, or
    /// [`SessionError::Cancelled`].
    pub fn connect(self, factory: &dyn ClientFactory, login: &dyn Login) -> Result<Session, SessionError> {
        self.cancel.check()?;
        self.config.validate()?;

        let name = self.config.namespace.as_str();
        let namespace = self
            .engine
            .open(name)
            .map_err(|e| SessionError::open(name, e))?;
        let options = SessionOptions::new(&self.config, namespace, self.middlewares);
        tracing::debug!(?options, "session options assembled");

        let raw = factory
            .connect(&options, &self.cancel)
            .map_err(SessionError::client)?;
        let client = options.wrap(raw);

        let outcome = authenticate(client.as_ref(), options.namespace(), login, &self.cancel)?;
        tracing::info!(namespace = name, ?outcome, "session ready");

        Ok(Session {
            client,
            options,
            outcome,
        })
    }

    /// Bootstraps a session and runs `task` with it.
    ///
    /// The task's own error type only needs to absorb [`SessionError`];
    /// task errors are returned unchanged.
    ///
    /// # Errors
    /// Bootstrap failures converted into `E`, or the task's error.
    pub fn run<T, E, F>(self, factory: &dyn ClientFactory, login: &dyn Login, task: F) -> Result<T, E>
    where
        E: From<SessionError>,
        F: FnOnce(&Session) -> Result<T, E>,
    {
        let session = self.connect(factory, login)?;
        task(&session)
    }
}

fn authenticate(
    client: &dyn Client,
    namespace: &NamespaceHandle,
    login: &dyn Login,
    cancel: &Cancellation,
) -> Result<AuthOutcome, SessionError> {
    let stored = namespace.get(SESSION_KEY).map_err(SessionError::storage)?;
    if let Some(bytes) = stored {
        match Credentials::from_bytes(&bytes) {
            Ok(credentials) => {
                if client
                    .resume(&credentials, cancel)
                    .map_err(SessionError::remote)?
                {
                    return Ok(AuthOutcome::Resumed);
                }
                tracing::warn!(namespace = namespace.name(), "stored session rejected, logging in again");
            }
            Err(e) => {
                tracing::warn!(
                    namespace = namespace.name(),
                    error = %e,
                    "stored session is unreadable, logging in again"
                );
            }
        }
    }

    let credentials = login.login(client, cancel).map_err(SessionError::remote)?;
    // Nothing is written once the context fired.
    cancel.check()?;
    let bytes = credentials
        .to_bytes()
        .map_err(|e| SessionError::Auth(AuthError::Encode(e)))?;
    namespace
        .set(SESSION_KEY, &bytes)
        .map_err(SessionError::storage)?;
    Ok(AuthOutcome::LoggedIn)
}
