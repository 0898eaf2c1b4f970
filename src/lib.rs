//! # tdl - session storage and bootstrap core
//!
//! tdl keeps per-account session state for a messaging platform client
//! across invocations. This crate is the part that sits under every
//! command:
//!
//! - **Storage**: one driver per process (`legacy`, `sorted` or `memory`)
//!   behind an [`Engine`] that hands out isolated namespaces
//! - **Migration**: one-shot, fail-closed transfer from the legacy default
//!   store to the sorted store, plus explicit backup/recover/copy
//! - **Session bootstrap**: namespace + options → authenticated client,
//!   with composable middlewares and login-once semantics
//! - **Shell**: logging, startup migration, engine creation and guaranteed
//!   teardown around a command body
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tdl::{Cancellation, Shell, ShellSettings};
//!
//! let shell = Shell::start(ShellSettings::new("/tmp/tdl"), Cancellation::new())?;
//! shell.run(|ctx| {
//!     let ns = ctx.engine.open("default")?;
//!     ns.set("app", b"desktop")?;
//!     Ok(())
//! })?;
//! # Ok::<(), tdl::TdlError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod session;
pub mod shell;
pub mod storage;

pub use cancel::{Cancellation, Cancelled};
pub use error::{TdlError, TdlResult};
pub use migrate::MigrationOutcome;
pub use session::{
    Bootstrap, Client, ClientError, ClientFactory, Credentials, Login, Middleware, Session,
    SessionConfig, SessionError,
};
pub use shell::{Context, Shell, ShellSettings};
pub use storage::{DriverKind, Engine, NamespaceHandle, Snapshot, StorageConfig, StorageError};
