//! Session bootstrap against scripted clients.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tdl::session::{
    AuthOutcome, Client, ClientError, ClientFactory, Credentials, FloodWait, Login, Middleware,
    RateLimit, Request, Response, SessionError, SessionOptions, SESSION_KEY,
};
use tdl::storage::{Engine, StorageConfig};
use tdl::{Bootstrap, Cancellation, TdlError};
use tempfile::tempdir;

const AUTH_KEY: &[u8] = b"granted";

/// Accepts credentials whose auth key matches, echoes request methods.
struct ScriptedClient {
    accept: Vec<u8>,
}

impl Client for ScriptedClient {
    fn resume(&self, credentials: &Credentials, cancel: &Cancellation) -> Result<bool, ClientError> {
        cancel.check()?;
        Ok(credentials.auth_key == self.accept)
    }

    fn invoke(&self, request: &Request, cancel: &Cancellation) -> Result<Response, ClientError> {
        cancel.check()?;
        Ok(Response {
            body: request.method.as_bytes().to_vec(),
        })
    }
}

#[derive(Default)]
struct Factory {
    connects: AtomicU32,
    seen: Mutex<Vec<String>>,
}

impl ClientFactory for Factory {
    fn connect(
        &self,
        options: &SessionOptions,
        cancel: &Cancellation,
    ) -> Result<Arc<dyn Client>, ClientError> {
        cancel.check()?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push(options.namespace().name().to_string());
        Ok(Arc::new(ScriptedClient {
            accept: AUTH_KEY.to_vec(),
        }))
    }
}

struct FailingFactory;

impl ClientFactory for FailingFactory {
    fn connect(&self, _: &SessionOptions, _: &Cancellation) -> Result<Arc<dyn Client>, ClientError> {
        Err(ClientError::Transport("connection refused".into()))
    }
}

#[derive(Default)]
struct CountingLogin {
    calls: AtomicU32,
}

impl Login for CountingLogin {
    fn login(&self, _: &dyn Client, cancel: &Cancellation) -> Result<Credentials, ClientError> {
        cancel.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credentials::new(2, AUTH_KEY.to_vec(), Some(1001)))
    }
}

/// Waits for a code that never arrives, until cancelled.
struct BlockingLogin;

impl Login for BlockingLogin {
    fn login(&self, _: &dyn Client, cancel: &Cancellation) -> Result<Credentials, ClientError> {
        cancel.sleep(Duration::from_secs(60))?;
        Ok(Credentials::new(2, AUTH_KEY.to_vec(), None))
    }
}

fn sorted_engine(path: &std::path::Path, cancel: &Cancellation) -> Engine {
    Engine::create(&StorageConfig::sorted(path), cancel.clone()).unwrap()
}

#[test]
fn test_first_use_login_runs_once() {
    let dir = tempdir().unwrap();
    let factory = Factory::default();
    let login = CountingLogin::default();

    for expected in [AuthOutcome::LoggedIn, AuthOutcome::Resumed] {
        let cancel = Cancellation::new();
        let engine = sorted_engine(dir.path(), &cancel);
        let outcome = Bootstrap::new(&engine, &cancel)
            .run(&factory, &login, |session| -> Result<_, TdlError> {
                Ok(session.outcome())
            })
            .unwrap();
        assert_eq!(outcome, expected);
        engine.close().unwrap();
    }

    assert_eq!(login.calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cancellation_during_login_writes_nothing() {
    let dir = tempdir().unwrap();
    let cancel = Cancellation::new();
    let engine = sorted_engine(dir.path(), &cancel);

    let trigger = cancel.clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });

    let started = Instant::now();
    let err = Bootstrap::new(&engine, &cancel)
        .connect(&Factory::default(), &BlockingLogin)
        .unwrap_err();
    interrupter.join().unwrap();
    assert!(matches!(err, SessionError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    engine.close().unwrap();

    let engine = sorted_engine(dir.path(), &Cancellation::new());
    let stored = engine.open("default").unwrap().get(SESSION_KEY).unwrap();
    assert_eq!(stored, None);
}

#[test]
fn test_cancelled_before_start() {
    let cancel = Cancellation::new();
    let engine = Engine::create(&StorageConfig::Memory, cancel.clone()).unwrap();
    cancel.cancel();
    let login = CountingLogin::default();
    let err = Bootstrap::new(&engine, &cancel)
        .connect(&Factory::default(), &login)
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(login.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_rejected_credentials_trigger_login() {
    let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
    let ns = engine.open("default").unwrap();
    let stale = Credentials::new(4, b"revoked".to_vec(), Some(7));
    ns.set(SESSION_KEY, &stale.to_bytes().unwrap()).unwrap();

    let login = CountingLogin::default();
    let session = Bootstrap::new(&engine, engine.cancellation())
        .connect(&Factory::default(), &login)
        .unwrap();
    assert_eq!(session.outcome(), AuthOutcome::LoggedIn);
    assert_eq!(login.calls.load(Ordering::SeqCst), 1);

    let stored = Credentials::from_bytes(&ns.get(SESSION_KEY).unwrap().unwrap()).unwrap();
    assert_eq!(stored.auth_key, AUTH_KEY);
}

#[test]
fn test_unreadable_credentials_trigger_login() {
    let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
    engine
        .open("default")
        .unwrap()
        .set(SESSION_KEY, b"\x00garbage")
        .unwrap();
    let login = CountingLogin::default();
    let session = Bootstrap::new(&engine, engine.cancellation())
        .connect(&Factory::default(), &login)
        .unwrap();
    assert_eq!(session.outcome(), AuthOutcome::LoggedIn);
}

#[test]
fn test_namespaces_keep_separate_credentials() {
    let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
    let factory = Factory::default();
    let login = CountingLogin::default();

    for ns in ["alice", "bob", "alice"] {
        Bootstrap::new(&engine, engine.cancellation())
            .namespace(ns)
            .connect(&factory, &login)
            .unwrap();
    }
    assert_eq!(login.calls.load(Ordering::SeqCst), 2);
    assert_eq!(*factory.seen.lock().unwrap(), vec!["alice", "bob", "alice"]);
}

#[test]
fn test_errors_are_tagged_by_step() {
    let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
    let login = CountingLogin::default();

    let err = Bootstrap::new(&engine, engine.cancellation())
        .connect(&FailingFactory, &login)
        .unwrap_err();
    assert!(matches!(err, SessionError::Client(ClientError::Transport(_))));
    assert!(err.is_retryable());

    let err = Bootstrap::new(&engine, engine.cancellation())
        .namespace("no/slashes")
        .connect(&Factory::default(), &login)
        .unwrap_err();
    assert!(matches!(err, SessionError::Config(_)));

    engine.close().unwrap();
    let err = Bootstrap::new(&engine, engine.cancellation())
        .connect(&Factory::default(), &login)
        .unwrap_err();
    assert!(matches!(err, SessionError::Open { .. }));
}

#[derive(Debug, PartialEq)]
enum TaskError {
    Session(String),
    Business(&'static str),
}

impl From<SessionError> for TaskError {
    fn from(e: SessionError) -> Self {
        Self::Session(e.to_string())
    }
}

#[test]
fn test_task_error_is_returned_unchanged() {
    let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
    let result: Result<(), TaskError> = Bootstrap::new(&engine, engine.cancellation()).run(
        &Factory::default(),
        &CountingLogin::default(),
        |_| Err(TaskError::Business("quota exceeded")),
    );
    assert_eq!(result, Err(TaskError::Business("quota exceeded")));

    let result: Result<(), TaskError> = Bootstrap::new(&engine, engine.cancellation()).run(
        &FailingFactory,
        &CountingLogin::default(),
        |_| Ok(()),
    );
    assert!(matches!(result, Err(TaskError::Session(_))));
}

/// Records the order in which wrappers see a request.
struct Trace {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

struct Traced {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    next: Arc<dyn Client>,
}

impl Middleware for Trace {
    fn name(&self) -> &'static str {
        self.tag
    }

    fn wrap(&self, next: Arc<dyn Client>) -> Arc<dyn Client> {
        Arc::new(Traced {
            tag: self.tag,
            log: Arc::clone(&self.log),
            next,
        })
    }
}

impl Client for Traced {
    fn resume(&self, c: &Credentials, cancel: &Cancellation) -> Result<bool, ClientError> {
        self.next.resume(c, cancel)
    }

    fn invoke(&self, request: &Request, cancel: &Cancellation) -> Result<Response, ClientError> {
        self.log.lock().unwrap().push(self.tag);
        self.next.invoke(request, cancel)
    }
}

#[test]
fn test_middlewares_apply_outermost_first() {
    let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let reply = Bootstrap::new(&engine, engine.cancellation())
        .middleware(Trace {
            tag: "outer",
            log: Arc::clone(&log),
        })
        .middleware(RateLimit::default())
        .middleware(FloodWait::default())
        .middleware(Trace {
            tag: "inner",
            log: Arc::clone(&log),
        })
        .run(&Factory::default(), &CountingLogin::default(), |session| {
            let names: Vec<_> = session.options().middlewares().iter().map(|m| m.name()).collect();
            assert_eq!(names, vec!["outer", "rate_limit", "flood_wait", "inner"]);
            session
                .client()
                .invoke(&Request::new("messages.send", Vec::new()), engine.cancellation())
                .map_err(|e| TdlError::from(SessionError::Client(e)))
        })
        .unwrap();

    assert_eq!(reply.body, b"messages.send");
    assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
}
