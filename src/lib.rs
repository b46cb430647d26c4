//! A high-level session layer for ZooKeeper-style coordination services.
//!
//! This crate wraps a low-level protocol driver (anything implementing
//! [`ZooKeeperDriver`]) in the session-handling policy an application
//! actually wants: translation of service result codes into typed outcomes,
//! automatic retries for reads interrupted by transient transport failures,
//! chroot-scoped paths, RAII management of ephemeral nodes, one-shot watch
//! notifications, and a future-based interface for pipelining operations.
//!
//! # Errors vs. outcomes
//!
//! Every operation comes in a *throwing* and a *non-throwing* form. The
//! throwing form (`create`, `remove`, `set`, ...) treats any non-`Ok` answer
//! as a failure and returns `Err`. The non-throwing form (`try_create`,
//! `try_remove`, `try_set`, ...) splits the answer in two: result codes that
//! are ordinary outcomes of the operation — the node already exists for a
//! `create`, the version did not match for a `set` — are handed back as data
//! in an inner `Result`, and only codes outside that documented set are
//! raised. So `try_create` returns
//! `Result<Result<String, error::Create>, Error>`: the outer `Result` is
//! "could the operation be carried out at all", the inner one is the
//! operation's own verdict. Readers (`try_get`, `exists`, ...) fold an
//! absent node into `None` instead.
//!
//! The per-operation sets of swallowed codes are fixed tables in [`error`];
//! nothing outside them is ever silently converted into an outcome. In
//! particular a session expiry is always a raised failure, and it latches:
//! once a session has reported [`ZkError::SessionExpired`], every further
//! operation on it fails the same way. Recover by building a fresh session
//! with [`ZooKeeper::start_new_session`].
//!
//! # Reads retry, mutations do not
//!
//! Read-only operations interrupted by a *recoverable* code (connection
//! loss, operation timeout) are resubmitted, up to
//! [`DEFAULT_RETRY_COUNT`] attempts in total. Mutations are never
//! resubmitted: a `create` interrupted by connection loss may or may not
//! have been applied, and hiding that would turn an observable failure into
//! silent double-application.
//!
//! # Example
//!
//! ```no_run
//! use tokio_zkutil::testing::InMemoryDriver;
//! use tokio_zkutil::{CreateMode, Error, ZooKeeper};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let zk = ZooKeeper::<InMemoryDriver>::connect("zk-demo").await?;
//!
//!     zk.create_ancestors("/app/workers/member").await?;
//!     let me = zk
//!         .create(
//!             "/app/workers/member",
//!             &b"ready"[..],
//!             CreateMode::EphemeralSequential,
//!         )
//!         .await?;
//!     let (data, stat) = zk.get(&me).await?;
//!     assert_eq!(data, b"ready");
//!     assert_eq!(stat.version, 0);
//!     Ok(())
//! }
//! ```

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use slog::{debug, info, o};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod driver;
mod ephemeral;
pub mod error;
mod future;
pub mod metrics;
pub mod testing;
mod transform;
mod types;

pub use crate::driver::{Request, Response, ZooKeeperDriver};
pub use crate::ephemeral::EphemeralNode;
pub use crate::error::{Error, ZkError};
pub use crate::future::OpFuture;
pub use crate::types::{
    CreateMode, MultiOutcome, MultiResponse, Op, Stat, Watch, WatchSignal, WatchType,
    WatchedEvent, WatchedEventType,
};

use crate::metrics::{Metrics, NoMetrics};
use crate::transform::OpMarker;

/// Session timeout used when the builder is not given one.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Read attempts a session makes before a recoverable failure is raised.
pub const DEFAULT_RETRY_COUNT: usize = 3;

/// Preferred number of operations per batch for the recursive removal
/// helpers. Explicit larger batches are submitted as given.
pub const MULTI_BATCH_SIZE: usize = 100;

pub(crate) mod paths {
    use crate::error::Error;

    /// Checks a client-supplied path: absolute, no trailing slash except for
    /// the root itself, no empty segments.
    pub(crate) fn validate(path: &str) -> Result<(), Error> {
        if path.is_empty() {
            return Err(bad(path, "path is empty"));
        }
        if !path.starts_with('/') {
            return Err(bad(path, "path must start with '/'"));
        }
        if path.len() > 1 && path.ends_with('/') {
            return Err(bad(path, "path must not end with '/'"));
        }
        if path.contains("//") {
            return Err(bad(path, "path contains an empty segment"));
        }
        Ok(())
    }

    fn bad(path: &str, reason: &'static str) -> Error {
        Error::BadPath {
            path: path.to_string(),
            reason,
        }
    }

    /// Prefixes `path` with the session chroot. The client root names the
    /// chroot node itself.
    pub(crate) fn join_chroot(chroot: &str, path: &str) -> String {
        if path == "/" {
            chroot.to_string()
        } else {
            format!("{}{}", chroot, path)
        }
    }

    /// Undoes [`join_chroot`] on a server-side path, for delivering created
    /// paths and watch events in client form.
    pub(crate) fn strip_chroot(chroot: &str, path: &str) -> String {
        match path.strip_prefix(chroot) {
            Some("") => "/".to_string(),
            Some(rest) => rest.to_string(),
            None => path.to_string(),
        }
    }

    /// The child of `parent` named `name`.
    pub(crate) fn join(parent: &str, name: &str) -> String {
        if parent == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent, name)
        }
    }

    /// Proper ancestors of `path` below the root, nearest the root first.
    /// The path itself and the root are not included.
    pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
        path.match_indices('/').skip(1).map(move |(at, _)| &path[..at])
    }
}

/// The parameters a session was established with.
///
/// Drivers read what they need from this at connect time; the session
/// wrapper keeps a copy so that [`ZooKeeper::start_new_session`] can dial
/// the same ensemble again. Built and validated by [`ZooKeeperBuilder`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    hosts: String,
    session_timeout: Duration,
    chroot: Option<String>,
    identity: Option<(String, String)>,
    read_retries: usize,
}

impl SessionConfig {
    /// The ensemble connection string, as given to the builder.
    pub fn hosts(&self) -> &str {
        &self.hosts
    }

    /// The session timeout to negotiate with the service.
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// The subtree every path of this session is interpreted under.
    pub fn chroot(&self) -> Option<&str> {
        self.chroot.as_deref()
    }

    /// Authentication as `(scheme, credential)`, if configured.
    pub fn identity(&self) -> Option<(&str, &str)> {
        self.identity
            .as_ref()
            .map(|(scheme, credential)| (scheme.as_str(), credential.as_str()))
    }

    /// Total attempts a read gets before a recoverable failure is raised.
    pub fn read_retries(&self) -> usize {
        self.read_retries
    }
}

/// Builder for a [`ZooKeeper`] session.
pub struct ZooKeeperBuilder {
    hosts: String,
    session_timeout: Duration,
    chroot: Option<String>,
    identity: Option<(String, String)>,
    read_retries: usize,
    logger: slog::Logger,
    metrics: Arc<dyn Metrics>,
}

impl ZooKeeperBuilder {
    /// Starts a builder for a session to the given ensemble. `hosts` is
    /// passed to the driver untouched; its format is the driver's business.
    pub fn new(hosts: &str) -> Self {
        ZooKeeperBuilder {
            hosts: hosts.to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            chroot: None,
            identity: None,
            read_retries: DEFAULT_RETRY_COUNT,
            logger: slog::Logger::root(slog::Discard, o!()),
            metrics: Arc::new(NoMetrics),
        }
    }

    /// Sets the session timeout to negotiate. Defaults to
    /// [`DEFAULT_SESSION_TIMEOUT`].
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Scopes every path of the session under the given subtree. Created
    /// paths and watch events are translated back to client form, so the
    /// chroot never shows through.
    pub fn chroot(mut self, chroot: &str) -> Self {
        self.chroot = Some(chroot.to_string());
        self
    }

    /// Authenticates the session with the given scheme and credential.
    pub fn identity(mut self, scheme: &str, credential: &str) -> Self {
        self.identity = Some((scheme.to_string(), credential.to_string()));
        self
    }

    /// Sets the total number of attempts a read gets when interrupted by
    /// recoverable failures. Defaults to [`DEFAULT_RETRY_COUNT`]; values
    /// below 1 are treated as 1.
    pub fn read_retries(mut self, attempts: usize) -> Self {
        self.read_retries = attempts;
        self
    }

    /// Sets the logger the session and its driver log through. Defaults to
    /// discarding everything.
    pub fn logger(mut self, logger: slog::Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Sets the sink session events are counted into. Defaults to
    /// [`NoMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validates the configuration and opens a session through `D`.
    pub async fn connect<D: ZooKeeperDriver>(self) -> Result<ZooKeeper<D>, Error> {
        let config = self.validate()?;
        let driver = D::connect(&config, self.logger.clone()).await?;
        info!(self.logger, "coordination session established";
            "session_id" => driver.session_id(),
        );
        Ok(ZooKeeper(Arc::new(Inner {
            driver,
            config,
            expired: Arc::new(AtomicBool::new(false)),
            logger: self.logger,
            metrics: self.metrics,
        })))
    }

    fn validate(&self) -> Result<SessionConfig, Error> {
        if self.hosts.is_empty() {
            return Err(config_error("no ensemble hosts given".to_string()));
        }
        if self.session_timeout.is_zero() {
            return Err(config_error("session timeout must be positive".to_string()));
        }
        if let Some(ref chroot) = self.chroot {
            paths::validate(chroot)
                .map_err(|err| config_error(format!("chroot rejected: {}", err)))?;
            if chroot == "/" {
                return Err(config_error(
                    "chroot must name a subtree, not the root".to_string(),
                ));
            }
        }
        if let Some((ref scheme, ref credential)) = self.identity {
            if scheme.is_empty() || scheme.contains(':') {
                return Err(config_error(format!(
                    "identity scheme {:?} is not a plain scheme name",
                    scheme
                )));
            }
            if credential.is_empty() {
                return Err(config_error("identity credential is empty".to_string()));
            }
        }
        Ok(SessionConfig {
            hosts: self.hosts.clone(),
            session_timeout: self.session_timeout,
            chroot: self.chroot.clone(),
            identity: self.identity.clone(),
            read_retries: self.read_retries.max(1),
        })
    }
}

fn config_error(reason: String) -> Error {
    Error::Config { reason }
}

struct Inner<D> {
    driver: D,
    config: SessionConfig,
    /// Set once any operation observes `SessionExpired`; checked before
    /// every submission.
    expired: Arc<AtomicBool>,
    logger: slog::Logger,
    metrics: Arc<dyn Metrics>,
}

/// A session to a coordination service, generic over the protocol driver it
/// runs on.
///
/// Cheap to clone; clones share the session. All operations take `&self`
/// and may be issued concurrently. Dropping the last clone closes the
/// session, which releases its ephemeral nodes on the server.
pub struct ZooKeeper<D: ZooKeeperDriver>(Arc<Inner<D>>);

impl<D: ZooKeeperDriver> Clone for ZooKeeper<D> {
    fn clone(&self) -> Self {
        ZooKeeper(Arc::clone(&self.0))
    }
}

fn note_expiry(latch: &AtomicBool, res: &Result<Response, ZkError>) {
    if let Err(ZkError::SessionExpired) = *res {
        latch.store(true, Ordering::SeqCst);
    }
}

fn doomed<T: Send + 'static>(err: Error) -> OpFuture<Result<T, Error>> {
    let (tx, rx) = oneshot::channel();
    drop(tx);
    OpFuture::new(rx, ZkError::SessionExpired, move |_| Err(err))
}

/// Batch responses carry created paths in server form; nothing else in
/// them is path-shaped, so translating a batch back to client form only
/// touches the `Create` entries.
fn strip_created_paths(chroot: &str, responses: &mut [MultiResponse]) {
    for response in responses.iter_mut() {
        if let MultiResponse::Create(ref mut path) = *response {
            *path = paths::strip_chroot(chroot, path);
        }
    }
}

fn strip_created_outcome(chroot: &str, outcome: &mut MultiOutcome) {
    for result in &mut outcome.results {
        if let Ok(MultiResponse::Create(ref mut path)) = *result {
            *path = paths::strip_chroot(chroot, path);
        }
    }
}

/// The code a batch the client refused to submit reports in its outcome.
fn client_side_code(err: &Error) -> ZkError {
    match *err {
        Error::BadPath { .. } | Error::Config { .. } => ZkError::BadArguments,
        Error::Protocol { .. } => ZkError::MarshallingError,
        ref other => other.code().unwrap_or(ZkError::SystemError),
    }
}

impl<D: ZooKeeperDriver> ZooKeeper<D> {
    /// Connects with default settings; see [`ZooKeeperBuilder`] for the
    /// knobs.
    pub async fn connect(hosts: &str) -> Result<ZooKeeper<D>, Error> {
        ZooKeeperBuilder::new(hosts).connect().await
    }

    /// Starts a builder for a session to the given ensemble.
    pub fn builder(hosts: &str) -> ZooKeeperBuilder {
        ZooKeeperBuilder::new(hosts)
    }

    /// The configuration this session was established with.
    pub fn config(&self) -> &SessionConfig {
        &self.0.config
    }

    /// The service-assigned identifier of this session.
    pub fn session_id(&self) -> i64 {
        self.0.driver.session_id()
    }

    /// Non-blocking: whether this session is expired. Once true, every
    /// operation on this handle fails with [`ZkError::SessionExpired`].
    pub fn expired(&self) -> bool {
        if self.0.expired.load(Ordering::SeqCst) {
            return true;
        }
        if self.0.driver.is_expired() {
            self.0.expired.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Opens a fresh session with this session's configuration. The current
    /// handle is left untouched; holders and watches tied to it stay tied
    /// to it.
    pub async fn start_new_session(&self) -> Result<ZooKeeper<D>, Error> {
        let driver = D::connect(&self.0.config, self.0.logger.clone()).await?;
        info!(self.0.logger, "replacement session established";
            "session_id" => driver.session_id(),
        );
        Ok(ZooKeeper(Arc::new(Inner {
            driver,
            config: self.0.config.clone(),
            expired: Arc::new(AtomicBool::new(false)),
            logger: self.0.logger.clone(),
            metrics: Arc::clone(&self.0.metrics),
        })))
    }

    pub(crate) fn log(&self) -> &slog::Logger {
        &self.0.logger
    }

    pub(crate) fn metrics(&self) -> Arc<dyn Metrics> {
        Arc::clone(&self.0.metrics)
    }

    pub(crate) fn server_path(&self, path: &str) -> Result<String, Error> {
        paths::validate(path)?;
        Ok(match self.0.config.chroot {
            Some(ref chroot) => paths::join_chroot(chroot, path),
            None => path.to_string(),
        })
    }

    fn client_path(&self, server: &str) -> String {
        match self.0.config.chroot {
            Some(ref chroot) => paths::strip_chroot(chroot, server),
            None => server.to_string(),
        }
    }

    fn chroot(&self) -> Option<String> {
        self.0.config.chroot.clone()
    }

    fn check_expired(&self, op: &'static str, path: &str) -> Result<(), Error> {
        if self.expired() {
            return Err(Error::keeper(op, path, ZkError::SessionExpired));
        }
        Ok(())
    }

    /// One submission, one completion. A dropped completion slot means the
    /// driver died underneath us and is reported as connection loss.
    async fn submit(
        &self,
        op: &'static str,
        path: &str,
        request: Request,
    ) -> Result<Result<Response, ZkError>, Error> {
        self.check_expired(op, path)?;
        let (tx, rx) = oneshot::channel();
        self.0.driver.submit(request, tx);
        let res = match rx.await {
            Ok(res) => res,
            Err(oneshot::Canceled) => Err(ZkError::ConnectionLoss),
        };
        note_expiry(&self.0.expired, &res);
        Ok(res)
    }

    /// Submission loop for read-only operations: recoverable failures are
    /// resubmitted until the attempt budget runs out. `make` rebuilds the
    /// request each attempt, so watch slots are re-armed fresh.
    async fn submit_read<F>(
        &self,
        op: &'static str,
        path: &str,
        mut make: F,
    ) -> Result<Result<Response, ZkError>, Error>
    where
        F: FnMut() -> Request,
    {
        let limit = self.0.config.read_retries;
        let mut attempt = 1;
        loop {
            let res = self.submit(op, path, make()).await?;
            match res {
                Err(code) if code.is_recoverable() && attempt < limit => {
                    debug!(self.0.logger, "retrying read after recoverable failure";
                        "op" => op,
                        "path" => path,
                        "code" => %code,
                        "attempt" => attempt,
                    );
                    attempt += 1;
                }
                res => return Ok(res),
            }
        }
    }

    pub(crate) fn submit_background(
        &self,
        request: Request,
    ) -> oneshot::Receiver<Result<Response, ZkError>> {
        let (tx, rx) = oneshot::channel();
        if !self.expired() {
            self.0.driver.submit(request, tx);
        }
        rx
    }

    /// Creates a node at `path` with the given contents, returning the path
    /// actually created — for the sequential modes that includes the
    /// service-assigned ten-digit suffix.
    ///
    /// Fails with [`ZkError::NodeExists`] when the node is already there,
    /// [`ZkError::NoNode`] when its parent is missing, and
    /// [`ZkError::NoChildrenForEphemerals`] when the parent is ephemeral.
    /// [`try_create`](ZooKeeper::try_create) reports those three as
    /// outcomes instead.
    pub async fn create<Data>(
        &self,
        path: &str,
        data: Data,
        mode: CreateMode,
    ) -> Result<String, Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        match self.try_create(path, data, mode).await? {
            Ok(created) => Ok(created),
            Err(err) => Err(Error::keeper("create", path, err.code())),
        }
    }

    /// Non-throwing [`create`](ZooKeeper::create).
    pub async fn try_create<Data>(
        &self,
        path: &str,
        data: Data,
        mode: CreateMode,
    ) -> Result<Result<String, error::Create>, Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        let server = self.server_path(path)?;
        let res = self
            .submit(
                "create",
                path,
                Request::Create {
                    path: server,
                    data: data.into(),
                    mode,
                },
            )
            .await?;
        Ok(transform::create(path, res)?.map(|created| self.client_path(&created)))
    }

    /// Creates a persistent node unless it already exists. A missing parent
    /// is still a failure; see
    /// [`create_ancestors`](ZooKeeper::create_ancestors) for that.
    pub async fn create_if_not_exists<Data>(&self, path: &str, data: Data) -> Result<(), Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        match self.try_create(path, data, CreateMode::Persistent).await? {
            Ok(_) | Err(error::Create::NodeExists) => Ok(()),
            Err(err) => Err(Error::keeper("create", path, err.code())),
        }
    }

    /// Creates every missing ancestor of `path` as an empty persistent
    /// node, nearest the root first. The node at `path` itself is *not*
    /// created. Idempotent: ancestors that already exist are left alone.
    pub async fn create_ancestors(&self, path: &str) -> Result<(), Error> {
        paths::validate(path)?;
        for ancestor in paths::ancestors(path) {
            self.create_if_not_exists(ancestor, &b""[..]).await?;
        }
        Ok(())
    }

    /// Overwrites the node at `path`, creating it with the given mode when
    /// it does not exist.
    ///
    /// The two steps are not atomic. Under a concurrent delete the create
    /// may race and fail with [`ZkError::NodeExists`] or leave either
    /// outcome behind; callers that need stronger guarantees should use a
    /// versioned [`set`](ZooKeeper::set) or a [`multi`](ZooKeeper::multi)
    /// batch.
    pub async fn create_or_update<Data>(
        &self,
        path: &str,
        data: Data,
        mode: CreateMode,
    ) -> Result<(), Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        let data = data.into();
        match self.try_set(path, data.clone(), -1).await? {
            Ok(_) => Ok(()),
            Err(error::SetData::NoNode) => {
                self.create(path, data, mode).await?;
                Ok(())
            }
            Err(err) => Err(Error::keeper("set", path, err.code())),
        }
    }

    /// Removes the node at `path` iff its version matches; `-1` matches any
    /// version. Fails when the node is absent, the version differs, or it
    /// still has children; [`try_remove`](ZooKeeper::try_remove) reports
    /// those as outcomes instead.
    pub async fn remove(&self, path: &str, version: i32) -> Result<(), Error> {
        match self.try_remove(path, version).await? {
            Ok(()) => Ok(()),
            Err(err) => Err(Error::keeper("remove", path, err.code())),
        }
    }

    /// Non-throwing [`remove`](ZooKeeper::remove).
    pub async fn try_remove(
        &self,
        path: &str,
        version: i32,
    ) -> Result<Result<(), error::Delete>, Error> {
        let server = self.server_path(path)?;
        let res = self
            .submit(
                "remove",
                path,
                Request::Delete {
                    path: server,
                    version,
                },
            )
            .await?;
        transform::delete(path, version, res)
    }

    /// The node's `Stat` if it exists, `None` otherwise. Absence is an
    /// answer, not a failure, so there is no try- variant.
    pub async fn exists(&self, path: &str) -> Result<Option<Stat>, Error> {
        let server = self.server_path(path)?;
        let res = self
            .submit_read("exists", path, || Request::Exists {
                path: server.clone(),
                watch: Watch::None,
            })
            .await?;
        transform::exists(path, res)
    }

    /// Like [`exists`](ZooKeeper::exists), additionally arming a one-shot
    /// watch on the path. The watch is armed even when the node does not
    /// exist, so the signal can report its creation.
    pub async fn exists_watch(&self, path: &str) -> Result<(Option<Stat>, WatchSignal), Error> {
        let server = self.server_path(path)?;
        let mut slot = None;
        let res = self
            .submit_read("exists", path, || {
                let (tx, rx) = oneshot::channel();
                slot = Some(rx);
                Request::Exists {
                    path: server.clone(),
                    watch: Watch::Custom(tx),
                }
            })
            .await?;
        let stat = transform::exists(path, res)?;
        let rx = slot.take().expect("read was submitted at least once");
        Ok((stat, WatchSignal::new(rx, self.chroot())))
    }

    /// The node's contents and `Stat`. Fails with [`ZkError::NoNode`] when
    /// the node is absent; [`try_get`](ZooKeeper::try_get) folds that into
    /// `None` instead.
    pub async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), Error> {
        match self.try_get(path).await? {
            Some(found) => Ok(found),
            None => Err(Error::keeper("get", path, ZkError::NoNode)),
        }
    }

    /// Non-throwing [`get`](ZooKeeper::get): `None` when the node is
    /// absent.
    pub async fn try_get(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>, Error> {
        let server = self.server_path(path)?;
        let res = self
            .submit_read("get", path, || Request::GetData {
                path: server.clone(),
                watch: Watch::None,
            })
            .await?;
        transform::get_data(path, res)
    }

    /// Like [`get`](ZooKeeper::get), additionally arming a one-shot watch
    /// for changes to the node.
    pub async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, Stat, WatchSignal), Error> {
        match self.try_get_watch(path).await? {
            Some(found) => Ok(found),
            None => Err(Error::keeper("get", path, ZkError::NoNode)),
        }
    }

    /// Non-throwing [`get_watch`](ZooKeeper::get_watch). When the node is
    /// absent no watch is armed at all — which is exactly why waiting for
    /// a node to disappear reads rather than checks existence, so nothing
    /// stays armed once the node is gone.
    pub async fn try_get_watch(
        &self,
        path: &str,
    ) -> Result<Option<(Vec<u8>, Stat, WatchSignal)>, Error> {
        let server = self.server_path(path)?;
        let mut slot = None;
        let res = self
            .submit_read("get", path, || {
                let (tx, rx) = oneshot::channel();
                slot = Some(rx);
                Request::GetData {
                    path: server.clone(),
                    watch: Watch::Custom(tx),
                }
            })
            .await?;
        let rx = slot.take().expect("read was submitted at least once");
        let chroot = self.chroot();
        Ok(transform::get_data(path, res)?
            .map(|(bytes, stat)| (bytes, stat, WatchSignal::new(rx, chroot))))
    }

    /// Replaces the node's contents iff its version matches; `-1` matches
    /// any version. Returns the node's new `Stat`.
    pub async fn set<Data>(&self, path: &str, data: Data, version: i32) -> Result<Stat, Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        match self.try_set(path, data, version).await? {
            Ok(stat) => Ok(stat),
            Err(err) => Err(Error::keeper("set", path, err.code())),
        }
    }

    /// Non-throwing [`set`](ZooKeeper::set).
    pub async fn try_set<Data>(
        &self,
        path: &str,
        data: Data,
        version: i32,
    ) -> Result<Result<Stat, error::SetData>, Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        let server = self.server_path(path)?;
        let res = self
            .submit(
                "set",
                path,
                Request::SetData {
                    path: server,
                    data: data.into(),
                    version,
                },
            )
            .await?;
        transform::set_data(path, version, res)
    }

    /// The names of the node's immediate children, in no particular order.
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>, Error> {
        match self.try_get_children(path).await? {
            Some(children) => Ok(children),
            None => Err(Error::keeper("get_children", path, ZkError::NoNode)),
        }
    }

    /// Non-throwing [`get_children`](ZooKeeper::get_children): `None` when
    /// the node is absent.
    pub async fn try_get_children(&self, path: &str) -> Result<Option<Vec<String>>, Error> {
        let server = self.server_path(path)?;
        let res = self
            .submit_read("get_children", path, || Request::GetChildren {
                path: server.clone(),
                watch: Watch::None,
            })
            .await?;
        transform::get_children(path, res)
    }

    /// Like [`get_children`](ZooKeeper::get_children), additionally arming
    /// a one-shot watch for changes to the child set.
    pub async fn get_children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, WatchSignal), Error> {
        let server = self.server_path(path)?;
        let mut slot = None;
        let res = self
            .submit_read("get_children", path, || {
                let (tx, rx) = oneshot::channel();
                slot = Some(rx);
                Request::GetChildren {
                    path: server.clone(),
                    watch: Watch::Custom(tx),
                }
            })
            .await?;
        let rx = slot.take().expect("read was submitted at least once");
        match transform::get_children(path, res)? {
            Some(children) => Ok((children, WatchSignal::new(rx, self.chroot()))),
            None => Err(Error::keeper("get_children", path, ZkError::NoNode)),
        }
    }

    fn begin_multi(&self, ops: &[Op]) -> Result<(Vec<OpMarker>, Vec<Request>), Error> {
        if ops.len() > MULTI_BATCH_SIZE {
            debug!(self.0.logger, "batch exceeds the preferred size";
                "len" => ops.len(),
                "preferred" => MULTI_BATCH_SIZE,
            );
        }
        let mut markers = Vec::with_capacity(ops.len());
        let mut requests = Vec::with_capacity(ops.len());
        for op in ops {
            markers.push(OpMarker::from(op));
            requests.push(self.request_for(op)?);
        }
        Ok((markers, requests))
    }

    fn request_for(&self, op: &Op) -> Result<Request, Error> {
        let server = self.server_path(op.path())?;
        Ok(match *op {
            Op::Create { ref data, mode, .. } => Request::Create {
                path: server,
                data: data.clone(),
                mode,
            },
            Op::Remove { version, .. } => Request::Delete {
                path: server,
                version,
            },
            Op::Set {
                ref data, version, ..
            } => Request::SetData {
                path: server,
                data: data.clone(),
                version,
            },
            Op::Exists { .. } => Request::Exists {
                path: server,
                watch: Watch::None,
            },
            Op::Get { .. } => Request::GetData {
                path: server,
                watch: Watch::None,
            },
            Op::GetChildren { .. } => Request::GetChildren {
                path: server,
                watch: Watch::None,
            },
        })
    }

    /// Applies the batch atomically: either every operation takes effect,
    /// or none does. Responses are positional. Any failed constituent is
    /// raised as [`Error::Multi`] with its position.
    pub async fn multi(&self, ops: &[Op]) -> Result<Vec<MultiResponse>, Error> {
        let (markers, requests) = self.begin_multi(ops)?;
        self.check_expired("multi", ops.first().map_or("/", Op::path))?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let res = self
            .submit("multi", ops[0].path(), Request::Multi(requests))
            .await?;
        let mut responses = transform::multi_applied(&markers, res)?;
        if let Some(ref chroot) = self.0.config.chroot {
            strip_created_paths(chroot, &mut responses);
        }
        Ok(responses)
    }

    /// Non-throwing [`multi`](ZooKeeper::multi): a failed batch whose
    /// failing operation hit one of its ordinary outcomes (absent node,
    /// version mismatch, existing node, remaining children) comes back as a
    /// [`MultiOutcome`]; only codes outside those sets are raised.
    pub async fn try_multi(&self, ops: &[Op]) -> Result<MultiOutcome, Error> {
        let (markers, requests) = self.begin_multi(ops)?;
        self.check_expired("multi", ops.first().map_or("/", Op::path))?;
        if requests.is_empty() {
            return Ok(MultiOutcome {
                code: ZkError::Ok,
                failed_index: None,
                results: Vec::new(),
            });
        }
        let res = self
            .submit("multi", ops[0].path(), Request::Multi(requests))
            .await?;
        let mut outcome = transform::multi_outcome(&markers, res)?;
        if let Some(ref chroot) = self.0.config.chroot {
            strip_created_outcome(chroot, &mut outcome);
        }
        Ok(outcome)
    }

    /// Total [`multi`](ZooKeeper::multi): never raises. Whatever happens —
    /// a benign constituent failure, a transport failure, an expired
    /// session, even a malformed path — is expressed in the outcome's
    /// code. A batch the client refused to submit comes back with empty
    /// `results`.
    pub async fn try_multi_no_throw(&self, ops: &[Op]) -> MultiOutcome {
        self.async_try_multi(ops).await
    }

    /// Removes the node and everything below it. Children are removed
    /// depth-first, batched through [`multi`](ZooKeeper::multi) in
    /// [`MULTI_BATCH_SIZE`] chunks. Fails if the node is absent. Not safe
    /// under concurrent mutation of the subtree — a batch may then fail
    /// with [`ZkError::NoNode`] or [`ZkError::NotEmpty`]; see
    /// [`try_remove_recursive`](ZooKeeper::try_remove_recursive) for the
    /// tolerant form.
    pub async fn remove_recursive(&self, path: &str) -> Result<(), Error> {
        self.remove_children_recursive(path.to_string()).await?;
        self.remove(path, -1).await
    }

    fn remove_children_recursive(&self, path: String) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            let mut children = self.get_children(&path).await?;
            while !children.is_empty() {
                let mut ops = Vec::new();
                while ops.len() < MULTI_BATCH_SIZE {
                    let child = match children.pop() {
                        Some(child) => child,
                        None => break,
                    };
                    let child_path = paths::join(&path, &child);
                    self.remove_children_recursive(child_path.clone()).await?;
                    ops.push(Op::remove(&child_path, -1));
                }
                self.multi(&ops).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Best-effort recursive removal: tolerates the node or any descendant
    /// disappearing concurrently, and never fails over version conflicts or
    /// left-over children. Only unexpected codes are raised.
    pub async fn try_remove_recursive(&self, path: &str) -> Result<(), Error> {
        self.try_remove_children_recursive(path.to_string()).await?;
        self.try_remove(path, -1).await?;
        Ok(())
    }

    fn try_remove_children_recursive(&self, path: String) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            let mut children = match self.try_get_children(&path).await? {
                Some(children) => children,
                None => return Ok(()),
            };
            while !children.is_empty() {
                let mut ops = Vec::new();
                let mut batch = Vec::new();
                while ops.len() < MULTI_BATCH_SIZE {
                    let child = match children.pop() {
                        Some(child) => child,
                        None => break,
                    };
                    let child_path = paths::join(&path, &child);
                    self.try_remove_children_recursive(child_path.clone())
                        .await?;
                    ops.push(Op::remove(&child_path, -1));
                    batch.push(child_path);
                }
                // Removing in bulk is the fast path. When it fails, someone
                // is removing these children concurrently and we fall back
                // to picking them off one by one.
                if !self.try_multi(&ops).await?.ok() {
                    for child in &batch {
                        self.try_remove(child, -1).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Resolves once no node exists at `path`: immediately when it is
    /// already absent, otherwise after observing its deletion.
    pub async fn wait_for_disappear(&self, path: &str) -> Result<(), Error> {
        loop {
            match self.try_get_watch(path).await? {
                None => return Ok(()),
                Some((_, _, signal)) => {
                    // Any event means the node changed somehow; loop around
                    // and look again. A signal that resolves without firing
                    // means the session went away, which the next read
                    // reports properly.
                    signal.await;
                }
            }
        }
    }

    /// Reads a node, resolving the future eagerly submitted at call time.
    ///
    /// The `async_`-prefixed methods submit their request *before*
    /// returning, so several of them issued back to back are pipelined on
    /// the driver. The price is that dropping the returned future does not
    /// revoke anything. These forms never resubmit on recoverable
    /// failures.
    pub fn async_get(&self, path: &str) -> OpFuture<Result<(Vec<u8>, Stat), Error>> {
        let server = match self.begin("get", path) {
            Ok(server) => server,
            Err(err) => return doomed(err),
        };
        let (tx, rx) = oneshot::channel();
        self.0.driver.submit(
            Request::GetData {
                path: server,
                watch: Watch::None,
            },
            tx,
        );
        let latch = Arc::clone(&self.0.expired);
        let client = path.to_string();
        OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
            note_expiry(&latch, &res);
            match transform::get_data(&client, res)? {
                Some(found) => Ok(found),
                None => Err(Error::keeper("get", &client, ZkError::NoNode)),
            }
        })
    }

    /// Non-throwing [`async_get`](ZooKeeper::async_get).
    pub fn async_try_get(&self, path: &str) -> OpFuture<Result<Option<(Vec<u8>, Stat)>, Error>> {
        let server = match self.begin("get", path) {
            Ok(server) => server,
            Err(err) => return doomed(err),
        };
        let (tx, rx) = oneshot::channel();
        self.0.driver.submit(
            Request::GetData {
                path: server,
                watch: Watch::None,
            },
            tx,
        );
        let latch = Arc::clone(&self.0.expired);
        let client = path.to_string();
        OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
            note_expiry(&latch, &res);
            transform::get_data(&client, res)
        })
    }

    /// Eagerly-submitted [`exists`](ZooKeeper::exists).
    pub fn async_exists(&self, path: &str) -> OpFuture<Result<Option<Stat>, Error>> {
        let server = match self.begin("exists", path) {
            Ok(server) => server,
            Err(err) => return doomed(err),
        };
        let (tx, rx) = oneshot::channel();
        self.0.driver.submit(
            Request::Exists {
                path: server,
                watch: Watch::None,
            },
            tx,
        );
        let latch = Arc::clone(&self.0.expired);
        let client = path.to_string();
        OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
            note_expiry(&latch, &res);
            transform::exists(&client, res)
        })
    }

    /// Eagerly-submitted [`get_children`](ZooKeeper::get_children).
    pub fn async_get_children(&self, path: &str) -> OpFuture<Result<Vec<String>, Error>> {
        let server = match self.begin("get_children", path) {
            Ok(server) => server,
            Err(err) => return doomed(err),
        };
        let (tx, rx) = oneshot::channel();
        self.0.driver.submit(
            Request::GetChildren {
                path: server,
                watch: Watch::None,
            },
            tx,
        );
        let latch = Arc::clone(&self.0.expired);
        let client = path.to_string();
        OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
            note_expiry(&latch, &res);
            match transform::get_children(&client, res)? {
                Some(children) => Ok(children),
                None => Err(Error::keeper("get_children", &client, ZkError::NoNode)),
            }
        })
    }

    /// Eagerly-submitted [`remove`](ZooKeeper::remove).
    pub fn async_remove(&self, path: &str, version: i32) -> OpFuture<Result<(), Error>> {
        let server = match self.begin("remove", path) {
            Ok(server) => server,
            Err(err) => return doomed(err),
        };
        let (tx, rx) = oneshot::channel();
        self.0.driver.submit(
            Request::Delete {
                path: server,
                version,
            },
            tx,
        );
        let latch = Arc::clone(&self.0.expired);
        let client = path.to_string();
        OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
            note_expiry(&latch, &res);
            match transform::delete(&client, version, res)? {
                Ok(()) => Ok(()),
                Err(err) => Err(Error::keeper("remove", &client, err.code())),
            }
        })
    }

    /// Non-throwing [`async_remove`](ZooKeeper::async_remove).
    pub fn async_try_remove(
        &self,
        path: &str,
        version: i32,
    ) -> OpFuture<Result<Result<(), error::Delete>, Error>> {
        let server = match self.begin("remove", path) {
            Ok(server) => server,
            Err(err) => return doomed(err),
        };
        let (tx, rx) = oneshot::channel();
        self.0.driver.submit(
            Request::Delete {
                path: server,
                version,
            },
            tx,
        );
        let latch = Arc::clone(&self.0.expired);
        let client = path.to_string();
        OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
            note_expiry(&latch, &res);
            transform::delete(&client, version, res)
        })
    }

    /// Eagerly-submitted [`multi`](ZooKeeper::multi).
    pub fn async_multi(&self, ops: &[Op]) -> OpFuture<Result<Vec<MultiResponse>, Error>> {
        let (markers, requests) = match self
            .begin_multi(ops)
            .and_then(|built| self.check_expired("multi", ops.first().map_or("/", Op::path)).map(|()| built))
        {
            Ok(built) => built,
            Err(err) => return doomed(err),
        };
        let (tx, rx) = oneshot::channel();
        if requests.is_empty() {
            let _ = tx.send(Ok(Response::Multi(Vec::new())));
        } else {
            self.0.driver.submit(Request::Multi(requests), tx);
        }
        let latch = Arc::clone(&self.0.expired);
        let chroot = self.chroot();
        OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
            note_expiry(&latch, &res);
            let mut responses = transform::multi_applied(&markers, res)?;
            if let Some(ref chroot) = chroot {
                strip_created_paths(chroot, &mut responses);
            }
            Ok(responses)
        })
    }

    /// Eagerly-submitted total `multi`; see
    /// [`try_multi_no_throw`](ZooKeeper::try_multi_no_throw). The returned
    /// future resolves to the outcome and never to a raised failure.
    pub fn async_try_multi(&self, ops: &[Op]) -> OpFuture<MultiOutcome> {
        let built = self
            .begin_multi(ops)
            .and_then(|built| self.check_expired("multi", ops.first().map_or("/", Op::path)).map(|()| built));
        match built {
            Ok((markers, requests)) => {
                let (tx, rx) = oneshot::channel();
                if requests.is_empty() {
                    let _ = tx.send(Ok(Response::Multi(Vec::new())));
                } else {
                    self.0.driver.submit(Request::Multi(requests), tx);
                }
                let latch = Arc::clone(&self.0.expired);
                let chroot = self.chroot();
                OpFuture::new(rx, ZkError::ConnectionLoss, move |res| {
                    note_expiry(&latch, &res);
                    let mut outcome = transform::multi_outcome_total(&markers, res);
                    if let Some(ref chroot) = chroot {
                        strip_created_outcome(chroot, &mut outcome);
                    }
                    outcome
                })
            }
            Err(err) => {
                let (tx, rx) = oneshot::channel();
                drop(tx);
                let code = client_side_code(&err);
                OpFuture::new(rx, code, move |_| MultiOutcome {
                    code,
                    failed_index: None,
                    results: Vec::new(),
                })
            }
        }
    }

    fn begin(&self, op: &'static str, path: &str) -> Result<String, Error> {
        let server = self.server_path(path)?;
        self.check_expired(op, path)?;
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation_rejects_malformed_paths() {
        assert!(paths::validate("/").is_ok());
        assert!(paths::validate("/a").is_ok());
        assert!(paths::validate("/a/b-c_d").is_ok());
        for path in ["", "a", "a/b", "/a/", "//", "/a//b"] {
            let err = paths::validate(path).unwrap_err();
            assert!(
                matches!(err, Error::BadPath { .. }),
                "{:?} must be rejected",
                path
            );
        }
    }

    #[test]
    fn chroot_join_and_strip_are_inverse() {
        assert_eq!(paths::join_chroot("/app", "/"), "/app");
        assert_eq!(paths::join_chroot("/app", "/x/y"), "/app/x/y");
        assert_eq!(paths::strip_chroot("/app", "/app"), "/");
        assert_eq!(paths::strip_chroot("/app", "/app/x/y"), "/x/y");
    }

    #[test]
    fn ancestors_walk_from_the_root_and_skip_the_leaf() {
        let got: Vec<&str> = paths::ancestors("/a/b/c").collect();
        assert_eq!(got, vec!["/a", "/a/b"]);
        assert_eq!(paths::ancestors("/a").count(), 0);
        assert_eq!(paths::ancestors("/").count(), 0);
    }

    #[test]
    fn join_handles_the_root_parent() {
        assert_eq!(paths::join("/", "a"), "/a");
        assert_eq!(paths::join("/a", "b"), "/a/b");
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        let bad = [
            ZooKeeperBuilder::new(""),
            ZooKeeperBuilder::new("zk").session_timeout(Duration::ZERO),
            ZooKeeperBuilder::new("zk").chroot("app"),
            ZooKeeperBuilder::new("zk").chroot("/"),
            ZooKeeperBuilder::new("zk").chroot("/app/"),
            ZooKeeperBuilder::new("zk").identity("", "secret"),
            ZooKeeperBuilder::new("zk").identity("digest:extra", "secret"),
            ZooKeeperBuilder::new("zk").identity("digest", ""),
        ];
        for builder in bad {
            let err = builder.validate().unwrap_err();
            assert!(matches!(err, Error::Config { .. }), "got {:?}", err);
        }
    }

    #[test]
    fn builder_clamps_the_read_budget() {
        let config = ZooKeeperBuilder::new("zk")
            .read_retries(0)
            .validate()
            .unwrap();
        assert_eq!(config.read_retries(), 1);

        let config = ZooKeeperBuilder::new("zk")
            .chroot("/app")
            .identity("digest", "user:pw")
            .validate()
            .unwrap();
        assert_eq!(config.chroot(), Some("/app"));
        assert_eq!(config.identity(), Some(("digest", "user:pw")));
        assert_eq!(config.read_retries(), DEFAULT_RETRY_COUNT);
    }
}
