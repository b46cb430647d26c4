use crate::error::{Error, ZkError};
use crate::types::{CreateMode, Stat, Watch};
use crate::SessionConfig;
use async_trait::async_trait;
use futures::channel::oneshot;
use std::borrow::Cow;

/// A request handed down to the protocol driver. Paths here are server-side:
/// the session wrapper has already applied its chroot prefix.
#[derive(Debug)]
pub enum Request {
    Create {
        path: String,
        data: Cow<'static, [u8]>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    SetData {
        path: String,
        data: Cow<'static, [u8]>,
        version: i32,
    },
    Exists {
        path: String,
        watch: Watch,
    },
    GetData {
        path: String,
        watch: Watch,
    },
    GetChildren {
        path: String,
        watch: Watch,
    },
    Multi(Vec<Request>),
}

impl Request {
    /// Short operation name, for driver-side logging.
    pub fn op_name(&self) -> &'static str {
        match *self {
            Request::Create { .. } => "create",
            Request::Delete { .. } => "delete",
            Request::SetData { .. } => "set_data",
            Request::Exists { .. } => "exists",
            Request::GetData { .. } => "get_data",
            Request::GetChildren { .. } => "get_children",
            Request::Multi(..) => "multi",
        }
    }
}

/// A successful response delivered by the protocol driver.
#[derive(Debug)]
pub enum Response {
    /// The final path of a created znode, sequence suffix included.
    String(String),
    /// The empty response to a delete.
    Empty,
    /// The `Stat` answering an exists or set.
    Stat(Stat),
    /// The contents and `Stat` answering a get.
    GetData {
        bytes: Vec<u8>,
        stat: Stat,
    },
    /// The child names answering a get-children.
    Strings(Vec<String>),
    /// Positional outcomes of a multi batch. For an aborted batch every
    /// entry is an `Err`: `Ok` for operations that were rolled back, the
    /// real code for the operation that failed, and `RuntimeInconsistency`
    /// for operations that were skipped.
    Multi(Vec<Result<Response, ZkError>>),
}

/// The lower-level protocol driver a session wrapper runs on.
///
/// The driver owns everything wire-shaped: the TCP session to the ensemble,
/// request serialization, response parsing, heartbeats and reconnects. The
/// session layer only relies on the contract below.
///
/// # Contract
///
/// - [`submit`](ZooKeeperDriver::submit) is a non-blocking enqueue. The
///   completion sender is fired exactly once with the outcome, or dropped
///   unfired when the driver dies or the session expires; it is never fired
///   twice. Within one session, requests are answered in submission order.
/// - Read requests carry a [`Watch`] slot. The driver arms the watch only
///   when the operation succeeds — except an `Exists` answered with
///   [`ZkError::NoNode`], which still arms it so the watch can observe the
///   node's creation. An unarmed slot's sender is dropped.
/// - A watch fires at most once, with the event that consumed it. When the
///   session ends, armed watches are silently dropped; no event is
///   delivered for that.
/// - Once [`is_expired`](ZooKeeperDriver::is_expired) reports true, every
///   further submission must be answered with [`ZkError::SessionExpired`]
///   (or its completion dropped).
/// - Dropping the driver closes the session, releasing its ephemeral nodes
///   on the server.
#[async_trait]
pub trait ZooKeeperDriver: Send + Sync + Sized + 'static {
    /// Open a fresh session to the ensemble described by `config`,
    /// authenticating with its identity when one is set.
    async fn connect(config: &SessionConfig, log: slog::Logger) -> Result<Self, Error>;

    /// Enqueue `request`, to be answered through `completion`.
    fn submit(&self, request: Request, completion: oneshot::Sender<Result<Response, ZkError>>);

    /// The service-assigned identifier of this session.
    fn session_id(&self) -> i64;

    /// Non-blocking: whether the service has expired this session.
    fn is_expired(&self) -> bool;
}
