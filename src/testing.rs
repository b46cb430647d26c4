//! An in-process stand-in for a real ensemble.
//!
//! [`InMemoryDriver`] implements [`ZooKeeperDriver`] against a named,
//! process-local namespace, so session-layer behavior can be exercised
//! deterministically: no network, no timing, and a control surface for the
//! failure modes that are hard to provoke on a real service (transient
//! transport faults, session expiry).
//!
//! Ensembles are named: every session whose host string is the same name
//! lands on the same tree, which is what lets
//! [`ZooKeeper::start_new_session`](crate::ZooKeeper::start_new_session)
//! observe state left behind by its predecessor. Tests should use a name
//! unique to the test to stay isolated.

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use once_cell::sync::Lazy;
use slog::{debug, info, trace};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::{Request, Response, ZooKeeperDriver};
use crate::error::{Error, ZkError};
use crate::types::{CreateMode, Stat, Watch, WatchType, WatchedEvent, WatchedEventType};
use crate::SessionConfig;

static ENSEMBLES: Lazy<Mutex<HashMap<String, Arc<ClusterState>>>> =
    Lazy::new(Default::default);

type Completion = oneshot::Sender<Result<Response, ZkError>>;
type Firing = (oneshot::Sender<WatchedEvent>, WatchedEvent);

/// A node of the in-memory tree. Stamps are logical: the ensemble has no
/// wall clock, so `ctime`/`mtime` carry the zxid of the change.
#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    czxid: i64,
    mzxid: i64,
    pzxid: i64,
    ctime: i64,
    mtime: i64,
    /// Session that owns this node, `0` for persistent nodes.
    ephemeral_owner: i64,
}

struct Session {
    expired: bool,
}

struct Watcher {
    session: i64,
    kind: WatchType,
    tx: oneshot::Sender<WatchedEvent>,
}

/// A watch-relevant change, recorded while mutating and resolved against
/// the watcher table once the mutation is committed.
struct Pending {
    path: String,
    event: WatchedEventType,
}

struct ClusterInner {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    sessions: HashMap<i64, Session>,
    watchers: HashMap<String, Vec<Watcher>>,
    faults: VecDeque<ZkError>,
}

struct ClusterState {
    inner: Mutex<ClusterInner>,
    next_session: AtomicI64,
}

impl ClusterState {
    fn named(name: &str) -> Arc<ClusterState> {
        let mut ensembles = ENSEMBLES.lock().unwrap();
        Arc::clone(ensembles.entry(name.to_string()).or_insert_with(|| {
            let mut nodes = BTreeMap::new();
            nodes.insert(
                "/".to_string(),
                Node {
                    data: Vec::new(),
                    version: 0,
                    cversion: 0,
                    czxid: 0,
                    mzxid: 0,
                    pzxid: 0,
                    ctime: 0,
                    mtime: 0,
                    ephemeral_owner: 0,
                },
            );
            Arc::new(ClusterState {
                inner: Mutex::new(ClusterInner {
                    nodes,
                    zxid: 0,
                    sessions: HashMap::new(),
                    watchers: HashMap::new(),
                    faults: VecDeque::new(),
                }),
                next_session: AtomicI64::new(1),
            })
        }))
    }

    fn connect_session(&self) -> i64 {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(id, Session { expired: false });
        id
    }

    fn is_expired(&self, session: i64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session)
            .map_or(true, |s| s.expired)
    }

    fn session_ids(&self) -> Vec<i64> {
        self.inner.lock().unwrap().sessions.keys().copied().collect()
    }

    fn apply(&self, session: i64, request: Request) -> (Result<Response, ZkError>, Vec<Firing>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(code) = inner.faults.pop_front() {
            return (Err(code), Vec::new());
        }
        let alive = inner.sessions.get(&session).map_or(false, |s| !s.expired);
        if !alive {
            return (Err(ZkError::SessionExpired), Vec::new());
        }
        dispatch(&mut inner, session, request)
    }

    /// Takes a session out of service: its ephemeral nodes vanish (firing
    /// other sessions' watches), its own armed watches are silently
    /// dropped. `expire` keeps the session on record as expired so later
    /// submissions are answered accordingly; a plain close forgets it.
    fn end_session(&self, session: i64, expire: bool) -> Vec<Firing> {
        let mut inner = self.inner.lock().unwrap();
        let present = if expire {
            match inner.sessions.get_mut(&session) {
                Some(s) if !s.expired => {
                    s.expired = true;
                    true
                }
                _ => false,
            }
        } else {
            inner.sessions.remove(&session).is_some()
        };
        if !present {
            return Vec::new();
        }
        let inner = &mut *inner;
        let owned: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        let mut pending = Vec::new();
        for path in owned {
            let (_, fired) = delete_node(&mut inner.nodes, &mut inner.zxid, path, -1);
            pending.extend(fired);
        }
        for watchers in inner.watchers.values_mut() {
            watchers.retain(|w| w.session != session);
        }
        inner.watchers.retain(|_, v| !v.is_empty());
        collect_firings(&mut inner.watchers, pending)
    }
}

fn fire(firings: Vec<Firing>) {
    for (tx, event) in firings {
        let _ = tx.send(event);
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(at) => Some(path[..at].to_string()),
        None => None,
    }
}

fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let name = &key[prefix.len()..];
            if name.is_empty() || name.contains('/') {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

fn stat_of(nodes: &BTreeMap<String, Node>, path: &str, node: &Node) -> Stat {
    Stat {
        czxid: node.czxid,
        mzxid: node.mzxid,
        ctime: node.ctime,
        mtime: node.mtime,
        version: node.version,
        cversion: node.cversion,
        aversion: 0,
        ephemeral_owner: node.ephemeral_owner,
        data_length: node.data.len() as i32,
        num_children: children_of(nodes, path).len() as i32,
        pzxid: node.pzxid,
    }
}

fn read_stat(nodes: &BTreeMap<String, Node>, path: &str) -> Result<Stat, ZkError> {
    nodes
        .get(path)
        .map(|node| stat_of(nodes, path, node))
        .ok_or(ZkError::NoNode)
}

fn read_data(nodes: &BTreeMap<String, Node>, path: &str) -> Result<Response, ZkError> {
    nodes
        .get(path)
        .map(|node| Response::GetData {
            bytes: node.data.clone(),
            stat: stat_of(nodes, path, node),
        })
        .ok_or(ZkError::NoNode)
}

fn read_children(nodes: &BTreeMap<String, Node>, path: &str) -> Result<Response, ZkError> {
    if !nodes.contains_key(path) {
        return Err(ZkError::NoNode);
    }
    Ok(Response::Strings(children_of(nodes, path)))
}

fn create_node(
    nodes: &mut BTreeMap<String, Node>,
    zxid: &mut i64,
    session: i64,
    path: String,
    data: Vec<u8>,
    mode: CreateMode,
) -> (Result<Response, ZkError>, Vec<Pending>) {
    let parent = match parent_of(&path) {
        Some(parent) => parent,
        // the root always exists
        None => return (Err(ZkError::NodeExists), Vec::new()),
    };
    let cversion = match nodes.get(&parent) {
        None => return (Err(ZkError::NoNode), Vec::new()),
        Some(node) if node.ephemeral_owner != 0 => {
            return (Err(ZkError::NoChildrenForEphemerals), Vec::new())
        }
        Some(node) => node.cversion,
    };
    // Sequence numbers come from the parent's child version, so they are
    // monotonic across creations and deletions.
    let path = if mode.is_sequential() {
        format!("{}{:010}", path, cversion)
    } else {
        path
    };
    if nodes.contains_key(&path) {
        return (Err(ZkError::NodeExists), Vec::new());
    }
    *zxid += 1;
    let stamp = *zxid;
    nodes.insert(
        path.clone(),
        Node {
            data,
            version: 0,
            cversion: 0,
            czxid: stamp,
            mzxid: stamp,
            pzxid: stamp,
            ctime: stamp,
            mtime: stamp,
            ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
        },
    );
    if let Some(parent_node) = nodes.get_mut(&parent) {
        parent_node.cversion += 1;
        parent_node.pzxid = stamp;
    }
    let pending = vec![
        Pending {
            path: path.clone(),
            event: WatchedEventType::NodeCreated,
        },
        Pending {
            path: parent,
            event: WatchedEventType::NodeChildrenChanged,
        },
    ];
    (Ok(Response::String(path)), pending)
}

fn delete_node(
    nodes: &mut BTreeMap<String, Node>,
    zxid: &mut i64,
    path: String,
    version: i32,
) -> (Result<Response, ZkError>, Vec<Pending>) {
    match nodes.get(&path) {
        None => return (Err(ZkError::NoNode), Vec::new()),
        Some(node) => {
            if version != -1 && node.version != version {
                return (Err(ZkError::BadVersion), Vec::new());
            }
        }
    }
    if parent_of(&path).is_none() {
        return (Err(ZkError::BadArguments), Vec::new());
    }
    if !children_of(nodes, &path).is_empty() {
        return (Err(ZkError::NotEmpty), Vec::new());
    }
    nodes.remove(&path);
    *zxid += 1;
    let stamp = *zxid;
    let mut pending = vec![Pending {
        path: path.clone(),
        event: WatchedEventType::NodeDeleted,
    }];
    if let Some(parent) = parent_of(&path) {
        if let Some(parent_node) = nodes.get_mut(&parent) {
            parent_node.cversion += 1;
            parent_node.pzxid = stamp;
        }
        pending.push(Pending {
            path: parent,
            event: WatchedEventType::NodeChildrenChanged,
        });
    }
    (Ok(Response::Empty), pending)
}

fn set_node(
    nodes: &mut BTreeMap<String, Node>,
    zxid: &mut i64,
    path: String,
    data: Vec<u8>,
    version: i32,
) -> (Result<Response, ZkError>, Vec<Pending>) {
    match nodes.get(&path) {
        None => return (Err(ZkError::NoNode), Vec::new()),
        Some(node) => {
            if version != -1 && node.version != version {
                return (Err(ZkError::BadVersion), Vec::new());
            }
        }
    }
    *zxid += 1;
    let stamp = *zxid;
    let stat = {
        let node = match nodes.get_mut(&path) {
            Some(node) => node,
            None => return (Err(ZkError::NoNode), Vec::new()),
        };
        node.data = data;
        node.version += 1;
        node.mzxid = stamp;
        node.mtime = stamp;
        node.clone()
    };
    let stat = stat_of(nodes, &path, &stat);
    let pending = vec![Pending {
        path,
        event: WatchedEventType::NodeDataChanged,
    }];
    (Ok(Response::Stat(stat)), pending)
}

/// Applies one operation to a tree. Reads are included because batched
/// reads act as assertions; watch slots inside a batch are ignored.
fn apply_part(
    nodes: &mut BTreeMap<String, Node>,
    zxid: &mut i64,
    session: i64,
    part: Request,
) -> (Result<Response, ZkError>, Vec<Pending>) {
    match part {
        Request::Create { path, data, mode } => {
            create_node(nodes, zxid, session, path, data.into_owned(), mode)
        }
        Request::Delete { path, version } => delete_node(nodes, zxid, path, version),
        Request::SetData {
            path,
            data,
            version,
        } => set_node(nodes, zxid, path, data.into_owned(), version),
        Request::Exists { path, .. } => (read_stat(nodes, &path).map(Response::Stat), Vec::new()),
        Request::GetData { path, .. } => (read_data(nodes, &path), Vec::new()),
        Request::GetChildren { path, .. } => (read_children(nodes, &path), Vec::new()),
        Request::Multi(_) => (Err(ZkError::Unimplemented), Vec::new()),
    }
}

fn arm(
    watchers: &mut HashMap<String, Vec<Watcher>>,
    session: i64,
    path: String,
    kind: WatchType,
    tx: oneshot::Sender<WatchedEvent>,
) {
    watchers
        .entry(path)
        .or_default()
        .push(Watcher { session, kind, tx });
}

/// Resolves recorded changes against the watcher table, consuming every
/// watcher the change kind addresses.
fn collect_firings(
    watchers: &mut HashMap<String, Vec<Watcher>>,
    pending: Vec<Pending>,
) -> Vec<Firing> {
    let mut firings = Vec::new();
    for Pending { path, event } in pending {
        let kinds: &[WatchType] = match event {
            WatchedEventType::NodeCreated | WatchedEventType::NodeDataChanged => {
                &[WatchType::Exist, WatchType::Data]
            }
            WatchedEventType::NodeDeleted => {
                &[WatchType::Exist, WatchType::Data, WatchType::Child]
            }
            WatchedEventType::NodeChildrenChanged => &[WatchType::Child],
            WatchedEventType::None => &[],
        };
        if let Some(armed) = watchers.get_mut(&path) {
            let mut kept = Vec::new();
            for watcher in armed.drain(..) {
                if kinds.contains(&watcher.kind) {
                    firings.push((
                        watcher.tx,
                        WatchedEvent {
                            event_type: event,
                            path: path.clone(),
                        },
                    ));
                } else {
                    kept.push(watcher);
                }
            }
            *armed = kept;
        }
    }
    watchers.retain(|_, v| !v.is_empty());
    firings
}

fn dispatch(
    inner: &mut ClusterInner,
    session: i64,
    request: Request,
) -> (Result<Response, ZkError>, Vec<Firing>) {
    match request {
        Request::Exists { path, watch } => {
            let res = read_stat(&inner.nodes, &path);
            // an exists watch is armed even for an absent node, so the
            // signal can report the node's creation
            if let Watch::Custom(tx) = watch {
                if matches!(res, Ok(_) | Err(ZkError::NoNode)) {
                    arm(&mut inner.watchers, session, path, WatchType::Exist, tx);
                }
            }
            (res.map(Response::Stat), Vec::new())
        }
        Request::GetData { path, watch } => {
            let res = read_data(&inner.nodes, &path);
            if res.is_ok() {
                if let Watch::Custom(tx) = watch {
                    arm(&mut inner.watchers, session, path, WatchType::Data, tx);
                }
            }
            (res, Vec::new())
        }
        Request::GetChildren { path, watch } => {
            let res = read_children(&inner.nodes, &path);
            if res.is_ok() {
                if let Watch::Custom(tx) = watch {
                    arm(&mut inner.watchers, session, path, WatchType::Child, tx);
                }
            }
            (res, Vec::new())
        }
        Request::Multi(parts) => {
            // Stage on a copy, commit on success. On failure nothing is
            // kept and the response marks each constituent: rolled back,
            // the failing code, or skipped.
            let mut staged = inner.nodes.clone();
            let mut zxid = inner.zxid;
            let mut outcomes: Vec<Result<Response, ZkError>> = Vec::new();
            let mut pending = Vec::new();
            let mut failed = false;
            for part in parts {
                if failed {
                    outcomes.push(Err(ZkError::RuntimeInconsistency));
                    continue;
                }
                let (res, fired) = apply_part(&mut staged, &mut zxid, session, part);
                match res {
                    Ok(response) => {
                        pending.extend(fired);
                        outcomes.push(Ok(response));
                    }
                    Err(code) => {
                        failed = true;
                        outcomes.push(Err(code));
                    }
                }
            }
            if failed {
                let outcomes = outcomes
                    .into_iter()
                    .map(|res| match res {
                        Ok(_) => Err(ZkError::Ok),
                        Err(code) => Err(code),
                    })
                    .collect();
                (Ok(Response::Multi(outcomes)), Vec::new())
            } else {
                inner.nodes = staged;
                inner.zxid = zxid;
                let firings = collect_firings(&mut inner.watchers, pending);
                (Ok(Response::Multi(outcomes)), firings)
            }
        }
        request => {
            let (res, fired) = {
                let ClusterInner {
                    ref mut nodes,
                    ref mut zxid,
                    ..
                } = *inner;
                apply_part(nodes, zxid, session, request)
            };
            let firings = collect_firings(&mut inner.watchers, fired);
            (res, firings)
        }
    }
}

async fn run_session(
    state: Arc<ClusterState>,
    session: i64,
    mut rx: mpsc::UnboundedReceiver<(Request, Completion)>,
    log: slog::Logger,
) {
    while let Some((request, completion)) = rx.next().await {
        trace!(log, "handling request"; "op" => request.op_name());
        let (res, firings) = state.apply(session, request);
        let _ = completion.send(res);
        fire(firings);
    }
    debug!(log, "session handle dropped, closing");
    fire(state.end_session(session, false));
}

/// Test handle on a named ensemble.
///
/// Creating the handle creates the ensemble if needed; sessions reach the
/// same ensemble by connecting with the name as their host string.
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    /// The ensemble with the given name, created empty on first use.
    pub fn ensemble(name: &str) -> InMemoryCluster {
        InMemoryCluster {
            state: ClusterState::named(name),
        }
    }

    /// Answers the next `n` submissions to this ensemble, from any
    /// session, with `code` instead of touching the tree. Queued faults
    /// are consumed in order, one per submission.
    pub fn inject_faults(&self, code: ZkError, n: usize) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.faults.extend(std::iter::repeat(code).take(n));
    }

    /// Expires a session: its ephemeral nodes vanish (firing other
    /// sessions' watches), its armed watches are dropped unfired, and all
    /// later submissions on it are answered with
    /// [`ZkError::SessionExpired`].
    pub fn expire_session(&self, session_id: i64) {
        fire(self.state.end_session(session_id, true));
    }

    /// Expires every session currently connected to the ensemble.
    pub fn expire_all(&self) {
        for session_id in self.state.session_ids() {
            self.expire_session(session_id);
        }
    }

    /// Whether a node exists, by server-side path (any chroot included).
    pub fn node_exists(&self, path: &str) -> bool {
        self.state.inner.lock().unwrap().nodes.contains_key(path)
    }

    /// A node's contents, by server-side path.
    pub fn node_data(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .inner
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }

    /// The session owning a node, `Some(0)` for a persistent node, `None`
    /// when the node does not exist.
    pub fn node_owner(&self, path: &str) -> Option<i64> {
        self.state
            .inner
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .map(|node| node.ephemeral_owner)
    }
}

/// [`ZooKeeperDriver`] implementation backed by an [`InMemoryCluster`].
///
/// Must be connected from inside a tokio runtime: each session runs as a
/// spawned worker task that answers submissions in order. Dropping the
/// driver (the last clone of its session) closes the session.
pub struct InMemoryDriver {
    state: Arc<ClusterState>,
    session: i64,
    tx: mpsc::UnboundedSender<(Request, Completion)>,
}

#[async_trait]
impl ZooKeeperDriver for InMemoryDriver {
    async fn connect(config: &SessionConfig, log: slog::Logger) -> Result<Self, Error> {
        let state = ClusterState::named(config.hosts());
        let session = state.connect_session();
        let (tx, rx) = mpsc::unbounded();
        info!(log, "in-memory session connected";
            "ensemble" => config.hosts(),
            "session_id" => session,
        );
        tokio::spawn(run_session(Arc::clone(&state), session, rx, log));
        Ok(InMemoryDriver { state, session, tx })
    }

    fn submit(&self, request: Request, completion: Completion) {
        // a failed send means the worker is gone; the dropped completion
        // reports that as connection loss
        let _ = self.tx.unbounded_send((request, completion));
    }

    fn session_id(&self) -> i64 {
        self.session
    }

    fn is_expired(&self) -> bool {
        self.state.is_expired(self.session)
    }
}
