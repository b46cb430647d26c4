use futures::channel::oneshot;
use slog::warn;
use std::borrow::Cow;

use crate::driver::{Request, ZooKeeperDriver};
use crate::error::{benign, Error};
use crate::metrics::Metrics;
use crate::types::CreateMode;
use crate::ZooKeeper;

/// A handle that owns the removal of an ephemeral node.
///
/// As long as the holder lives, the node is meant to exist; dropping the
/// holder removes it. Removal on drop is best-effort and fire-and-forget —
/// the request is handed to the driver and, when a tokio runtime is
/// available, a task stays behind to record whether it worked. Use
/// [`release`](EphemeralNode::release) instead of dropping when you want to
/// wait for the removal.
///
/// Whatever happens to the holder, the node never outlives its session: the
/// service removes ephemeral nodes when the session that created them ends.
/// The holder exists to remove it *earlier* than that, deterministically.
///
/// Not `Clone`: exactly one holder owns the removal obligation.
pub struct EphemeralNode<D: ZooKeeperDriver> {
    zk: ZooKeeper<D>,
    path: String,
    released: bool,
}

impl<D: ZooKeeperDriver> EphemeralNode<D> {
    /// Creates an ephemeral node at `path` and takes ownership of it.
    pub async fn create<Data>(zk: &ZooKeeper<D>, path: &str, data: Data) -> Result<Self, Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        let created = zk.create(path, data, CreateMode::Ephemeral).await?;
        Ok(Self::held(zk, created))
    }

    /// Creates an ephemeral sequential node and takes ownership of the
    /// suffixed path the service assigned.
    pub async fn create_sequential<Data>(
        zk: &ZooKeeper<D>,
        path: &str,
        data: Data,
    ) -> Result<Self, Error>
    where
        Data: Into<Cow<'static, [u8]>>,
    {
        let created = zk
            .create(path, data, CreateMode::EphemeralSequential)
            .await?;
        Ok(Self::held(zk, created))
    }

    /// Takes ownership of a node that already exists. Only the removal
    /// obligation is taken over; nothing is checked or created.
    pub fn existing(zk: &ZooKeeper<D>, path: &str) -> Self {
        Self::held(zk, path.to_string())
    }

    fn held(zk: &ZooKeeper<D>, path: String) -> Self {
        zk.metrics().ephemeral_node_registered(&path);
        EphemeralNode {
            zk: zk.clone(),
            path,
            released: false,
        }
    }

    /// The node this holder owns. For
    /// [`create_sequential`](EphemeralNode::create_sequential) this is the
    /// full suffixed path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Removes the node now and waits for the removal to be answered.
    ///
    /// Never fails: a node that is already gone is fine, and anything else
    /// is logged and counted, since the session's end will release the node
    /// regardless.
    pub async fn release(mut self) {
        self.released = true;
        self.zk.metrics().ephemeral_node_released(&self.path);
        match self.zk.try_remove(&self.path, -1).await {
            Ok(_) => {}
            Err(err) => {
                warn!(self.zk.log(), "failed to remove ephemeral node";
                    "path" => %self.path,
                    "error" => %err,
                );
                self.zk.metrics().cannot_remove_ephemeral_node(&self.path);
            }
        }
    }
}

impl<D: ZooKeeperDriver> Drop for EphemeralNode<D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let metrics = self.zk.metrics();
        metrics.ephemeral_node_released(&self.path);
        let server = match self.zk.server_path(&self.path) {
            Ok(server) => server,
            Err(_) => return,
        };
        let rx = self.zk.submit_background(Request::Delete {
            path: server,
            version: -1,
        });
        // Without a runtime the removal is still submitted, we just cannot
        // stay around to hear the answer.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let path = std::mem::take(&mut self.path);
            let log = self.zk.log().clone();
            handle.spawn(async move {
                match rx.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(code)) if benign::REMOVE.contains(&code) => {}
                    Ok(Err(code)) => {
                        warn!(log, "failed to remove ephemeral node";
                            "path" => %path,
                            "code" => %code,
                        );
                        metrics.cannot_remove_ephemeral_node(&path);
                    }
                    Err(oneshot::Canceled) => {
                        warn!(log, "session ended before ephemeral node removal was answered";
                            "path" => %path,
                        );
                        metrics.cannot_remove_ephemeral_node(&path);
                    }
                }
            });
        }
    }
}
