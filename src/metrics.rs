/// Observer for session events that deployments typically count.
///
/// All hooks default to doing nothing, so implementors only wire up the
/// counters they care about. A sink is injected per session through
/// [`ZooKeeperBuilder::metrics`](crate::ZooKeeperBuilder::metrics); there is
/// no process-wide registry.
pub trait Metrics: Send + Sync + 'static {
    /// An ephemeral node came under the management of a holder.
    fn ephemeral_node_registered(&self, _path: &str) {}

    /// A holder gave up its node, by explicit release or by drop.
    fn ephemeral_node_released(&self, _path: &str) {}

    /// A holder tried to remove its node and failed with something other
    /// than a benign outcome. The node may linger until the session ends.
    fn cannot_remove_ephemeral_node(&self, _path: &str) {}
}

/// The default sink: counts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl Metrics for NoMetrics {}
