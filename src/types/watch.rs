use crate::paths;
use futures::channel::oneshot;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// A change on the coordination service that a watch is able to respond to.
///
/// The `WatchedEvent` includes exactly what happened and the path of the
/// znode that was involved in the event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    /// The trigger that caused the watch to hit.
    pub event_type: WatchedEventType,
    /// The path of the znode that was involved.
    pub path: String,
}

/// Enumeration of types of events that may occur on the znode.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedEventType {
    /// Nothing known has occurred on the znode.
    None = -1,
    /// Issued when a znode at a given path is created.
    NodeCreated = 1,
    /// Issued when a znode at a given path is deleted.
    NodeDeleted = 2,
    /// Issued when the data of a watched znode are altered. This event value is issued whenever a
    /// *set* operation occurs without an actual contents check, so there is no guarantee the data
    /// actually changed.
    NodeDataChanged = 3,
    /// Issued when the children of a watched znode are created or deleted. This event is not issued
    /// when the data within children is altered.
    NodeChildrenChanged = 4,
}

impl From<i32> for WatchedEventType {
    fn from(code: i32) -> Self {
        match code {
            -1 => WatchedEventType::None,
            1 => WatchedEventType::NodeCreated,
            2 => WatchedEventType::NodeDeleted,
            3 => WatchedEventType::NodeDataChanged,
            4 => WatchedEventType::NodeChildrenChanged,
            _ => unreachable!("unknown event type {:x}", code),
        }
    }
}

/// The watch slot a read request carries down to the protocol driver.
///
/// The driver fires the sender at most once, with the event that consumed the
/// watch. Dropping the sender without firing is how a driver reports that the
/// watch can never fire anymore (it was not armed, or the session ended).
#[derive(Debug)]
pub enum Watch {
    /// Leave the watch unset.
    None,
    /// Attach a one-shot watch to the request.
    Custom(oneshot::Sender<WatchedEvent>),
}

impl Watch {
    /// Whether this request arms a watch at all.
    pub fn is_armed(&self) -> bool {
        !matches!(*self, Watch::None)
    }
}

/// Describes what a watch is looking for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WatchType {
    /// Watching for changes to children.
    Child,
    /// Watching for changes to data.
    Data,
    /// Watching for the creation of a node at the given path.
    Exist,
}

/// A one-shot notification for a single watch registration.
///
/// The signal is armed by the call that registered it and fires at most once.
/// Await it to receive the consuming event; after that, observing further
/// changes requires a fresh watch-arming call. Resolves to `None` when the
/// registering session goes away before the watch fires — the service sends
/// no notification for that implicit deregistration, the channel just closes.
///
/// The event's path is delivered in client form, with any session chroot
/// already stripped.
#[pin_project]
#[derive(Debug)]
pub struct WatchSignal {
    #[pin]
    rx: oneshot::Receiver<WatchedEvent>,
    chroot: Option<String>,
}

impl WatchSignal {
    pub(crate) fn new(rx: oneshot::Receiver<WatchedEvent>, chroot: Option<String>) -> Self {
        WatchSignal { rx, chroot }
    }

    fn strip(chroot: &Option<String>, mut event: WatchedEvent) -> WatchedEvent {
        if let Some(ref chroot) = *chroot {
            event.path = paths::strip_chroot(chroot, &event.path);
        }
        event
    }

    /// Non-blocking probe: the event if the watch has already fired, `None`
    /// otherwise. A returned event consumes the signal.
    pub fn try_fired(&mut self) -> Option<WatchedEvent> {
        match self.rx.try_recv() {
            Ok(Some(event)) => Some(Self::strip(&self.chroot, event)),
            Ok(None) | Err(oneshot::Canceled) => None,
        }
    }

    /// Consume the signal by handing the eventual event to a callback.
    ///
    /// The callback runs on a spawned task and is invoked only if the watch
    /// actually fires; must be called from within a tokio runtime.
    pub fn callback<F>(self, f: F)
    where
        F: FnOnce(WatchedEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            if let Some(event) = self.await {
                f(event);
            }
        });
    }
}

impl Future for WatchSignal {
    type Output = Option<WatchedEvent>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        Poll::Ready(match ready!(this.rx.poll(cx)) {
            Ok(event) => Some(Self::strip(this.chroot, event)),
            Err(oneshot::Canceled) => None,
        })
    }
}
