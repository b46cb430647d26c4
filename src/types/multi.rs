use super::{CreateMode, Stat};
use crate::error::{self, ZkError};
use std::borrow::Cow;

/// One operation of a `multi` batch, named by its client-side path.
///
/// Reads inside a batch double as assertions: an `exists`, `get` or
/// `get_children` op whose target is absent fails the whole batch with
/// [`ZkError::NoNode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Create a znode with the given mode.
    Create {
        path: String,
        data: Cow<'static, [u8]>,
        mode: CreateMode,
    },
    /// Delete a znode iff its version matches (`-1` matches any version).
    Remove { path: String, version: i32 },
    /// Replace a znode's contents iff its version matches (`-1` matches any
    /// version).
    Set {
        path: String,
        data: Cow<'static, [u8]>,
        version: i32,
    },
    /// Assert existence and read the znode's `Stat`.
    Exists { path: String },
    /// Read a znode's contents.
    Get { path: String },
    /// List a znode's immediate children.
    GetChildren { path: String },
}

impl Op {
    /// A `create` batch operation.
    pub fn create<D>(path: &str, data: D, mode: CreateMode) -> Op
    where
        D: Into<Cow<'static, [u8]>>,
    {
        Op::Create {
            path: path.to_string(),
            data: data.into(),
            mode,
        }
    }

    /// A `remove` batch operation; `version` -1 removes any version.
    pub fn remove(path: &str, version: i32) -> Op {
        Op::Remove {
            path: path.to_string(),
            version,
        }
    }

    /// A `set` batch operation; `version` -1 overwrites any version.
    pub fn set<D>(path: &str, data: D, version: i32) -> Op
    where
        D: Into<Cow<'static, [u8]>>,
    {
        Op::Set {
            path: path.to_string(),
            data: data.into(),
            version,
        }
    }

    /// An existence assertion.
    pub fn exists(path: &str) -> Op {
        Op::Exists {
            path: path.to_string(),
        }
    }

    /// A read batch operation.
    pub fn get(path: &str) -> Op {
        Op::Get {
            path: path.to_string(),
        }
    }

    /// A child-listing batch operation.
    pub fn get_children(path: &str) -> Op {
        Op::GetChildren {
            path: path.to_string(),
        }
    }

    /// The client-side path this operation targets.
    pub fn path(&self) -> &str {
        match *self {
            Op::Create { ref path, .. }
            | Op::Remove { ref path, .. }
            | Op::Set { ref path, .. }
            | Op::Exists { ref path }
            | Op::Get { ref path }
            | Op::GetChildren { ref path } => path,
        }
    }
}

/// An individual response in a `multi` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultiResponse {
    /// The response to a `create` request within a `multi` batch: the path
    /// actually created, with any sequence suffix applied.
    Create(String),
    /// The response to a `remove` request within a `multi` batch.
    Remove,
    /// The response to a `set` request within a `multi` batch.
    Set(Stat),
    /// The response to an `exists` assertion within a `multi` batch.
    Exists(Stat),
    /// The response to a `get` request within a `multi` batch.
    Get(Vec<u8>, Stat),
    /// The response to a `get_children` request within a `multi` batch.
    GetChildren(Vec<String>),
}

/// The raw, never-raising outcome of a `multi` batch.
///
/// `results` corresponds positionally to the submitted operations. For a
/// failed batch, operations before the failure report
/// [`error::Multi::RolledBack`], the failing one its own outcome, and later
/// ones [`error::Multi::Skipped`].
#[derive(Debug, PartialEq, Eq)]
pub struct MultiOutcome {
    /// `ZkError::Ok` when the whole batch applied.
    pub code: ZkError,
    /// Position of the operation that aborted the batch, if any.
    pub failed_index: Option<usize>,
    /// Per-operation outcomes, in submission order.
    pub results: Vec<Result<MultiResponse, error::Multi>>,
}

impl MultiOutcome {
    /// Whether every operation in the batch applied.
    pub fn ok(&self) -> bool {
        self.code == ZkError::Ok
    }
}
