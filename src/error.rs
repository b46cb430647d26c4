use failure::Fail;
use std::fmt;

/// Canonical result codes of the coordination service.
///
/// The discriminants are the service's wire values, so protocol drivers can
/// convert raw codes with `From<i32>`. `Ok` is included because a failed
/// `multi` batch reports rolled-back constituents with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum ZkError {
    Ok = 0,
    /// This code is never returned from the server. It should not be used other than to indicate a
    /// range. Specifically error codes greater than this value are API errors (while values less
    /// than this indicate a system error.
    APIError = -100,
    /// Client authentication failed.
    AuthFailed = -115,
    /// Invalid arguments.
    BadArguments = -8,
    /// Version conflict in `set` operation. In case of reconfiguration: reconfig requested from
    /// config version X but last seen config has a different version Y.
    BadVersion = -103,
    /// Connection to the server has been lost.
    ConnectionLoss = -4,
    /// A data inconsistency was found.
    DataInconsistency = -3,
    /// Attempt to create ephemeral node on a local session.
    EphemeralOnLocalSession = -120,
    /// Invalid ACL specified.
    InvalidACL = -114,
    /// Invalid callback specified.
    InvalidCallback = -113,
    /// Error while marshalling or unmarshalling data.
    MarshallingError = -5,
    /// Not authenticated.
    NoAuth = -102,
    /// Ephemeral nodes may not have children.
    NoChildrenForEphemerals = -108,
    /// Request to create node that already exists.
    NodeExists = -110,
    /// Attempted to read a node that does not exist.
    NoNode = -101,
    /// The node has children.
    NotEmpty = -111,
    /// State-changing request is passed to read-only server.
    NotReadOnly = -119,
    /// Attempt to remove a non-existing watcher.
    NoWatcher = -121,
    /// Operation timeout.
    OperationTimeout = -7,
    /// A runtime inconsistency was found.
    RuntimeInconsistency = -2,
    /// The session has been expired by the server.
    SessionExpired = -112,
    /// Session moved to another server, so operation is ignored.
    SessionMoved = -118,
    /// System and server-side errors. This is never thrown by the server, it shouldn't be used
    /// other than to indicate a range. Specifically error codes greater than this value, but lesser
    /// than `APIError`, are system errors.
    SystemError = -1,
    /// Operation is unimplemented.
    Unimplemented = -6,
}

impl From<i32> for ZkError {
    fn from(code: i32) -> Self {
        match code {
            0 => ZkError::Ok,
            -100 => ZkError::APIError,
            -115 => ZkError::AuthFailed,
            -8 => ZkError::BadArguments,
            -103 => ZkError::BadVersion,
            -4 => ZkError::ConnectionLoss,
            -3 => ZkError::DataInconsistency,
            -120 => ZkError::EphemeralOnLocalSession,
            -114 => ZkError::InvalidACL,
            -113 => ZkError::InvalidCallback,
            -5 => ZkError::MarshallingError,
            -102 => ZkError::NoAuth,
            -108 => ZkError::NoChildrenForEphemerals,
            -110 => ZkError::NodeExists,
            -101 => ZkError::NoNode,
            -111 => ZkError::NotEmpty,
            -119 => ZkError::NotReadOnly,
            -121 => ZkError::NoWatcher,
            -7 => ZkError::OperationTimeout,
            -2 => ZkError::RuntimeInconsistency,
            -112 => ZkError::SessionExpired,
            -118 => ZkError::SessionMoved,
            -1 => ZkError::SystemError,
            -6 => ZkError::Unimplemented,
            _ => unimplemented!("unknown error code {}", code),
        }
    }
}

impl fmt::Display for ZkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ZkError::Ok => "ok",
            ZkError::APIError => "api error",
            ZkError::AuthFailed => "authentication failed",
            ZkError::BadArguments => "bad arguments",
            ZkError::BadVersion => "version conflict",
            ZkError::ConnectionLoss => "connection loss",
            ZkError::DataInconsistency => "data inconsistency",
            ZkError::EphemeralOnLocalSession => "ephemeral node on local session",
            ZkError::InvalidACL => "invalid acl",
            ZkError::InvalidCallback => "invalid callback",
            ZkError::MarshallingError => "marshalling error",
            ZkError::NoAuth => "not authenticated",
            ZkError::NoChildrenForEphemerals => "ephemeral nodes may not have children",
            ZkError::NodeExists => "node already exists",
            ZkError::NoNode => "no node",
            ZkError::NotEmpty => "node has children",
            ZkError::NotReadOnly => "server is read-only",
            ZkError::NoWatcher => "no such watcher",
            ZkError::OperationTimeout => "operation timeout",
            ZkError::RuntimeInconsistency => "runtime inconsistency",
            ZkError::SessionExpired => "session expired",
            ZkError::SessionMoved => "session moved",
            ZkError::SystemError => "system error",
            ZkError::Unimplemented => "unimplemented",
        };
        f.write_str(s)
    }
}

impl ZkError {
    /// Whether a read-only operation that failed with this code may be
    /// resubmitted. Only transient transport-level conditions qualify;
    /// mutations are never resubmitted on any code.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ZkError::ConnectionLoss | ZkError::OperationTimeout)
    }
}

/// The codes each try- variant converts into a returned outcome instead of a
/// raised failure, one fixed table per operation family.
///
/// These tables *are* the contract: swallowing a code that is not listed here
/// would hide a real failure, and raising one that is listed would break
/// callers that treat the outcome as data. Audited by the tests below.
pub(crate) mod benign {
    use super::ZkError;

    /// `try_create`: missing parent, ephemeral parent, or an existing node.
    pub(crate) const CREATE: &[ZkError] = &[
        ZkError::NoNode,
        ZkError::NoChildrenForEphemerals,
        ZkError::NodeExists,
    ];

    /// `try_remove`: already gone, version mismatch, or remaining children.
    pub(crate) const REMOVE: &[ZkError] =
        &[ZkError::NoNode, ZkError::BadVersion, ZkError::NotEmpty];

    /// `try_get` / `try_get_watch`: target absent.
    pub(crate) const GET: &[ZkError] = &[ZkError::NoNode];

    /// `try_set`: target absent or version mismatch.
    pub(crate) const SET: &[ZkError] = &[ZkError::NoNode, ZkError::BadVersion];

    /// `try_get_children`: target absent.
    pub(crate) const GET_CHILDREN: &[ZkError] = &[ZkError::NoNode];
}

/// Errors that may cause a delete request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Delete {
    /// No node exists with the given `path`.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The target node has a different version than was specified by the call to delete.
    #[fail(
        display = "target node has different version than expected ({})",
        expected
    )]
    BadVersion {
        /// The expected node version.
        expected: i32,
    },

    /// The target node has child nodes, and therefore cannot be deleted.
    #[fail(display = "target node has children, and cannot be deleted")]
    NotEmpty,
}

/// Errors that may cause a `set` request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum SetData {
    /// No node exists with the given `path`.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The target node has a different version than was specified by the call to `set`.
    #[fail(
        display = "target node has different version than expected ({})",
        expected
    )]
    BadVersion {
        /// The expected node version.
        expected: i32,
    },
}

/// Errors that may cause a create request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Create {
    /// A node with the given `path` already exists.
    #[fail(display = "target node already exists")]
    NodeExists,

    /// The parent node of the given `path` does not exist.
    #[fail(display = "parent node of target does not exist")]
    NoNode,

    /// The parent node of the given `path` is ephemeral, and cannot have children.
    #[fail(display = "parent node is ephemeral, and cannot have children")]
    NoChildrenForEphemerals,
}

/// The per-operation outcome of a failed `multi` request.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Multi {
    /// A failed `delete` request.
    #[fail(display = "delete failed: {}", 0)]
    Delete(Delete),

    /// A failed `set` request.
    #[fail(display = "set failed: {}", 0)]
    SetData(SetData),

    /// A failed `create` request.
    #[fail(display = "create failed: {}", 0)]
    Create(Create),

    /// A read or existence assertion inside the batch found no node.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The request would have succeeded, but a later request in the `multi`
    /// batch failed and caused this request to get rolled back.
    #[fail(display = "request rolled back due to later failed request")]
    RolledBack,

    /// The request was skipped because an earlier request in the `multi` batch
    /// failed. It is unknown whether this request would have succeeded.
    #[fail(display = "request failed due to earlier failed request")]
    Skipped,

    /// A code outside the operation's ordinary outcomes. Only the no-throw
    /// batch form produces this; everywhere else such codes are raised.
    #[fail(display = "request failed: {}", 0)]
    Other(ZkError),
}

impl Delete {
    /// The service code this outcome stands for.
    pub fn code(&self) -> ZkError {
        match *self {
            Delete::NoNode => ZkError::NoNode,
            Delete::BadVersion { .. } => ZkError::BadVersion,
            Delete::NotEmpty => ZkError::NotEmpty,
        }
    }
}

impl SetData {
    /// The service code this outcome stands for.
    pub fn code(&self) -> ZkError {
        match *self {
            SetData::NoNode => ZkError::NoNode,
            SetData::BadVersion { .. } => ZkError::BadVersion,
        }
    }
}

impl Create {
    /// The service code this outcome stands for.
    pub fn code(&self) -> ZkError {
        match *self {
            Create::NodeExists => ZkError::NodeExists,
            Create::NoNode => ZkError::NoNode,
            Create::NoChildrenForEphemerals => ZkError::NoChildrenForEphemerals,
        }
    }
}

impl Multi {
    /// The service code this outcome stands for. Rolled-back constituents
    /// report `Ok` and skipped ones `RuntimeInconsistency`, matching how the
    /// service encodes them in a failed batch.
    pub fn code(&self) -> ZkError {
        match *self {
            Multi::Delete(ref err) => err.code(),
            Multi::SetData(ref err) => err.code(),
            Multi::Create(ref err) => err.code(),
            Multi::NoNode => ZkError::NoNode,
            Multi::RolledBack => ZkError::Ok,
            Multi::Skipped => ZkError::RuntimeInconsistency,
            Multi::Other(code) => code,
        }
    }

    /// Whether this constituent is the one that made the batch fail, rather
    /// than a casualty of another constituent's failure.
    pub fn is_failure(&self) -> bool {
        !matches!(*self, Multi::RolledBack | Multi::Skipped)
    }
}

impl From<Delete> for Multi {
    fn from(err: Delete) -> Self {
        Multi::Delete(err)
    }
}

impl From<SetData> for Multi {
    fn from(err: SetData) -> Self {
        Multi::SetData(err)
    }
}

impl From<Create> for Multi {
    fn from(err: Create) -> Self {
        Multi::Create(err)
    }
}

/// A failure raised by a session operation.
///
/// Benign per-operation outcomes never surface here — the try- variants hand
/// those back as data. What remains is the unexpected: codes outside the
/// operation's documented set, recoverable codes that survived the read retry
/// budget, session expiry, and client-side argument errors.
#[derive(Debug, Fail)]
pub enum Error {
    /// The service answered with a code the operation does not treat as an
    /// ordinary outcome.
    #[fail(display = "{} on {:?} failed: {}", op, path, code)]
    Keeper {
        /// The operation that failed.
        op: &'static str,
        /// The path the operation was issued against (client-side, without
        /// the chroot prefix).
        path: String,
        /// The code the service answered with.
        code: ZkError,
    },

    /// A constituent of a `multi` batch failed, aborting the whole batch.
    #[fail(display = "multi op {} on {:?} failed: {}", index, path, code)]
    Multi {
        /// Position of the failed operation within the batch.
        index: usize,
        /// The path of the failed operation.
        path: String,
        /// The code the failed operation was answered with.
        code: ZkError,
    },

    /// A client-side path that does not name a node.
    #[fail(display = "invalid path {:?}: {}", path, reason)]
    BadPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A session configuration the builder refuses to connect with.
    #[fail(display = "invalid session config: {}", reason)]
    Config {
        /// Why it was rejected.
        reason: String,
    },

    /// The driver delivered a payload the operation cannot interpret.
    #[fail(display = "unexpected response to {}: {}", op, detail)]
    Protocol {
        /// The operation whose response was malformed.
        op: &'static str,
        /// Description of the mismatch.
        detail: String,
    },
}

impl Error {
    pub(crate) fn keeper(op: &'static str, path: &str, code: ZkError) -> Error {
        Error::Keeper {
            op,
            path: path.to_string(),
            code,
        }
    }

    /// The service code behind this failure, if there is one.
    pub fn code(&self) -> Option<ZkError> {
        match *self {
            Error::Keeper { code, .. } | Error::Multi { code, .. } => Some(code),
            Error::BadPath { .. } | Error::Config { .. } | Error::Protocol { .. } => None,
        }
    }

    /// Whether this failure reports the session as expired. Once a session
    /// reports this, every further operation on it fails the same way.
    pub fn is_session_expired(&self) -> bool {
        self.code() == Some(ZkError::SessionExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_codes_are_transport_conditions_only() {
        for code in [
            ZkError::NoNode,
            ZkError::NodeExists,
            ZkError::BadVersion,
            ZkError::NotEmpty,
            ZkError::SessionExpired,
            ZkError::BadArguments,
            ZkError::AuthFailed,
        ] {
            assert!(!code.is_recoverable(), "{} must not be retried", code);
        }
        assert!(ZkError::ConnectionLoss.is_recoverable());
        assert!(ZkError::OperationTimeout.is_recoverable());
    }

    #[test]
    fn try_create_swallows_documented_codes_only() {
        assert_eq!(
            benign::CREATE,
            &[
                ZkError::NoNode,
                ZkError::NoChildrenForEphemerals,
                ZkError::NodeExists,
            ]
        );
    }

    #[test]
    fn try_remove_swallows_documented_codes_only() {
        assert_eq!(
            benign::REMOVE,
            &[ZkError::NoNode, ZkError::BadVersion, ZkError::NotEmpty]
        );
    }

    #[test]
    fn read_and_set_tables_match_their_contracts() {
        assert_eq!(benign::GET, &[ZkError::NoNode]);
        assert_eq!(benign::GET_CHILDREN, &[ZkError::NoNode]);
        assert_eq!(benign::SET, &[ZkError::NoNode, ZkError::BadVersion]);
    }

    #[test]
    fn no_benign_table_hides_session_or_transport_failures() {
        for table in [
            benign::CREATE,
            benign::REMOVE,
            benign::GET,
            benign::SET,
            benign::GET_CHILDREN,
        ] {
            assert!(!table.contains(&ZkError::SessionExpired));
            assert!(!table.contains(&ZkError::ConnectionLoss));
            assert!(!table.contains(&ZkError::OperationTimeout));
        }
    }

    #[test]
    fn code_round_trips_through_wire_value() {
        for code in [
            ZkError::Ok,
            ZkError::NoNode,
            ZkError::NodeExists,
            ZkError::SessionExpired,
            ZkError::ConnectionLoss,
        ] {
            assert_eq!(ZkError::from(code as i32), code);
        }
    }

    #[test]
    fn multi_outcome_reports_the_underlying_code() {
        assert_eq!(Multi::RolledBack.code(), ZkError::Ok);
        assert_eq!(Multi::Skipped.code(), ZkError::RuntimeInconsistency);
        assert_eq!(Multi::NoNode.code(), ZkError::NoNode);
        assert_eq!(
            Multi::Delete(Delete::BadVersion { expected: 3 }).code(),
            ZkError::BadVersion
        );
        assert_eq!(
            Multi::Other(ZkError::NoAuth).code(),
            ZkError::NoAuth
        );
        assert!(!Multi::RolledBack.is_failure());
        assert!(!Multi::Skipped.is_failure());
        assert!(Multi::NoNode.is_failure());
    }

    #[test]
    fn error_reports_session_expiry() {
        let err = Error::keeper("get", "/a", ZkError::SessionExpired);
        assert!(err.is_session_expired());
        assert_eq!(err.code(), Some(ZkError::SessionExpired));
        let err = Error::keeper("get", "/a", ZkError::NoAuth);
        assert!(!err.is_session_expired());
    }
}
