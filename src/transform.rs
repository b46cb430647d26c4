//! Translation of raw driver results into per-operation outcomes.
//!
//! Every function here implements the same split: codes listed in the
//! operation's [`error::benign`] table become an inner outcome the caller
//! receives as data, everything else becomes a raised [`Error`]. The tables
//! drive the decision; the matches below only give the swallowed codes their
//! operation-specific types.

use crate::driver::Response;
use crate::error::{self, benign, Error, ZkError};
use crate::types::{MultiOutcome, MultiResponse, Op, Stat};

pub(crate) fn create(
    path: &str,
    res: Result<Response, ZkError>,
) -> Result<Result<String, error::Create>, Error> {
    match res {
        Ok(Response::String(s)) => Ok(Ok(s)),
        Ok(r) => Err(Error::Protocol {
            op: "create",
            detail: format!("non-string response {:?}", r),
        }),
        Err(code) if benign::CREATE.contains(&code) => Ok(Err(match code {
            ZkError::NoNode => error::Create::NoNode,
            ZkError::NoChildrenForEphemerals => error::Create::NoChildrenForEphemerals,
            ZkError::NodeExists => error::Create::NodeExists,
            _ => unreachable!(),
        })),
        Err(code) => Err(Error::keeper("create", path, code)),
    }
}

pub(crate) fn set_data(
    path: &str,
    version: i32,
    res: Result<Response, ZkError>,
) -> Result<Result<Stat, error::SetData>, Error> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Ok(stat)),
        Ok(r) => Err(Error::Protocol {
            op: "set",
            detail: format!("non-stat response {:?}", r),
        }),
        Err(code) if benign::SET.contains(&code) => Ok(Err(match code {
            ZkError::NoNode => error::SetData::NoNode,
            ZkError::BadVersion => error::SetData::BadVersion { expected: version },
            _ => unreachable!(),
        })),
        Err(code) => Err(Error::keeper("set", path, code)),
    }
}

pub(crate) fn delete(
    path: &str,
    version: i32,
    res: Result<Response, ZkError>,
) -> Result<Result<(), error::Delete>, Error> {
    match res {
        Ok(Response::Empty) => Ok(Ok(())),
        Ok(r) => Err(Error::Protocol {
            op: "remove",
            detail: format!("non-empty response {:?}", r),
        }),
        Err(code) if benign::REMOVE.contains(&code) => Ok(Err(match code {
            ZkError::NoNode => error::Delete::NoNode,
            ZkError::BadVersion => error::Delete::BadVersion { expected: version },
            ZkError::NotEmpty => error::Delete::NotEmpty,
            _ => unreachable!(),
        })),
        Err(code) => Err(Error::keeper("remove", path, code)),
    }
}

/// `exists` has no try- variant: an absent node is its ordinary `None`
/// answer, not a failure.
pub(crate) fn exists(path: &str, res: Result<Response, ZkError>) -> Result<Option<Stat>, Error> {
    match res {
        Ok(Response::Stat(stat)) => Ok(Some(stat)),
        Ok(r) => Err(Error::Protocol {
            op: "exists",
            detail: format!("non-stat response {:?}", r),
        }),
        Err(ZkError::NoNode) => Ok(None),
        Err(code) => Err(Error::keeper("exists", path, code)),
    }
}

pub(crate) fn get_data(
    path: &str,
    res: Result<Response, ZkError>,
) -> Result<Option<(Vec<u8>, Stat)>, Error> {
    match res {
        Ok(Response::GetData { bytes, stat }) => Ok(Some((bytes, stat))),
        Ok(r) => Err(Error::Protocol {
            op: "get",
            detail: format!("non-data response {:?}", r),
        }),
        Err(code) if benign::GET.contains(&code) => Ok(None),
        Err(code) => Err(Error::keeper("get", path, code)),
    }
}

pub(crate) fn get_children(
    path: &str,
    res: Result<Response, ZkError>,
) -> Result<Option<Vec<String>>, Error> {
    match res {
        Ok(Response::Strings(children)) => Ok(Some(children)),
        Ok(r) => Err(Error::Protocol {
            op: "get_children",
            detail: format!("non-strings response {:?}", r),
        }),
        Err(code) if benign::GET_CHILDREN.contains(&code) => Ok(None),
        Err(code) => Err(Error::keeper("get_children", path, code)),
    }
}

/// The subset of an [`Op`] that interpreting a multi response needs.
///
/// Mapping a failed batch requires, per constituent, its kind, the version
/// it was conditioned on, and its client path for error context. A marker
/// retains exactly that, so the batch's payloads can be moved into the
/// request without cloning them.
#[derive(Debug)]
pub(crate) enum OpMarker {
    Create { path: String },
    Delete { path: String, version: i32 },
    SetData { path: String, version: i32 },
    Exists { path: String },
    GetData { path: String },
    GetChildren { path: String },
}

impl From<&Op> for OpMarker {
    fn from(op: &Op) -> OpMarker {
        match *op {
            Op::Create { ref path, .. } => OpMarker::Create { path: path.clone() },
            Op::Remove { ref path, version } => OpMarker::Delete {
                path: path.clone(),
                version,
            },
            Op::Set {
                ref path, version, ..
            } => OpMarker::SetData {
                path: path.clone(),
                version,
            },
            Op::Exists { ref path } => OpMarker::Exists { path: path.clone() },
            Op::Get { ref path } => OpMarker::GetData { path: path.clone() },
            Op::GetChildren { ref path } => OpMarker::GetChildren { path: path.clone() },
        }
    }
}

impl OpMarker {
    pub(crate) fn path(&self) -> &str {
        match *self {
            OpMarker::Create { ref path }
            | OpMarker::Delete { ref path, .. }
            | OpMarker::SetData { ref path, .. }
            | OpMarker::Exists { ref path }
            | OpMarker::GetData { ref path }
            | OpMarker::GetChildren { ref path } => path,
        }
    }
}

/// Maps one constituent's result inside a multi batch. Batched reads act as
/// assertions, so their absent target is the one benign code they share.
pub(crate) fn multi(
    marker: &OpMarker,
    res: Result<Response, ZkError>,
) -> Result<Result<MultiResponse, error::Multi>, Error> {
    // Outcomes specific to batch failure handling.
    match res {
        Err(ZkError::Ok) => return Ok(Err(error::Multi::RolledBack)),
        // The server reports an operation that was skipped because an earlier
        // operation in the batch failed as RuntimeInconsistency.
        Err(ZkError::RuntimeInconsistency) => return Ok(Err(error::Multi::Skipped)),
        _ => (),
    }

    Ok(match *marker {
        OpMarker::Create { ref path } => create(path, res)?
            .map(MultiResponse::Create)
            .map_err(|err| err.into()),
        OpMarker::Delete { ref path, version } => delete(path, version, res)?
            .map(|_| MultiResponse::Remove)
            .map_err(|err| err.into()),
        OpMarker::SetData { ref path, version } => set_data(path, version, res)?
            .map(MultiResponse::Set)
            .map_err(|err| err.into()),
        OpMarker::Exists { ref path } => match exists(path, res)? {
            Some(stat) => Ok(MultiResponse::Exists(stat)),
            None => Err(error::Multi::NoNode),
        },
        OpMarker::GetData { ref path } => match get_data(path, res)? {
            Some((bytes, stat)) => Ok(MultiResponse::Get(bytes, stat)),
            None => Err(error::Multi::NoNode),
        },
        OpMarker::GetChildren { ref path } => match get_children(path, res)? {
            Some(children) => Ok(MultiResponse::GetChildren(children)),
            None => Err(error::Multi::NoNode),
        },
    })
}

/// Total version of [`multi`] for the no-throw batch form: codes the try-
/// variants would raise are folded into [`error::Multi::Other`] instead.
pub(crate) fn multi_total(
    marker: &OpMarker,
    res: Result<Response, ZkError>,
) -> Result<MultiResponse, error::Multi> {
    match multi(marker, res) {
        Ok(outcome) => outcome,
        Err(err) => Err(error::Multi::Other(
            err.code().unwrap_or(ZkError::MarshallingError),
        )),
    }
}

fn multi_parts(
    markers: &[OpMarker],
    res: Result<Response, ZkError>,
) -> Result<Vec<Result<Response, ZkError>>, Error> {
    match res {
        Ok(Response::Multi(parts)) if parts.len() == markers.len() => Ok(parts),
        Ok(r) => Err(Error::Protocol {
            op: "multi",
            detail: format!("expected {} batch results, got {:?}", markers.len(), r),
        }),
        // The whole batch was answered with a single code, without
        // per-operation results. Transport conditions look like this.
        Err(code) => Err(Error::keeper(
            "multi",
            markers.first().map_or("/", OpMarker::path),
            code,
        )),
    }
}

fn collect<F>(markers: &[OpMarker], parts: Vec<Result<Response, ZkError>>, mut map: F) -> MultiOutcome
where
    F: FnMut(usize, &OpMarker, Result<Response, ZkError>) -> Result<MultiResponse, error::Multi>,
{
    let mut results = Vec::with_capacity(parts.len());
    let mut code = ZkError::Ok;
    let mut failed_index = None;
    for (index, (marker, part)) in markers.iter().zip(parts).enumerate() {
        let mapped = map(index, marker, part);
        if let Err(ref err) = mapped {
            if err.is_failure() && failed_index.is_none() {
                failed_index = Some(index);
                code = err.code();
            }
        }
        results.push(mapped);
    }
    MultiOutcome {
        code,
        failed_index,
        results,
    }
}

/// Interprets a whole batch response for `try_multi`: benign constituent
/// failures become the outcome, unexpected codes are raised with the failing
/// operation's position and path.
pub(crate) fn multi_outcome(
    markers: &[OpMarker],
    res: Result<Response, ZkError>,
) -> Result<MultiOutcome, Error> {
    let parts = multi_parts(markers, res)?;
    let mut raised = None;
    let outcome = collect(markers, parts, |index, marker, part| {
        match multi(marker, part) {
            Ok(mapped) => mapped,
            Err(err) => {
                let code = err.code().unwrap_or(ZkError::MarshallingError);
                if raised.is_none() {
                    raised = Some(match err {
                        Error::Keeper { code, .. } => Error::Multi {
                            index,
                            path: marker.path().to_string(),
                            code,
                        },
                        other => other,
                    });
                }
                Err(error::Multi::Other(code))
            }
        }
    });
    match raised {
        Some(err) => Err(err),
        None => Ok(outcome),
    }
}

/// Interprets a whole batch response for the no-throw form. Never raises:
/// whatever happened is expressed in the outcome's code and results.
pub(crate) fn multi_outcome_total(
    markers: &[OpMarker],
    res: Result<Response, ZkError>,
) -> MultiOutcome {
    let parts = match multi_parts(markers, res) {
        Ok(parts) => parts,
        Err(err) => {
            return MultiOutcome {
                code: match err {
                    Error::Protocol { .. } => ZkError::MarshallingError,
                    other => other.code().unwrap_or(ZkError::SystemError),
                },
                failed_index: None,
                results: Vec::new(),
            }
        }
    };
    collect(markers, parts, |_, marker, part| multi_total(marker, part))
}

/// Interprets a whole batch response for the throwing `multi`: any failed
/// constituent, benign or not, is raised with its position and path.
pub(crate) fn multi_applied(
    markers: &[OpMarker],
    res: Result<Response, ZkError>,
) -> Result<Vec<MultiResponse>, Error> {
    let outcome = multi_outcome(markers, res)?;
    if let Some(index) = outcome.failed_index {
        return Err(Error::Multi {
            index,
            path: markers[index].path().to_string(),
            code: outcome.code,
        });
    }
    let mut responses = Vec::with_capacity(outcome.results.len());
    for (index, mapped) in outcome.results.into_iter().enumerate() {
        match mapped {
            Ok(r) => responses.push(r),
            Err(err) => {
                return Err(Error::Protocol {
                    op: "multi",
                    detail: format!("outcome {} at index {} of an applied batch", err, index),
                })
            }
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_swallows_its_benign_codes() {
        for (code, want) in [
            (ZkError::NoNode, error::Create::NoNode),
            (ZkError::NodeExists, error::Create::NodeExists),
            (
                ZkError::NoChildrenForEphemerals,
                error::Create::NoChildrenForEphemerals,
            ),
        ] {
            let out = create("/x", Err(code)).unwrap();
            assert_eq!(out, Err(want));
        }
    }

    #[test]
    fn create_raises_everything_else() {
        let err = create("/x", Err(ZkError::NoAuth)).unwrap_err();
        assert_eq!(err.code(), Some(ZkError::NoAuth));
        let err = create("/x", Err(ZkError::SessionExpired)).unwrap_err();
        assert!(err.is_session_expired());
    }

    #[test]
    fn delete_bad_version_reports_expected_version() {
        let out = delete("/x", 7, Err(ZkError::BadVersion)).unwrap();
        assert_eq!(out, Err(error::Delete::BadVersion { expected: 7 }));
    }

    #[test]
    fn reads_fold_no_node_into_none() {
        assert_eq!(exists("/x", Err(ZkError::NoNode)).unwrap(), None);
        assert_eq!(get_data("/x", Err(ZkError::NoNode)).unwrap(), None);
        assert_eq!(get_children("/x", Err(ZkError::NoNode)).unwrap(), None);
    }

    #[test]
    fn reads_raise_recoverable_codes_for_the_caller_to_retry() {
        let err = get_data("/x", Err(ZkError::ConnectionLoss)).unwrap_err();
        assert_eq!(err.code(), Some(ZkError::ConnectionLoss));
    }

    #[test]
    fn multi_maps_rollback_and_skip_markers() {
        let marker = OpMarker::Create {
            path: "/x".to_string(),
        };
        assert_eq!(
            multi(&marker, Err(ZkError::Ok)).unwrap(),
            Err(error::Multi::RolledBack)
        );
        assert_eq!(
            multi(&marker, Err(ZkError::RuntimeInconsistency)).unwrap(),
            Err(error::Multi::Skipped)
        );
    }

    #[test]
    fn multi_raises_unexpected_codes_for_the_failing_op() {
        let marker = OpMarker::Delete {
            path: "/x".to_string(),
            version: -1,
        };
        let err = multi(&marker, Err(ZkError::NoAuth)).unwrap_err();
        assert_eq!(err.code(), Some(ZkError::NoAuth));
    }

    fn markers(paths: &[&str]) -> Vec<OpMarker> {
        paths
            .iter()
            .map(|path| OpMarker::Create {
                path: path.to_string(),
            })
            .collect()
    }

    #[test]
    fn aborted_batch_reports_position_and_rollbacks() {
        let markers = markers(&["/a", "/b", "/c"]);
        let parts = vec![
            Err(ZkError::Ok),
            Err(ZkError::NodeExists),
            Err(ZkError::RuntimeInconsistency),
        ];
        let outcome = multi_outcome(&markers, Ok(Response::Multi(parts))).unwrap();
        assert_eq!(outcome.code, ZkError::NodeExists);
        assert_eq!(outcome.failed_index, Some(1));
        assert_eq!(
            outcome.results,
            vec![
                Err(error::Multi::RolledBack),
                Err(error::Multi::Create(error::Create::NodeExists)),
                Err(error::Multi::Skipped),
            ]
        );
    }

    #[test]
    fn batch_with_unexpected_code_raises_the_failing_op() {
        let markers = markers(&["/a", "/b"]);
        let parts = vec![Err(ZkError::Ok), Err(ZkError::NoAuth)];
        let err = multi_outcome(&markers, Ok(Response::Multi(parts))).unwrap_err();
        match err {
            Error::Multi { index, path, code } => {
                assert_eq!(index, 1);
                assert_eq!(path, "/b");
                assert_eq!(code, ZkError::NoAuth);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn total_batch_mapping_folds_transport_failure_into_the_code() {
        let markers = markers(&["/a"]);
        let outcome = multi_outcome_total(&markers, Err(ZkError::ConnectionLoss));
        assert_eq!(outcome.code, ZkError::ConnectionLoss);
        assert_eq!(outcome.failed_index, None);
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn applied_batch_unwraps_every_response() {
        let markers = vec![
            OpMarker::Create {
                path: "/a".to_string(),
            },
            OpMarker::Delete {
                path: "/b".to_string(),
                version: -1,
            },
        ];
        let parts = vec![
            Ok(Response::String("/a".to_string())),
            Ok(Response::Empty),
        ];
        let responses = multi_applied(&markers, Ok(Response::Multi(parts))).unwrap();
        assert_eq!(
            responses,
            vec![
                MultiResponse::Create("/a".to_string()),
                MultiResponse::Remove,
            ]
        );
    }

    #[test]
    fn multi_total_never_raises() {
        let marker = OpMarker::SetData {
            path: "/x".to_string(),
            version: -1,
        };
        assert_eq!(
            multi_total(&marker, Err(ZkError::NoAuth)),
            Err(error::Multi::Other(ZkError::NoAuth))
        );
        assert_eq!(
            multi_total(&marker, Err(ZkError::BadVersion)),
            Err(error::Multi::SetData(error::SetData::BadVersion {
                expected: -1
            }))
        );
    }
}
