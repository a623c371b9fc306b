use thiserror::Error;
use crate::{KeyFrameId, MapPointId};

/// The narrow set of caller-visible failures in the mapping backend.
///
/// Geometric rejection, precondition violations and concurrency aborts are
/// not errors (see the module docs on `LocalMapper`) — they are expected
/// control flow and never surface here.
#[derive(Error, Debug)]
pub enum SlamError {
    #[error("keyframe {0:?} is not present in the map")]
    UnknownKeyFrame(KeyFrameId),
    #[error("map point {0:?} is not present in the map")]
    UnknownMapPoint(MapPointId),
    #[error("local bundle adjustment failed to converge")]
    OptimizationFailed,
}

pub type SlamResult<T> = Result<T, SlamError>;
