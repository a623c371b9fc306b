//! RGB-D keyframe-graph local mapping backend.
//!
//! Owns the persistent map graph a tracker feeds keyframes into: the
//! keyframe/map-point arena ([`map`]), the covisibility graph and spanning
//! tree derived from shared observations ([`covisibility`], [`spanning_tree`]),
//! the bag-of-words keyframe database used for loop/relocalization candidate
//! proposals ([`keyframe_database`]), the geometric/descriptor matcher
//! ([`matcher`]), and the [`local_mapper::LocalMapper`] work loop that ties
//! them together: linking new keyframes into the graph, culling unreliable
//! map points, triangulating new ones, fusing redundant observations, running
//! local bundle adjustment through a pluggable [`optimizer::OptimizerBridge`],
//! and culling redundant keyframes.
//!
//! Loop closure and full global bundle adjustment are out of scope; this
//! crate only owns the one seam a loop closer needs
//! ([`local_mapper::LoopCloserSink`]).

mod config;
mod coordinator;
mod covisibility;
mod error;
mod frame;
mod geometry;
mod ids;
mod keyframe;
mod keyframe_database;
mod local_mapper;
mod map;
mod map_point;
mod matcher;
mod optimizer;
mod pose;
mod spanning_tree;

pub use config::LocalMapperConfig;
pub use coordinator::Coordinator;
pub use error::{SlamError, SlamResult};
pub use frame::{Frame, FrameMapPointSlot, FrustumCandidate};
pub use geometry::{CameraIntrinsics, Descriptor256, Keypoint, ScaleLevels};
pub use ids::{KeyFrameId, MapPointId, WordId};
pub use keyframe::{BowVector, Connections, FeatureGrid, FeatureVector, KeyFrame};
pub use keyframe_database::{bow_score, KeyFrameDatabase};
pub use local_mapper::{LocalMapper, LoopCloserSink, NullLoopCloserSink};
pub use map::Map;
pub use map_point::MapPoint;
pub use matcher::{compute_f12, Matcher, Sim3};
pub use optimizer::{optimization_failed, GaussNewtonLocalBundleAdjuster, LocalBundleAdjustmentReport, OptimizerBridge};
pub use pose::{skew_symmetric, Pose3};
pub use spanning_tree::SpanningTree;

pub use covisibility::CovisibilityGraph;
