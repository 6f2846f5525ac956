mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectorBackend, SharedDetector};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::{SequenceBackend, StubBackend};
pub use registry::{build_detector, BackendRegistry};
pub use result::{filter_by_confidence, non_max_suppression, BoundingBox, ClassNames, Detection};
