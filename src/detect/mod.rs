mod backend;
mod backends;
mod result;

pub use backend::DetectorBackend;
pub use backends::ReplayBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{filter_by_confidence, BBox, Detection};
