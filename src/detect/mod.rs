mod backend;
mod backends;
mod nms;
mod registry;
mod result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, TractPlan};
pub use backends::{ScriptedBackend, StubBackend};
pub use nms::non_max_suppression;
pub use registry::{BackendHandle, BackendRegistry};
pub use result::{DetectParams, RawDetection};
