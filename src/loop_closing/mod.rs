//! Loop closure: candidate search over committed keyframes and scan
//! registration to verify and refine each candidate.

pub mod detector;
pub mod registration;

pub use detector::{DistanceLoopDetector, LoopCandidate, LoopDetector, LoopDetectorConfig};
pub use registration::{IcpConfig, PointToPointIcp, RegistrationResult, ScanRegistration};
