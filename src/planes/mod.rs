//! Plane landmarks: orientation classes, the registry, data association and
//! the mapper that writes plane observations into the graph.

pub mod association;
pub mod class;
pub mod mapper;
pub mod registry;

pub use association::{associate_plane, mahalanobis_distance, AssociationConfig};
pub use class::{structure_plane_measurement, ClassificationMode, PlaneClass};
pub use mapper::{ObservedPlane, PlaneMapper, PlaneMapperConfig};
pub use registry::{PlaneLandmark, PlaneObservation, PlaneRegistry};
