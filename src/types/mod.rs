pub mod event;
pub mod ingester;
pub mod jsonpath;
pub mod mapping;
pub mod observation;

pub use event::{Category, DedupHint, Event, ResourceRef, Severity};
pub use ingester::{GvrRef, Ingester, IngesterKind, IngesterSpec, ObservationMapping, ObservationMappingSpec};
pub use mapping::EventMapping;
pub use observation::{Observation, ObservationResource, ObservationSpec};
