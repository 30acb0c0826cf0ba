//! Domain layer - Core provisioning logic and port definitions
//!
//! This module defines the annotation protocol, the change events, the name
//! templater and the traits (ports) that adapters implement, following
//! hexagonal architecture principles.

pub mod annotations;
pub mod events;
pub mod ports;
pub mod quantity;
pub mod template;

pub use annotations::{AnnotationSet, TransientScope};
pub use events::{ChangeType, ClaimEvent, ClaimPhase, VolumeEvent, VolumePhase};
pub use ports::*;
