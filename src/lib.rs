//! Topology, routing and optimizer composition for 3D-parallel training.
//!
//! Worker ranks are arranged on a (pipeline, data, tensor) mesh. The crate
//! builds the communication groups each rank needs, routes per-step inputs
//! so only the owning pipeline stage materializes them, and composes a base
//! optimizer with gradient accumulation and optimizer-state sharding.

pub mod distributed;

pub mod training {
    pub mod accumulator;
    pub mod adamw;
    pub mod builder;
    pub mod gradient_accumulation;
    pub mod optimizer;
    pub mod parameter;
    pub mod zero;
}

pub mod data {
    pub mod collator;
    pub mod packing;
    pub mod sampler;
    pub mod synthetic;
}

pub mod utils {
    pub mod checkpoint;
    pub mod config;
    pub mod digest;
    pub mod error;
    pub mod logging;
}

pub use distributed::{
    CollectiveCommunicator, CommunicationBackend, LocalBackend, LocalWorld, MeshCoordinate,
    MeshShape, ProcessGroup, TopologyBuilder, TopologyDescriptor,
};
pub use utils::error::{MeshError, Result};
