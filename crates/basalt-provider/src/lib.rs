#![forbid(unsafe_code)]

//! Provider contracts shared across basalt.
//!
//! The engines in `basalt-core` only talk to the host through these traits, so
//! the rest of the workspace can swap system integrations for mocks in tests.

pub mod devices;
pub mod mapper;

pub use devices::{DeviceNode, ModuleLoader, NodePermissions, SubsystemProbe};
pub use mapper::{
    CryptTarget, DiscardMode, LoopOptions, MapperProvider, MappingDescriptor, MappingKind,
    VerityTarget,
};
