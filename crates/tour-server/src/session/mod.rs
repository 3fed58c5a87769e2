//! Session management: pty lifecycle and the id → session registry.

#[cfg(test)]
pub(crate) mod mock;
pub mod pty;
pub mod registry;

pub use pty::{NativePtyBackend, PtyBackend};
pub use registry::{RegistrySettings, SessionRegistry};
