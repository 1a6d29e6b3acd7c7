//! Cross-component services: the process-wide session registry.

pub mod registry;
