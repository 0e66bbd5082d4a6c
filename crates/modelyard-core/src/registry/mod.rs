//! Durable bookkeeping of every filesystem link the system creates.

mod link_registry;

pub use link_registry::{
    BrokenLink, BrokenReason, CascadeReport, HealthReport, HealthStatus, LinkRecord, LinkRegistry,
    LinkSpec,
};
