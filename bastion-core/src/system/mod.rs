//! Low-level plumbing shared by the forwarding engine: reusable copy
//! buffers, per-operation I/O deadlines, accept-time IP filtering and
//! bind-conflict diagnostics.

pub mod acl;
pub mod buffer_pool;
pub mod deadline;
pub mod diagnostics;
