//! Service layer for crmgate-sync

pub mod access;
pub mod batch;
pub mod locks;
pub mod meta;
pub mod pipeline;
pub mod resolver;
pub mod tags;

pub use access::{evaluate, evaluate_layered, resolve_redirect, Access, AccessRule, DenyReason, RedirectTarget, Viewer};
pub use batch::{BatchController, BatchOperation, BatchRunner};
pub use locks::{ContactLockRegistry, LockAction, LockConflict};
pub use meta::{MetaSync, SyncContext};
pub use pipeline::{Pipeline, StepOutcome};
pub use resolver::ContactResolver;
pub use tags::TagSynchronizer;
