//! Clam: microVM sandbox control plane
//!
//! Clam decides what every sandbox in the fleet should be doing and keeps the
//! shared state consistent while nodes and control plane instances come and
//! go. It owns the sandbox lifecycle and fork tree, a leader-elected set of
//! reconciliation workers, per-sandbox event buffers with SSE framing, and
//! the replay bundles assembled from them.
//!
//! Everything outside the core is reached through narrow async traits:
//! repositories ([`repo`]), the shared [`store::EphemeralStore`], the
//! hypervisor [`node_client::NodeClient`], [`object_store::ObjectStorage`],
//! quotas, audit and billing. In-memory implementations of each back the
//! tests and the development worker binary.

pub mod audit;
pub mod backends;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod lifecycle;
pub mod model;
pub mod node_client;
pub mod object_store;
pub mod quota;
pub mod repo;
pub mod store;
pub mod worker;

pub use backends::{Backends, MemoryBackends};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ControlPlaneConfig, WorkerIntervals};
pub use error::{ControlError, ErrorCode, Result};
pub use events::{EventBuffer, EventKey, ReplayAssembler, ReplayBundle};
pub use lifecycle::{
    CreateSandboxParams, ForkSandboxParams, ForkTree, SandboxManager, StopDisposition,
    StopOutcome,
};
pub use model::{FailureReason, ReplayExpiry, Sandbox, SandboxStatus};
pub use quota::{OrgQuota, QuotaResolver};
pub use worker::{TickOutcome, Worker, WorkerScheduler, run_worker_tick};
