//! Identity side: sources of X.509 SVIDs and the manager tracking them.

pub mod manager;
pub mod pem_dir;
pub mod pending;
pub mod source;
#[cfg(feature = "workload-api")]
pub mod workload_api;

pub use manager::{IdentityManager, IdentityState, RefreshOutcome, WatchHandle};
pub use pem_dir::PemDirSource;
pub use pending::{PendingRotation, PendingSlot};
pub use source::{CredentialStream, IdentitySource};
#[cfg(feature = "workload-api")]
pub use workload_api::WorkloadApiSource;
