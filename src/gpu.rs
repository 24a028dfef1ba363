//! GPU device arbitration.
//!
//! A cluster-wide mutual-exclusion lock per GPU device, built on the
//! key-value store. Leases are time-bounded and renewable; a crashed holder's
//! lease expires and any waiter may take the slot over. Takeovers are
//! detected through a per-device generation counter that increases with every
//! fresh grant.

mod arbiter;
mod types;

pub use arbiter::{GpuArbiter, RenewalHandle};
pub use types::{GpuError, Lease};
