//! Fixed-capacity storage management.
//!
//! The middlebox allocates its per-connection records from pools sized at
//! startup; running out of pool space is a load-shedding signal, never an
//! abort. [`Pool`] provides the generation-checked slot storage backing
//! those pools.
//!
//! [`Pool`]: struct.Pool.html

mod pool;

pub use pool::{Key, Pool};
