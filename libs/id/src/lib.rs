//! # halyard-id
//!
//! Typed identifiers used by the halyard scheduler.
//!
//! Every identifier is `{prefix}_{ulid}`:
//!
//! - `task_01HV4Z2WQXKJNM8GPQY6VBKC3D` for launched tasks
//! - `sess_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for subscription sessions
//! - `req_01HV4Z4NYPLTRS0JTUA8XDME5F` for admin API requests
//!
//! ULIDs sort by creation time, which the scale controller relies on when
//! choosing the oldest tasks to terminate.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
