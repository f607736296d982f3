//! # hopper-id
//!
//! Typed identifiers for the connections a proxy session juggles.
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `client_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `link_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! The prefix keeps a client identity from being mistaken for a backend
//! link identity in logs, and the ULID keeps them sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
