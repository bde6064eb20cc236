//! # ec2-agent-id
//!
//! Typed identifiers for provider resources tracked by the build-agent
//! lifecycle controller.
//!
//! ## Design Principles
//!
//! - Identifiers are assigned by the provider, never generated locally
//! - All identifiers have a canonical string form with strict parsing
//! - Identifiers round-trip through `Display`/`FromStr` and serde
//! - Identifiers are typed so an instance id is never mistaken for a
//!   spot request id
//!
//! ## ID Format
//!
//! Provider identifiers use a prefixed format: `{prefix}-{suffix}`
//!
//! Examples:
//! - `i-0abc123def4567890` (instance, 17 hex digits)
//! - `i-1a2b3c4d` (legacy instance, 8 hex digits)
//! - `sir-08b93456` (spot instance request)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
