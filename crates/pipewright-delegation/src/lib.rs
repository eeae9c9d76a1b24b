//! Delegation resolution.
//!
//! A delegation lets `to_login` act as `from_login` for a date window and a
//! set of work types. The [`DelegationResolver`] fronts a remote
//! [`DelegationSource`] with an LRU cache whose entries expire after a TTL.

pub mod delegations;
pub mod error;
pub mod resolver;
pub mod source;

pub use delegations::Delegations;
pub use error::{DelegationError, Result};
pub use resolver::DelegationResolver;
pub use source::{
    DelegationRequest, DelegationSource, HttpDelegationSource, StaticDelegationSource,
};
