//! `jobwarden-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error model, optimistic-concurrency helpers, the structural
//! map encoding and the clock abstraction.

pub mod aggregate;
pub mod encoding;
pub mod error;
pub mod id;
pub mod time;
pub mod value_object;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use encoding::{StructMap, StructuralEncoding};
pub use error::{DomainError, DomainResult};
pub use id::{ChainId, JobId};
pub use time::{Clock, FixedClock, SystemClock, Timestamp};
pub use value_object::ValueObject;
