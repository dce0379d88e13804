//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. In this workspace
/// they are only obtainable through validating constructors; deserialization
/// goes through the same validation so an invalid value can never be observed.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
