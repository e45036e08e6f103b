//! Entity model, values and projection shapes.
//!
//! # Responsibility
//! - Define the entity contract and metadata the query layer compiles from.
//! - Provide the two domain entities (`Member`, `Team`) and their views.
//!
//! # Invariants
//! - Every entity has a surrogate numeric key assigned by the store.
//! - The Team -> members side of the relation is derived, never persisted.

pub mod audit;
pub mod entity;
pub mod member;
pub mod projection;
pub mod team;
pub mod value;
