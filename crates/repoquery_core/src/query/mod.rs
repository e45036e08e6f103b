//! Query declaration and resolution.
//!
//! # Responsibility
//! - Turn method names and query text into `QueryDescriptor`s at startup.
//! - Define call-time inputs: arguments, sort orders, page requests.

pub mod args;
pub mod declared;
pub mod derive;
pub mod descriptor;
mod lexer;
pub mod page;
pub mod registry;

pub use args::Args;
pub use descriptor::{LockMode, QueryDescriptor, ResultShape};
pub use page::{Direction, Order, Page, PageRequest, Sort};
pub use registry::{DeclaredQuery, DerivedQuery, QueryRegistry, RegistryBuilder};
