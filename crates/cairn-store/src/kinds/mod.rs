//! Concrete resource kinds.

pub mod key;
pub mod user;

pub use key::{KeyFields, Keys};
pub use user::{UserFields, Users};
