pub mod digest;
mod store;

pub use store::{DbError, Store};
