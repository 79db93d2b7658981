//! Request handlers for document operations.

mod documents;

pub use documents::*;
