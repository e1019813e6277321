//! Live span, stripe and volume objects built from the serialized layouts.

pub mod cache;
pub mod span;
pub mod stripe;
