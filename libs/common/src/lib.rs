pub mod id;

pub use id::{prefix, prefixed_ulid};
