//! Common types shared by the key-pool workspace

mod error;
mod keys;
mod secret;

pub use error::{Error, Result};
pub use keys::parse_key_list;
pub use secret::Secret;
