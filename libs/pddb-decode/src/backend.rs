pub mod basis;
pub use basis::*;
pub mod dictionary;
pub use dictionary::*;
pub mod key;
pub use key::*;
pub mod pagetable;
pub use pagetable::*;
pub mod fastspace;
pub use fastspace::*;
pub mod types;
pub use types::*;
pub mod image;
pub use image::*;

// key hierarchy
pub mod keys;
pub use keys::*;
pub mod keyfile;
pub use keyfile::*;
pub mod crypto;
pub use crypto::*;

// local to the backend
mod bcrypt;
pub(crate) use bcrypt::*;
mod murmur3;
pub(crate) use murmur3::*;
