//! Offline decoder for Plausibly Deniable Database (PDDB) images.
//!
//! Given a raw image and the keys of one or more bases, this crate walks the page table,
//! the free space commit buffer, and every basis root, dictionary and key it can decrypt,
//! and collects what it finds into a [`DecodeReport`]. Keys either come from a key export
//! file ([`parse_keyfile`]) or are derived from a KEYROM dump and passwords
//! ([`decode_with_credentials`]).
//!
//! Nothing here writes to the image.

pub mod api;
pub use api::*;
pub mod backend;
pub mod decoder;
pub use decoder::*;
pub mod report;
pub use report::*;

pub use backend::{
    encode_keyfile, parse_keyfile, BasisKeyPair, BasisKeyring, KeyFileMode, KeyMaterial, KeyRom, Layout,
};

#[cfg(test)]
mod testimage;
