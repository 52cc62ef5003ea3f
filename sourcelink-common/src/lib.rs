//! This crate defines [structs for the on-disk PE and portable PDB formats](format/index.html)
//! as well as [some common traits](traits/index.html) used by related crates.
//!
//! You probably don't want to use this crate directly, the `portable-pdb` crate provides the
//! actual functionality of reading images and debug metadata using the structs defined here.

pub mod format;
pub mod traits;
