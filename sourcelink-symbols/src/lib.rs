//! A library for mapping managed stack frames to source files, lines and source-link URLs.
//!
//! The primary entry point is [`ModuleResolutionCache`], which loads debug information for a
//! module at most once and keeps it for the life of the process (or until
//! [`ModuleResolutionCache::clear`] is called). Loading is delegated to a
//! [`DebugInfoLoader`]; [`ModuleDebugInfoLoader`] is the standard one, which tries, in order:
//!
//! 1. a portable PDB embedded in the module's own image,
//! 2. a companion portable PDB found by the [`NativeSymbolService`],
//! 3. the [`NativeSymbolService`] itself, which enumerates source files and can resolve
//!    addresses on demand but exposes no per-method tables.
//!
//! Once loaded, a [`CacheEntry`] answers two questions: which source location an IL offset in a
//! method maps to ([`SourceLocationTable`]) and where a build-time document path can be
//! retrieved from ([`SourceRemap`]).
//!
//! # Examples
//!
//! ```no_run
//! use sourcelink_common::traits::SimpleModule;
//! use sourcelink_symbols::{
//!     FileModuleReader, ModuleDebugInfoLoader, ModuleResolutionCache, NativeSymbolService,
//!     SymbolOptions, SymbolPathResolver,
//! };
//! use std::sync::Arc;
//!
//! let native = Arc::new(NativeSymbolService::new(SymbolPathResolver::default()));
//! native.initialize(Some("C:\\symbols"), SymbolOptions::default()).ok();
//! let loader = ModuleDebugInfoLoader::new(FileModuleReader, native.clone());
//! let cache = ModuleResolutionCache::new(loader);
//!
//! let module = SimpleModule::new("C:\\app\\Sample.dll", 0x7ff6_1000_0000);
//! let entry = cache.ensure(&module);
//! if let Some(location) = entry.source_location(0x0600_0001, 0x12) {
//!     println!("{}:line {}", cache.resolve_path(&entry, &location.file), location.line);
//! }
//! ```

#![warn(missing_debug_implementations)]

use std::fmt;

use debugid::DebugId;
use sourcelink_common::traits::Module;

mod cache;
mod loader;
mod native;
mod remap;
mod table;

pub use crate::cache::*;
pub use crate::loader::*;
pub use crate::native::*;
pub use crate::remap::*;
pub use crate::table::*;

pub use sourcelink_common::traits::SimpleModule;

/// Identifies a loaded module for as long as the process runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModuleKey {
    /// The module's load address.
    Loaded(u64),
    /// The module's file and build, for hosts that don't know load addresses.
    File {
        code_file: String,
        debug_id: Option<DebugId>,
    },
}

impl ModuleKey {
    pub fn for_module(module: &dyn Module) -> ModuleKey {
        match module.base_address() {
            0 => ModuleKey::File {
                code_file: module.code_file().into_owned(),
                debug_id: module.debug_identifier(),
            },
            base => ModuleKey::Loaded(base),
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKey::Loaded(base) => write!(f, "{base:#x}"),
            ModuleKey::File {
                code_file,
                debug_id: Some(id),
            } => write!(f, "{code_file} ({})", id.breakpad()),
            ModuleKey::File { code_file, .. } => f.write_str(code_file),
        }
    }
}

/// A method within a module, named by its metadata token.
///
/// Instantiations of a generic method or type share one token, so the declaring type and
/// parameter types are part of the identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionId {
    pub module: ModuleKey,
    pub token: u32,
    pub declaring_type: Option<String>,
    pub parameter_types: Vec<String>,
}

impl FunctionId {
    pub fn new(module: ModuleKey, token: u32) -> FunctionId {
        FunctionId {
            module,
            token,
            declaring_type: None,
            parameter_types: vec![],
        }
    }

    pub fn instantiation<I>(
        mut self,
        declaring_type: Option<&str>,
        parameter_types: I,
    ) -> FunctionId
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.declaring_type = declaring_type.map(str::to_owned);
        self.parameter_types = parameter_types.into_iter().map(Into::into).collect();
        self
    }
}

/// The MethodDef row a token refers to, or `None` for any other kind of token.
pub fn method_def_row(token: u32) -> Option<u32> {
    let row = token & 0x00ff_ffff;
    if token & 0xff00_0000 == sourcelink_common::format::METHOD_DEF_TOKEN_TYPE && row != 0 {
        Some(row)
    } else {
        None
    }
}

/// Reasons a module has less debug information than it could have.
///
/// Apart from [`LoadError::ModuleLoadFailed`], these are recorded on an otherwise successful
/// [`ModuleDebugInfo`] so frames still render with whatever was found.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("failed to read {path}: {reason}")]
    ModuleLoadFailed { path: String, reason: String },
    #[error("malformed debug metadata: {0}")]
    MetadataMalformed(#[from] portable_pdb::Error),
    #[error("malformed source link table: {0}")]
    RemapMalformed(String),
    #[error("native symbol service unavailable: {0}")]
    NativeServiceUnavailable(#[from] NativeError),
}

impl LoadError {
    /// A short name for the kind of failure, for logs and statistics.
    pub fn name(&self) -> &'static str {
        match self {
            LoadError::ModuleLoadFailed { .. } => "ModuleLoadFailed",
            LoadError::MetadataMalformed(_) => "MetadataMalformed",
            LoadError::RemapMalformed(_) => "RemapMalformed",
            LoadError::NativeServiceUnavailable(_) => "NativeServiceUnavailable",
        }
    }
}

#[cfg(test)]
#[ctor::ctor]
unsafe fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_module_key() {
        assert_eq!(
            ModuleKey::for_module(&("C:\\app\\Sample.dll", 0x1000)),
            ModuleKey::Loaded(0x1000)
        );
        let key = ModuleKey::for_module(&SimpleModule::new("/app/Sample.dll", 0));
        assert_eq!(
            key,
            ModuleKey::File {
                code_file: String::from("/app/Sample.dll"),
                debug_id: None,
            }
        );
        assert_eq!(key.to_string(), "/app/Sample.dll");
        assert_eq!(ModuleKey::Loaded(0x1000).to_string(), "0x1000");
    }

    #[test]
    fn test_method_def_row() {
        assert_eq!(method_def_row(0x0600_0001), Some(1));
        assert_eq!(method_def_row(0x0600_1234), Some(0x1234));
        assert_eq!(method_def_row(0x0600_0000), None);
        // TypeDef and MemberRef tokens have no sequence points.
        assert_eq!(method_def_row(0x0200_0001), None);
        assert_eq!(method_def_row(0x0a00_0001), None);
    }
}
