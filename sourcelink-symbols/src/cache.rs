use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use once_cell::sync::OnceCell;
use sourcelink_common::traits::{basename, Module};
use tracing::trace;

use crate::{
    Breakpoint, DebugInfoLoader, DebugInfoSource, FunctionId, LoadError, ModuleDebugInfo,
    ModuleKey,
};

/// The loaded debug information of one module.
#[derive(Debug)]
pub struct CacheEntry {
    pub module: ModuleKey,
    pub code_file: String,
    debug_info: Result<ModuleDebugInfo, LoadError>,
}

impl CacheEntry {
    pub fn debug_info(&self) -> Result<&ModuleDebugInfo, &LoadError> {
        self.debug_info.as_ref()
    }

    pub fn source(&self) -> DebugInfoSource {
        match &self.debug_info {
            Ok(info) => info.source,
            Err(_) => DebugInfoSource::None,
        }
    }

    /// The source location of `il_offset` within the method with metadata token `token`.
    pub fn source_location(&self, token: u32, il_offset: u32) -> Option<&Breakpoint> {
        self.debug_info.as_ref().ok()?.source_location(token, il_offset)
    }
}

/// Statistics on the debug information of a module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleStats {
    /// Which stage supplied debug information.
    pub source: DebugInfoSource,
    /// The module has a source-link table, whether or not it could be parsed.
    pub has_source_link: bool,
    /// Debug information was found but could not be parsed.
    pub malformed_metadata: bool,
    /// Loading failed outright.
    pub load_failed: bool,
    pub documents: usize,
    pub methods: usize,
}

type CachedEntry = Arc<OnceCell<Arc<CacheEntry>>>;

/// Loads and caches module debug information, and the strings derived from it.
///
/// Each module is loaded at most once. Concurrent callers asking for the same module wait for
/// the single load in progress; callers asking for different modules don't wait for each other.
pub struct ModuleResolutionCache {
    loader: Box<dyn DebugInfoLoader>,
    modules: Mutex<HashMap<ModuleKey, CachedEntry>>,
    signatures: RwLock<HashMap<FunctionId, Arc<str>>>,
    paths: RwLock<HashMap<(ModuleKey, String), Arc<str>>>,
}

impl fmt::Debug for ModuleResolutionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleResolutionCache")
            .field("modules", &self.len())
            .finish_non_exhaustive()
    }
}

impl ModuleResolutionCache {
    pub fn new<L: DebugInfoLoader + 'static>(loader: L) -> ModuleResolutionCache {
        ModuleResolutionCache {
            loader: Box::new(loader),
            modules: Mutex::new(HashMap::new()),
            signatures: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
        }
    }

    /// The debug information of `module`, loading it if this is the first request.
    ///
    /// Dynamic modules are never loaded or cached.
    pub fn ensure(&self, module: &dyn Module) -> Arc<CacheEntry> {
        let key = ModuleKey::for_module(module);
        if module.is_dynamic() {
            trace!("not loading dynamic module {key}");
            return Arc::new(CacheEntry {
                module: key,
                code_file: module.code_file().into_owned(),
                debug_info: Ok(ModuleDebugInfo::none(vec![])),
            });
        }

        // Clone the cell out so the map lock isn't held while loading.
        let cell = self
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        cell.get_or_init(|| {
            trace!("loading debug information for {key}");
            Arc::new(CacheEntry {
                debug_info: self.loader.load(module),
                code_file: module.code_file().into_owned(),
                module: key,
            })
        })
        .clone()
    }

    /// The formatted signature of `function`, formatting it with `format` the first time.
    pub fn signature<F>(&self, function: &FunctionId, format: F) -> Arc<str>
    where
        F: FnOnce() -> String,
    {
        if let Some(signature) = self
            .signatures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(function)
        {
            return signature.clone();
        }
        let signature = Arc::from(format());
        self.signatures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(function.clone())
            .or_insert(signature)
            .clone()
    }

    /// Where the document `raw` of `entry`'s module can be retrieved from.
    ///
    /// Documents resolved while loading are returned as is. Others go through the module's
    /// source-link table once and are remembered. Without a table, `raw` is returned unchanged.
    pub fn resolve_path(&self, entry: &CacheEntry, raw: &str) -> Arc<str> {
        let info = match entry.debug_info() {
            Ok(info) => info,
            Err(_) => return Arc::from(raw),
        };
        if let Some(resolved) = info.resolved_path(raw) {
            return Arc::from(resolved);
        }
        let remap = match info.remap() {
            Some(remap) => remap,
            None => return Arc::from(raw),
        };

        let key = (entry.module.clone(), raw.to_owned());
        if let Some(resolved) = self
            .paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return resolved.clone();
        }
        let resolved = Arc::from(remap.resolve(raw));
        self.paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(resolved)
            .clone()
    }

    /// Collect statistics on the loaded modules.
    ///
    /// Keys are the file name of the module (code_file's file name). Modules still loading are
    /// left out.
    pub fn stats(&self) -> HashMap<String, ModuleStats> {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|cell| cell.get())
            .map(|entry| {
                let mut stats = ModuleStats::default();
                match entry.debug_info() {
                    Ok(info) => {
                        stats.source = info.source;
                        stats.has_source_link = info.has_source_link();
                        stats.malformed_metadata = info.is_malformed();
                        stats.documents = info.document_count();
                        stats.methods = info.method_count();
                    }
                    Err(e) => {
                        stats.load_failed = true;
                        stats.malformed_metadata = matches!(e, LoadError::MetadataMalformed(_));
                    }
                }
                (basename(&entry.code_file).to_owned(), stats)
            })
            .collect()
    }

    /// Number of modules loaded or loading.
    pub fn len(&self) -> usize {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything. Modules requested afterwards are loaded again.
    pub fn clear(&self) {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.signatures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
