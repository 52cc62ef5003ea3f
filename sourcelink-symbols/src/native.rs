//! The native symbol resolution capability.
//!
//! Some modules ship classic PDBs, or have their debug information somewhere only a platform
//! symbol engine knows how to find. [`NativeResolver`] is the seam to such an engine, and
//! [`NativeSymbolService`] owns its process-wide lifecycle.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bitflags::bitflags;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use portable_pdb::PeImage;
use sourcelink_common::traits::{basename, strip_extension, Module};
use tracing::{debug, info, trace, warn};

bitflags! {
    /// Options handed to the native symbol engine when it is initialized.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SymbolOptions: u32 {
        const CASE_INSENSITIVE = 0x0000_0001;
        const UNDECORATE_NAMES = 0x0000_0002;
        const DEFERRED_LOADS = 0x0000_0004;
        const LOAD_LINES = 0x0000_0010;
        /// Report diagnostics while loading.
        const DEBUG = 0x8000_0000;
    }
}

impl SymbolOptions {
    pub fn for_verbosity(verbose: bool) -> SymbolOptions {
        let mut options = SymbolOptions::default();
        options.set(SymbolOptions::DEBUG, verbose);
        options
    }
}

impl Default for SymbolOptions {
    fn default() -> SymbolOptions {
        SymbolOptions::UNDECORATE_NAMES | SymbolOptions::DEFERRED_LOADS | SymbolOptions::LOAD_LINES
    }
}

/// What a native diagnostic is reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive)]
pub enum SymbolActionCode {
    DeferredSymbolLoadStart = 0x01,
    DeferredSymbolLoadComplete = 0x02,
    DeferredSymbolLoadFailure = 0x03,
    SymbolsUnloaded = 0x04,
    DuplicateSymbol = 0x05,
    ReadMemory = 0x06,
    DeferredSymbolLoadCancel = 0x07,
    SetOptions = 0x08,
    Event = 0x10,
    DeferredSymbolLoadPartial = 0x20,
    DebugInfo = 0x1000_0000,
    SourceServerInfo = 0x2000_0000,
    SourceServerEvent = 0x4000_0000,
}

/// A diagnostic message produced by the native symbol engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeDiagnostic {
    pub code: u32,
    pub message: String,
}

impl NativeDiagnostic {
    pub fn new(code: SymbolActionCode, message: &str) -> NativeDiagnostic {
        NativeDiagnostic {
            code: code as u32,
            message: message.to_owned(),
        }
    }

    /// The action code, if it is one we know.
    pub fn action(&self) -> Option<SymbolActionCode> {
        SymbolActionCode::from_u32(self.code)
    }
}

/// A source file known to the native engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeSourceFile {
    /// The path as recorded in the debug information.
    pub raw: String,
    /// Where the engine says the file can be found, after applying any source server mapping.
    pub resolved: String,
}

/// Errors from the native symbol engine.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum NativeError {
    #[error("the native symbol service has not been initialized")]
    NotInitialized,
    #[error("the native symbol service has been shut down")]
    ShutDown,
    #[error("{0} is not supported by this resolver")]
    Unsupported(&'static str),
    #[error("{call} failed with code {code:#x}")]
    CallFailed { call: &'static str, code: u32 },
    #[error("{0}")]
    Other(String),
}

/// An opaque handle to a module loaded into the native engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeModuleHandle(pub u64);

/// A native symbol engine.
///
/// Implementations are process-wide: the engine is initialized once and cleaned up once.
/// Enumerations return completed lists rather than calling back into the caller.
pub trait NativeResolver: Send + Sync {
    fn initialize(
        &self,
        search_path: Option<&str>,
        options: SymbolOptions,
    ) -> Result<(), NativeError>;
    fn cleanup(&self) -> Result<(), NativeError>;
    /// The path of a companion debug file for `module`, if the engine can find one.
    fn find_companion_metadata(&self, module: &dyn Module) -> Result<Option<PathBuf>, NativeError>;
    fn load_module(&self, module: &dyn Module) -> Result<NativeModuleHandle, NativeError>;
    fn unload_module(&self, handle: NativeModuleHandle) -> Result<(), NativeError>;
    fn enumerate_source_files(
        &self,
        handle: NativeModuleHandle,
    ) -> Result<Vec<NativeSourceFile>, NativeError>;
    /// The file and line containing the module-relative `offset`.
    fn resolve_address(
        &self,
        module: &dyn Module,
        offset: u64,
    ) -> Result<Option<(String, u32)>, NativeError>;
    /// Diagnostics produced since the last call.
    fn take_diagnostics(&self) -> Vec<NativeDiagnostic> {
        vec![]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ServiceState {
    Uninitialized,
    Ready { verbose: bool },
    ShutDown,
}

/// Owns the lifecycle of a [`NativeResolver`].
///
/// Calls made before [`initialize`](Self::initialize) or after [`shutdown`](Self::shutdown)
/// fail with [`NativeError::NotInitialized`] or [`NativeError::ShutDown`] without reaching the
/// resolver.
pub struct NativeSymbolService {
    resolver: Box<dyn NativeResolver>,
    state: Mutex<ServiceState>,
}

impl std::fmt::Debug for NativeSymbolService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSymbolService")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl NativeSymbolService {
    pub fn new<R: NativeResolver + 'static>(resolver: R) -> NativeSymbolService {
        NativeSymbolService {
            resolver: Box::new(resolver),
            state: Mutex::new(ServiceState::Uninitialized),
        }
    }

    fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Initialize the engine. Initializing a ready service does nothing.
    pub fn initialize(
        &self,
        search_path: Option<&str>,
        options: SymbolOptions,
    ) -> Result<(), NativeError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let ServiceState::Ready { .. } = *state {
            return Ok(());
        }
        debug!(
            "initializing native symbol service (search path {:?}, options {:?})",
            search_path, options
        );
        self.resolver.initialize(search_path, options)?;
        *state = ServiceState::Ready {
            verbose: options.contains(SymbolOptions::DEBUG),
        };
        Ok(())
    }

    /// Clean up the engine. Safe to call any number of times, initialized or not.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let ServiceState::Ready { .. } = *state {
            if let Err(e) = self.resolver.cleanup() {
                warn!("native symbol service cleanup failed: {e}");
            }
        }
        *state = ServiceState::ShutDown;
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), ServiceState::Ready { .. })
    }

    fn ensure_ready(&self) -> Result<bool, NativeError> {
        match self.state() {
            ServiceState::Ready { verbose } => Ok(verbose),
            ServiceState::Uninitialized => Err(NativeError::NotInitialized),
            ServiceState::ShutDown => Err(NativeError::ShutDown),
        }
    }

    fn forward_diagnostics(&self, verbose: bool) {
        let diagnostics = self.resolver.take_diagnostics();
        if !verbose {
            return;
        }
        for diagnostic in diagnostics {
            let message = diagnostic.message.trim_end();
            match diagnostic.action() {
                Some(SymbolActionCode::Event) => {}
                Some(SymbolActionCode::DebugInfo) => info!("native: {message}"),
                Some(action) => debug!("native: {action:?} {message}"),
                None => debug!("native: {:#x} {message}", diagnostic.code),
            }
        }
    }

    pub fn find_companion_metadata(
        &self,
        module: &dyn Module,
    ) -> Result<Option<PathBuf>, NativeError> {
        let verbose = self.ensure_ready()?;
        let path = self.resolver.find_companion_metadata(module);
        self.forward_diagnostics(verbose);
        path
    }

    /// Load `module`, list its source files, and unload it again.
    pub fn source_files(&self, module: &dyn Module) -> Result<Vec<NativeSourceFile>, NativeError> {
        let verbose = self.ensure_ready()?;
        let result = self.resolver.load_module(module).and_then(|handle| {
            let loaded = LoadedModule {
                resolver: &*self.resolver,
                handle,
            };
            self.resolver.enumerate_source_files(loaded.handle)
        });
        self.forward_diagnostics(verbose);
        result
    }

    pub fn resolve_address(
        &self,
        module: &dyn Module,
        offset: u64,
    ) -> Result<Option<(String, u32)>, NativeError> {
        let verbose = self.ensure_ready()?;
        let result = self.resolver.resolve_address(module, offset);
        self.forward_diagnostics(verbose);
        result
    }
}

/// Unloads a native module handle when dropped.
struct LoadedModule<'a> {
    resolver: &'a dyn NativeResolver,
    handle: NativeModuleHandle,
}

impl Drop for LoadedModule<'_> {
    fn drop(&mut self) {
        trace!("unloading native module {:?}", self.handle);
        if let Err(e) = self.resolver.unload_module(self.handle) {
            warn!("failed to unload native module {:?}: {e}", self.handle);
        }
    }
}

/// A [`NativeResolver`] that finds companion PDBs on disk.
///
/// It looks for the file named by the module's debug file or CodeView record, first at the
/// recorded path, then next to the module, then in each directory of the search path, both
/// directly and in the symbol store layout `<name>.pdb/<GUID><age>/<name>.pdb`.
///
/// It cannot read classic PDBs, so module loading and address resolution are unsupported.
#[derive(Debug, Default)]
pub struct SymbolPathResolver {
    paths: Mutex<Vec<PathBuf>>,
}

impl SymbolPathResolver {
    pub fn new(paths: Vec<PathBuf>) -> SymbolPathResolver {
        SymbolPathResolver {
            paths: Mutex::new(paths),
        }
    }

    /// Parse a semicolon-separated symbol path.
    ///
    /// `srv*` and `cache*` elements contribute their local directories; remote stores are
    /// skipped.
    pub fn parse_search_path(search_path: &str) -> Vec<PathBuf> {
        let mut paths = vec![];
        for element in search_path.split(';').map(str::trim) {
            if element.is_empty() {
                continue;
            }
            let lower = element.to_ascii_lowercase();
            if lower.starts_with("srv*") || lower.starts_with("cache*") {
                paths.extend(
                    element
                        .split('*')
                        .skip(1)
                        .filter(|part| !part.is_empty() && !part.contains("://"))
                        .map(PathBuf::from),
                );
            } else {
                paths.push(PathBuf::from(element));
            }
        }
        paths
    }

    fn candidates(&self, module: &dyn Module) -> Vec<PathBuf> {
        let code_file = module.code_file();
        let codeview = match PeImage::read_path(Path::new(&*code_file)) {
            Ok(image) => image.codeview().found(),
            Err(_) => None,
        };

        let recorded: Option<Cow<'_, str>> = module
            .debug_file()
            .or_else(|| codeview.as_ref().map(|cv| Cow::from(cv.pdb_file_name.clone())));
        let name = match &recorded {
            Some(path) => basename(path).to_owned(),
            None => format!("{}.pdb", strip_extension(basename(&code_file))),
        };
        let identifier = module
            .debug_identifier()
            .or_else(|| codeview.as_ref().map(|cv| cv.debug_id()))
            .map(|id| id.breakpad().to_string());

        let mut candidates = vec![];
        if let Some(path) = &recorded {
            candidates.push(PathBuf::from(&**path));
        }
        if let Some(dir) = Path::new(&*code_file).parent() {
            candidates.push(dir.join(&name));
        }
        for dir in self.paths.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            candidates.push(dir.join(&name));
            if let Some(identifier) = &identifier {
                candidates.push(dir.join(&name).join(identifier).join(&name));
            }
        }
        candidates
    }
}

impl NativeResolver for SymbolPathResolver {
    fn initialize(
        &self,
        search_path: Option<&str>,
        _options: SymbolOptions,
    ) -> Result<(), NativeError> {
        if let Some(search_path) = search_path {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths.extend(SymbolPathResolver::parse_search_path(search_path));
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<(), NativeError> {
        Ok(())
    }

    fn find_companion_metadata(&self, module: &dyn Module) -> Result<Option<PathBuf>, NativeError> {
        Ok(self.candidates(module).into_iter().find(|path| {
            trace!("looking for companion pdb at {}", path.display());
            path.is_file()
        }))
    }

    fn load_module(&self, _module: &dyn Module) -> Result<NativeModuleHandle, NativeError> {
        Err(NativeError::Unsupported("loading native modules"))
    }

    fn unload_module(&self, _handle: NativeModuleHandle) -> Result<(), NativeError> {
        Err(NativeError::Unsupported("unloading native modules"))
    }

    fn enumerate_source_files(
        &self,
        _handle: NativeModuleHandle,
    ) -> Result<Vec<NativeSourceFile>, NativeError> {
        Err(NativeError::Unsupported("enumerating source files"))
    }

    fn resolve_address(
        &self,
        _module: &dyn Module,
        _offset: u64,
    ) -> Result<Option<(String, u32)>, NativeError> {
        Err(NativeError::Unsupported("resolving addresses"))
    }
}
