//! Finding and loading the debug information of a module.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use portable_pdb::{ImageLayout, PeImage, PortablePdb, Probe};
use sourcelink_common::traits::{basename, Module};
use tracing::{debug, warn};

use crate::{
    method_def_row, Breakpoint, DocumentRef, LoadError, NativeError, NativeSourceFile,
    NativeSymbolService, SourceLocationTable, SourceRemap,
};

// Stage outcomes are operator-facing when verbose.
macro_rules! stage {
    ($loader:expr, $($arg:tt)+) => {
        if $loader.verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// The bytes of a module image.
#[derive(Debug)]
pub enum ModuleBytes {
    Mapped(Mmap),
    Shared(Arc<[u8]>),
}

impl Deref for ModuleBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ModuleBytes::Mapped(mmap) => mmap,
            ModuleBytes::Shared(bytes) => bytes,
        }
    }
}

/// A module image and how it is laid out.
#[derive(Debug)]
pub struct ModuleImage {
    pub bytes: ModuleBytes,
    pub layout: ImageLayout,
}

/// A source of module images.
pub trait ModuleReader: Send + Sync {
    fn read_module(&self, module: &dyn Module) -> io::Result<ModuleImage>;
}

/// Reads module images from their code files on disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileModuleReader;

impl ModuleReader for FileModuleReader {
    fn read_module(&self, module: &dyn Module) -> io::Result<ModuleImage> {
        let code_file = module.code_file();
        if code_file.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "module has no code file"));
        }
        let file = File::open(Path::new(&*code_file))?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(ModuleImage {
            bytes: ModuleBytes::Mapped(mmap),
            layout: ImageLayout::File,
        })
    }
}

/// Serves module images already held in memory, keyed by code file.
#[derive(Debug, Default)]
pub struct MemoryModuleReader {
    images: Mutex<HashMap<String, (Arc<[u8]>, ImageLayout)>>,
}

impl MemoryModuleReader {
    pub fn new() -> MemoryModuleReader {
        MemoryModuleReader::default()
    }

    pub fn insert(&self, code_file: &str, bytes: Vec<u8>, layout: ImageLayout) {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code_file.to_owned(), (Arc::from(bytes), layout));
    }
}

impl ModuleReader for MemoryModuleReader {
    fn read_module(&self, module: &dyn Module) -> io::Result<ModuleImage> {
        let images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        let (bytes, layout) = images
            .get(&*module.code_file())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such module image"))?;
        Ok(ModuleImage {
            bytes: ModuleBytes::Shared(bytes.clone()),
            layout: *layout,
        })
    }
}

/// Where a module's debug information came from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DebugInfoSource {
    /// A portable PDB embedded in the module image.
    Embedded,
    /// A portable PDB next to the module or in a symbol directory.
    Companion,
    /// The native symbol service.
    Native,
    #[default]
    None,
}

impl fmt::Display for DebugInfoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DebugInfoSource::Embedded => "embedded",
            DebugInfoSource::Companion => "companion",
            DebugInfoSource::Native => "native",
            DebugInfoSource::None => "none",
        })
    }
}

/// Document paths mapped to where they can be retrieved.
#[derive(Clone, Debug, Default)]
struct ResolvedPaths {
    case_insensitive: bool,
    paths: HashMap<String, String>,
}

impl ResolvedPaths {
    fn ordinal(pairs: impl IntoIterator<Item = (String, String)>) -> ResolvedPaths {
        ResolvedPaths {
            case_insensitive: false,
            paths: pairs.into_iter().collect(),
        }
    }

    fn case_insensitive(files: Vec<NativeSourceFile>) -> ResolvedPaths {
        let mut paths = HashMap::with_capacity(files.len());
        for file in files {
            paths.entry(file.raw.to_lowercase()).or_insert(file.resolved);
        }
        ResolvedPaths {
            case_insensitive: true,
            paths,
        }
    }

    fn get(&self, raw: &str) -> Option<&str> {
        let path = if self.case_insensitive {
            self.paths.get(&raw.to_lowercase())
        } else {
            self.paths.get(raw)
        };
        path.map(String::as_str)
    }
}

/// Everything known about the source of one module.
#[derive(Clone, Debug)]
pub struct ModuleDebugInfo {
    pub source: DebugInfoSource,
    /// Location tables by MethodDef row.
    location_tables: HashMap<u32, SourceLocationTable>,
    remap: Option<SourceRemap>,
    resolved_paths: ResolvedPaths,
    problems: Vec<LoadError>,
}

impl ModuleDebugInfo {
    /// A module with no debug information.
    pub fn none(problems: Vec<LoadError>) -> ModuleDebugInfo {
        ModuleDebugInfo {
            source: DebugInfoSource::None,
            location_tables: HashMap::new(),
            remap: None,
            resolved_paths: ResolvedPaths::default(),
            problems,
        }
    }

    /// A module whose only debug information is a source-link table.
    pub fn with_remap(remap: SourceRemap) -> ModuleDebugInfo {
        ModuleDebugInfo {
            remap: Some(remap),
            ..ModuleDebugInfo::none(vec![])
        }
    }

    /// Whether lookups go through location tables rather than the native service.
    pub fn has_location_tables(&self) -> bool {
        matches!(
            self.source,
            DebugInfoSource::Embedded | DebugInfoSource::Companion
        )
    }

    /// The location table of the method with metadata token `token`.
    pub fn location_table(&self, token: u32) -> Option<&SourceLocationTable> {
        self.location_tables.get(&method_def_row(token)?)
    }

    pub fn source_location(&self, token: u32, il_offset: u32) -> Option<&Breakpoint> {
        self.location_table(token)?.lookup(il_offset)
    }

    /// The module's source-link table, when it has a well-formed one.
    pub fn remap(&self) -> Option<&SourceRemap> {
        self.remap.as_ref()
    }

    pub fn has_source_link(&self) -> bool {
        self.remap.is_some()
            || self
                .problems
                .iter()
                .any(|p| matches!(p, LoadError::RemapMalformed(_)))
    }

    /// The retrievable location of a document, if it was resolved while loading.
    ///
    /// Document names from portable PDBs compare exactly; natively enumerated ones ignore case.
    pub fn resolved_path(&self, raw: &str) -> Option<&str> {
        self.resolved_paths.get(raw)
    }

    pub fn method_count(&self) -> usize {
        self.location_tables.len()
    }

    pub fn document_count(&self) -> usize {
        self.resolved_paths.paths.len()
    }

    /// Problems encountered while loading that did not prevent it.
    pub fn problems(&self) -> &[LoadError] {
        &self.problems
    }

    pub fn is_malformed(&self) -> bool {
        self.problems
            .iter()
            .any(|p| matches!(p, LoadError::MetadataMalformed(_)))
    }
}

/// Loads the debug information of a module.
pub trait DebugInfoLoader: Send + Sync {
    fn load(&self, module: &dyn Module) -> Result<ModuleDebugInfo, LoadError>;
}

/// The standard [`DebugInfoLoader`].
///
/// Tries an embedded portable PDB, then a companion portable PDB located by the native symbol
/// service, then the native symbol service itself. Problems in one stage move on to the next;
/// the only hard failure is being unable to read a companion file the service said exists.
pub struct ModuleDebugInfoLoader {
    reader: Box<dyn ModuleReader>,
    native: Arc<NativeSymbolService>,
    verbose: bool,
}

impl fmt::Debug for ModuleDebugInfoLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDebugInfoLoader")
            .field("native", &self.native)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

fn note(problems: &mut Vec<LoadError>, problem: LoadError) {
    if !problems.contains(&problem) {
        problems.push(problem);
    }
}

impl ModuleDebugInfoLoader {
    pub fn new<R: ModuleReader + 'static>(
        reader: R,
        native: Arc<NativeSymbolService>,
    ) -> ModuleDebugInfoLoader {
        ModuleDebugInfoLoader {
            reader: Box::new(reader),
            native,
            verbose: false,
        }
    }

    /// Report stage outcomes at `info` rather than `debug` level.
    pub fn verbose(mut self, verbose: bool) -> ModuleDebugInfoLoader {
        self.verbose = verbose;
        self
    }

    fn read_image(&self, module: &dyn Module) -> Result<PeImage<ModuleBytes>, LoadError> {
        let failed = |reason: String| LoadError::ModuleLoadFailed {
            path: module.code_file().into_owned(),
            reason,
        };
        let image = self
            .reader
            .read_module(module)
            .map_err(|e| failed(e.to_string()))?;
        PeImage::read_with_layout(image.bytes, image.layout).map_err(|e| failed(e.to_string()))
    }

    fn portable_debug_info<T>(
        &self,
        name: &str,
        pdb: &PortablePdb<T>,
        source: DebugInfoSource,
        problems: &mut Vec<LoadError>,
    ) -> Result<ModuleDebugInfo, portable_pdb::Error>
    where
        T: Deref<Target = [u8]>,
    {
        let documents: Vec<DocumentRef> = pdb
            .documents()?
            .into_iter()
            .map(|d| Arc::from(d.name))
            .collect();

        let remap = match pdb.source_link() {
            Ok(Some(json)) => match SourceRemap::from_json(json) {
                Ok(remap) => Some(remap),
                Err(e) => {
                    warn!("{name}: ignoring malformed source link table: {e}");
                    problems.push(LoadError::RemapMalformed(e.to_string()));
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("{name}: could not read custom debug information: {e}");
                problems.push(LoadError::RemapMalformed(e.to_string()));
                None
            }
        };

        let mut location_tables = HashMap::new();
        for row in 1..=pdb.method_count() {
            match pdb.sequence_points(row) {
                Ok(points) if points.is_empty() => {}
                Ok(points) => {
                    let table = SourceLocationTable::from_sequence_points(&points, &documents);
                    location_tables.insert(row, table);
                }
                Err(e) => debug!("{name}: skipping method row {row}: {e}"),
            }
        }

        let resolved_paths = ResolvedPaths::ordinal(documents.iter().map(|document| {
            let resolved = match &remap {
                Some(remap) => remap.resolve(document),
                None => document.to_string(),
            };
            (document.to_string(), resolved)
        }));

        stage!(
            self,
            "{name}: {source} portable pdb with {} documents, {} methods, {}",
            documents.len(),
            location_tables.len(),
            if remap.is_some() {
                "source link"
            } else {
                "no source link"
            }
        );
        Ok(ModuleDebugInfo {
            source,
            location_tables,
            remap,
            resolved_paths,
            problems: std::mem::take(problems),
        })
    }
}

impl DebugInfoLoader for ModuleDebugInfoLoader {
    fn load(&self, module: &dyn Module) -> Result<ModuleDebugInfo, LoadError> {
        let code_file = module.code_file();
        let name = basename(&code_file);
        let mut problems = vec![];

        let image = match self.read_image(module) {
            Ok(image) => Some(image),
            Err(e) => {
                stage!(self, "{name}: could not read module image: {e}");
                problems.push(e);
                None
            }
        };

        // Stage 1: a portable PDB embedded in the image.
        if let Some(image) = &image {
            match image.embedded_portable_pdb().and_then(PortablePdb::probe) {
                Probe::Found(pdb) => {
                    let source = DebugInfoSource::Embedded;
                    match self.portable_debug_info(name, &pdb, source, &mut problems) {
                        Ok(info) => return Ok(info),
                        Err(e) => {
                            stage!(self, "{name}: malformed embedded portable pdb: {e}");
                            problems.push(e.into());
                        }
                    }
                }
                Probe::NotPresent => stage!(self, "{name}: no embedded portable pdb"),
                Probe::Malformed(e) => {
                    stage!(self, "{name}: malformed embedded portable pdb: {e}");
                    problems.push(e.into());
                }
            }
        }

        // Stage 2: a companion portable PDB.
        let expected_id = module.debug_identifier().or_else(|| {
            image
                .as_ref()
                .and_then(|image| image.codeview().found())
                .map(|codeview| codeview.debug_id())
        });
        drop(image);
        match self.native.find_companion_metadata(module) {
            Ok(Some(path)) => {
                let bytes = std::fs::read(&path).map_err(|e| {
                    warn!("{name}: failed to read {}: {e}", path.display());
                    LoadError::ModuleLoadFailed {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                match PortablePdb::probe(bytes) {
                    Probe::Found(pdb)
                        if expected_id.is_some_and(|id| id.uuid() != pdb.debug_id().uuid()) =>
                    {
                        warn!(
                            "{name}: ignoring {}, which belongs to a different build",
                            path.display()
                        );
                    }
                    Probe::Found(pdb) => {
                        let source = DebugInfoSource::Companion;
                        match self.portable_debug_info(name, &pdb, source, &mut problems) {
                            Ok(info) => return Ok(info),
                            Err(e) => {
                                stage!(self, "{name}: malformed portable pdb {}: {e}", path.display());
                                note(&mut problems, e.into());
                            }
                        }
                    }
                    Probe::NotPresent => {
                        stage!(self, "{name}: {} is not a portable pdb", path.display())
                    }
                    Probe::Malformed(e) => {
                        stage!(self, "{name}: malformed portable pdb {}: {e}", path.display());
                        note(&mut problems, e.into());
                    }
                }
            }
            Ok(None) => stage!(self, "{name}: no companion pdb found"),
            Err(e) => {
                stage!(self, "{name}: companion pdb lookup failed: {e}");
                note(&mut problems, e.into());
            }
        }

        // Stage 3: whatever the native symbol service knows.
        match self.native.source_files(module) {
            Ok(files) => {
                stage!(
                    self,
                    "{name}: native symbols with {} source files",
                    files.len()
                );
                return Ok(ModuleDebugInfo {
                    source: DebugInfoSource::Native,
                    location_tables: HashMap::new(),
                    remap: None,
                    resolved_paths: ResolvedPaths::case_insensitive(files),
                    problems,
                });
            }
            Err(NativeError::Unsupported(what)) => {
                stage!(self, "{name}: native resolver does not support {what}")
            }
            Err(e) => {
                stage!(self, "{name}: native symbol lookup failed: {e}");
                note(&mut problems, e.into());
            }
        }

        stage!(self, "{name}: no debug information");
        Ok(ModuleDebugInfo::none(problems))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{NativeModuleHandle, NativeResolver, SymbolOptions, SymbolPathResolver};
    use portable_pdb_synth::{SynthImage, SynthMethod, SynthPdb, SynthSequencePoint};
    use sourcelink_common::traits::SimpleModule;
    use std::path::PathBuf;

    const SOURCE_LINK: &str = r#"{"documents": {"/_/*": "https://example.org/test1234/*"}}"#;

    fn synth_pdb(source_link: Option<&str>) -> Vec<u8> {
        let mut pdb = SynthPdb::new();
        let program = pdb.add_document("/_/Program.cs");
        pdb.add_method(SynthMethod::new(program).points(vec![
            SynthSequencePoint::new(0, 10, 9, 10, 30),
            SynthSequencePoint::new(0x8, 11, 13, 11, 40),
            SynthSequencePoint::hidden(0x10),
        ]));
        pdb.add_method(SynthMethod::empty());
        match source_link {
            Some(json) => pdb.source_link(json).finish(),
            None => pdb.finish(),
        }
    }

    /// A resolver with a fixed companion path and source file list.
    #[derive(Default)]
    struct StubResolver {
        companion: Option<PathBuf>,
        files: Option<Vec<NativeSourceFile>>,
    }

    impl NativeResolver for StubResolver {
        fn initialize(&self, _: Option<&str>, _: SymbolOptions) -> Result<(), NativeError> {
            Ok(())
        }
        fn cleanup(&self) -> Result<(), NativeError> {
            Ok(())
        }
        fn find_companion_metadata(&self, _: &dyn Module) -> Result<Option<PathBuf>, NativeError> {
            Ok(self.companion.clone())
        }
        fn load_module(&self, _: &dyn Module) -> Result<NativeModuleHandle, NativeError> {
            match self.files {
                Some(_) => Ok(NativeModuleHandle(1)),
                None => Err(NativeError::CallFailed {
                    call: "SymLoadModule64",
                    code: 2,
                }),
            }
        }
        fn unload_module(&self, _: NativeModuleHandle) -> Result<(), NativeError> {
            Ok(())
        }
        fn enumerate_source_files(
            &self,
            _: NativeModuleHandle,
        ) -> Result<Vec<NativeSourceFile>, NativeError> {
            Ok(self.files.clone().unwrap_or_default())
        }
        fn resolve_address(
            &self,
            _: &dyn Module,
            _: u64,
        ) -> Result<Option<(String, u32)>, NativeError> {
            Ok(None)
        }
    }

    fn ready(resolver: impl NativeResolver + 'static) -> Arc<NativeSymbolService> {
        let service = NativeSymbolService::new(resolver);
        service.initialize(None, SymbolOptions::default()).unwrap();
        Arc::new(service)
    }

    fn loader_with(image: Vec<u8>, native: Arc<NativeSymbolService>) -> ModuleDebugInfoLoader {
        let reader = MemoryModuleReader::new();
        reader.insert("/app/Sample.dll", image, ImageLayout::File);
        ModuleDebugInfoLoader::new(reader, native)
    }

    fn module() -> SimpleModule {
        SimpleModule::new("/app/Sample.dll", 0x1000_0000)
    }

    #[test]
    fn test_embedded() {
        let image = SynthImage::new()
            .embed_pdb(&synth_pdb(Some(SOURCE_LINK)))
            .finish();
        let loader = loader_with(image, ready(StubResolver::default()));
        let info = loader.load(&module()).unwrap();

        assert_eq!(info.source, DebugInfoSource::Embedded);
        assert!(info.has_location_tables());
        assert!(info.has_source_link());
        assert!(info.problems().is_empty());
        assert_eq!(info.method_count(), 1);

        let location = info.source_location(0x0600_0001, 0xc).unwrap();
        assert_eq!((&*location.file, location.line), ("/_/Program.cs", 11));
        // Past the hidden point, the last visible one applies.
        assert_eq!(info.source_location(0x0600_0001, 0x40).unwrap().line, 11);
        assert_eq!(info.source_location(0x0600_0002, 0), None);
        assert_eq!(info.source_location(0x0200_0001, 0), None);

        assert_eq!(
            info.resolved_path("/_/Program.cs"),
            Some("https://example.org/test1234/Program.cs")
        );
        // Portable document names compare exactly.
        assert_eq!(info.resolved_path("/_/program.cs"), None);
    }

    #[test]
    fn test_malformed_source_link() {
        let image = SynthImage::new()
            .embed_pdb(&synth_pdb(Some("{\"documents\": [")))
            .finish();
        let loader = loader_with(image, ready(StubResolver::default()));
        let info = loader.load(&module()).unwrap();

        assert_eq!(info.source, DebugInfoSource::Embedded);
        assert!(info.remap().is_none());
        assert!(info.has_source_link());
        assert!(matches!(info.problems(), [LoadError::RemapMalformed(_)]));
        assert_eq!(info.resolved_path("/_/Program.cs"), Some("/_/Program.cs"));
        assert_eq!(info.source_location(0x0600_0001, 0).unwrap().line, 10);
    }

    #[test]
    fn test_bad_embedded_falls_through() {
        let pdb = synth_pdb(None);
        let image = SynthImage::new()
            .embed_pdb_with_size(&pdb, pdb.len() as u32 + 1)
            .finish();
        let loader = loader_with(image, ready(StubResolver::default()));
        let info = loader.load(&module()).unwrap();

        assert_eq!(info.source, DebugInfoSource::None);
        assert!(info.is_malformed());
        assert!(matches!(
            info.problems()[0],
            LoadError::MetadataMalformed(portable_pdb::Error::EmbeddedPdbSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_companion() {
        let dir = tempfile::tempdir().unwrap();
        let pdb_path = dir.path().join("Sample.pdb");
        std::fs::write(&pdb_path, synth_pdb(Some(SOURCE_LINK))).unwrap();
        let image = SynthImage::new()
            .codeview("/build/Sample.pdb", SynthImage::DEFAULT_GUID, 1)
            .finish();

        let native = Arc::new(NativeSymbolService::new(SymbolPathResolver::default()));
        native
            .initialize(dir.path().to_str(), SymbolOptions::default())
            .unwrap();
        let loader = loader_with(image, native);
        let info = loader.load(&module()).unwrap();

        assert_eq!(info.source, DebugInfoSource::Companion);
        assert_eq!(info.source_location(0x0600_0001, 0x9).unwrap().line, 11);
        assert_eq!(
            info.resolved_path("/_/Program.cs"),
            Some("https://example.org/test1234/Program.cs")
        );
    }

    #[test]
    fn test_companion_from_another_build() {
        let dir = tempfile::tempdir().unwrap();
        let pdb_path = dir.path().join("Sample.pdb");
        let mut pdb = SynthPdb::new().pdb_id([0xaa; 20]);
        pdb.add_document("/_/Program.cs");
        std::fs::write(&pdb_path, pdb.finish()).unwrap();
        let image = SynthImage::new()
            .codeview("/build/Sample.pdb", SynthImage::DEFAULT_GUID, 1)
            .finish();

        let loader = loader_with(
            image,
            ready(StubResolver {
                companion: Some(pdb_path),
                files: None,
            }),
        );
        let info = loader.load(&module()).unwrap();
        assert_eq!(info.source, DebugInfoSource::None);
    }

    #[test]
    fn test_classic_companion_goes_native() {
        let dir = tempfile::tempdir().unwrap();
        let pdb_path = dir.path().join("Sample.pdb");
        std::fs::write(&pdb_path, portable_pdb_synth::synth_msf_pdb()).unwrap();
        let image = SynthImage::new()
            .codeview_classic("/build/Sample.pdb", SynthImage::DEFAULT_GUID, 1)
            .finish();

        let loader = loader_with(
            image,
            ready(StubResolver {
                companion: Some(pdb_path),
                files: Some(vec![NativeSourceFile {
                    raw: String::from("C:\\build\\Native.cpp"),
                    resolved: String::from("https://example.org/Native.cpp"),
                }]),
            }),
        );
        let info = loader.load(&module()).unwrap();

        assert_eq!(info.source, DebugInfoSource::Native);
        assert!(!info.has_location_tables());
        assert!(!info.is_malformed());
        // Native source files compare without regard to case.
        assert_eq!(
            info.resolved_path("c:\\BUILD\\native.cpp"),
            Some("https://example.org/Native.cpp")
        );
    }

    #[test]
    fn test_unreadable_companion_fails() {
        let dir = tempfile::tempdir().unwrap();
        let image = SynthImage::new().finish();
        let loader = loader_with(
            image,
            ready(StubResolver {
                companion: Some(dir.path().join("Missing.pdb")),
                files: None,
            }),
        );
        assert!(matches!(
            loader.load(&module()),
            Err(LoadError::ModuleLoadFailed { .. })
        ));
    }

    #[test]
    fn test_no_image_no_service() {
        let native = Arc::new(NativeSymbolService::new(StubResolver::default()));
        let loader = ModuleDebugInfoLoader::new(MemoryModuleReader::new(), native);
        let info = loader.load(&module()).unwrap();

        assert_eq!(info.source, DebugInfoSource::None);
        assert_eq!(
            info.problems(),
            &[
                LoadError::ModuleLoadFailed {
                    path: String::from("/app/Sample.dll"),
                    reason: String::from("no such module image"),
                },
                LoadError::NativeServiceUnavailable(NativeError::NotInitialized),
            ]
        );
    }

    #[test]
    fn test_file_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Sample.dll");
        std::fs::write(&path, SynthImage::new().embed_pdb(&synth_pdb(None)).finish()).unwrap();
        let module = SimpleModule::new(path.to_str().unwrap(), 0);
        let loader = ModuleDebugInfoLoader::new(FileModuleReader, ready(StubResolver::default()));
        let info = loader.load(&module).unwrap();
        assert_eq!(info.source, DebugInfoSource::Embedded);
        assert!(!info.has_source_link());
        assert_eq!(info.resolved_path("/_/Program.cs"), Some("/_/Program.cs"));

        let missing = SimpleModule::new("", 0);
        assert!(FileModuleReader.read_module(&missing).is_err());
    }
}
