use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use portable_pdb::ImageLayout;
use portable_pdb_synth::{SynthImage, SynthMethod, SynthPdb, SynthSequencePoint};
use sourcelink_common::traits::Module;
use sourcelink_processor::*;
use sourcelink_symbols::*;

const SAMPLE: &str = "/app/Sample.dll";
const SOURCE_LINK: &str = r#"{"documents": {"/_/*": "https://example.org/test1234/*"}}"#;

/// A portable PDB for Sample.dll: `Main` (row 1) and `Parse` (row 2) in Program.cs.
fn sample_pdb() -> Vec<u8> {
    let mut pdb = SynthPdb::new();
    let program = pdb.add_document("/_/Program.cs");
    pdb.add_method(SynthMethod::new(program).points(vec![
        SynthSequencePoint::new(0, 8, 5, 8, 6),
        SynthSequencePoint::new(0x1, 9, 9, 9, 40),
        SynthSequencePoint::new(0x8, 12, 9, 12, 52),
        SynthSequencePoint::new(0x14, 13, 5, 13, 6),
    ]));
    pdb.add_method(SynthMethod::new(program).points(vec![
        SynthSequencePoint::new(0, 20, 5, 20, 6),
        SynthSequencePoint::hidden(0x2),
        SynthSequencePoint::new(0x6, 22, 13, 22, 60),
    ]));
    pdb.source_link(SOURCE_LINK).finish()
}

fn sample_reader() -> MemoryModuleReader {
    let reader = MemoryModuleReader::new();
    reader.insert(
        SAMPLE,
        SynthImage::new().embed_pdb(&sample_pdb()).finish(),
        ImageLayout::File,
    );
    reader
}

fn sample_renderer() -> TraceRenderer {
    TraceRenderer::with_services(
        TraceOptions::default(),
        sample_reader(),
        SymbolPathResolver::default(),
    )
}

fn sample_module() -> Arc<SimpleModule> {
    Arc::new(SimpleModule::new(SAMPLE, 0x1000_0000))
}

fn main_method() -> MethodInfo {
    MethodInfo::new(0x0600_0001, "Sample.Program", "Main").param("System.String[]", "args")
}

fn parse_method() -> MethodInfo {
    MethodInfo::new(0x0600_0002, "Sample.Program", "Parse")
        .param("System.String", "text")
        .param("System.Int32", "radix")
}

#[test]
fn test_embedded_source_link() {
    let renderer = sample_renderer();
    let exception = ExceptionInfo::new("System.InvalidOperationException", "boom")
        .frames(vec![StackFrame::new(main_method(), sample_module()).il_offset(0xa)]);
    assert_eq!(
        renderer.render(&exception),
        "System.InvalidOperationException: boom\n   \
         at Sample.Program.Main(System.String[] args) in https://example.org/test1234/Program.cs:line 12"
    );

    let stats = renderer.stats();
    assert_eq!(stats["Sample.dll"].source, DebugInfoSource::Embedded);
    assert!(stats["Sample.dll"].has_source_link);
    assert_eq!(stats["Sample.dll"].methods, 2);
}

#[test]
fn test_hidden_and_runtime_locations() {
    let renderer = sample_renderer();
    let frames = vec![
        // Inside the hidden range, the preceding visible line applies.
        StackFrame::new(parse_method(), sample_module()).il_offset(0x4),
        // The runtime's own location wins, but is still source-linked.
        StackFrame::new(main_method(), sample_module())
            .il_offset(0xa)
            .source("/_/Program.cs", 42),
        // Past the last sequence point.
        StackFrame::new(main_method(), sample_module()).il_offset(0x100),
    ];
    assert_eq!(
        renderer.render_stack(&frames),
        "   at Sample.Program.Parse(System.String text, System.Int32 radix) in https://example.org/test1234/Program.cs:line 20\n   \
         at Sample.Program.Main(System.String[] args) in https://example.org/test1234/Program.cs:line 42\n   \
         at Sample.Program.Main(System.String[] args) in https://example.org/test1234/Program.cs:line 13"
    );
}

#[test]
fn test_nested_exceptions() {
    let renderer = sample_renderer();
    let inner = ExceptionInfo::new("System.FormatException", "bad digit")
        .frames(vec![StackFrame::new(parse_method(), sample_module()).il_offset(0x6)]);
    let outer = ExceptionInfo::new("System.ApplicationException", "could not start")
        .inner(inner)
        .frames(vec![StackFrame::new(main_method(), sample_module()).il_offset(0x1)]);
    assert_eq!(
        renderer.render(&outer),
        "System.ApplicationException: could not start ---> System.FormatException: bad digit\n   \
         at Sample.Program.Parse(System.String text, System.Int32 radix) in https://example.org/test1234/Program.cs:line 22\n   \
         --- End of inner exception stack trace ---\n   \
         at Sample.Program.Main(System.String[] args) in https://example.org/test1234/Program.cs:line 9"
    );
}

#[test]
fn test_no_debug_info() {
    let renderer = TraceRenderer::with_services(
        TraceOptions::default(),
        MemoryModuleReader::new(),
        SymbolPathResolver::default(),
    );
    let module: Arc<SimpleModule> = Arc::new(SimpleModule::new("/app/Other.dll", 0x2000_0000));
    let dynamic = Arc::new(SimpleModule::dynamic("RefEmit_InMemoryManifestModule"));
    let exception = ExceptionInfo::new("System.Exception", "no symbols").frames(vec![
        StackFrame::new(parse_method(), dynamic).il_offset(0x6),
        StackFrame::new(main_method(), module).il_offset(0x6),
    ]);
    let rendered = renderer.render(&exception);
    assert_eq!(
        rendered,
        "System.Exception: no symbols\n   \
         at Sample.Program.Parse(System.String text, System.Int32 radix)\n   \
         at Sample.Program.Main(System.String[] args)"
    );
    let stats = renderer.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats["Other.dll"].source, DebugInfoSource::None);
}

/// Wraps a loader, counting how often it runs.
struct CountingLoader<L> {
    inner: L,
    loads: Arc<AtomicUsize>,
}

impl<L: DebugInfoLoader> DebugInfoLoader for CountingLoader<L> {
    fn load(&self, module: &dyn Module) -> Result<ModuleDebugInfo, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(module)
    }
}

#[test]
fn test_concurrent_rendering_loads_once() {
    let native = Arc::new(NativeSymbolService::new(SymbolPathResolver::default()));
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = CountingLoader {
        inner: ModuleDebugInfoLoader::new(sample_reader(), native.clone()),
        loads: loads.clone(),
    };
    let renderer = TraceRenderer::with_loader(TraceOptions::default(), loader, native);
    let exception = ExceptionInfo::new("System.Exception", "boom").frames(vec![
        StackFrame::new(parse_method(), sample_module()).il_offset(0x6),
        StackFrame::new(main_method(), sample_module()).il_offset(0xa),
    ]);

    let threads = 8;
    let barrier = Barrier::new(threads);
    let renders: Vec<String> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    renderer.render(&exception)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(renders.windows(2).all(|w| w[0] == w[1]));
    assert!(renders[0].contains("Program.cs:line 22"));
}

/// A loader that panics for one module.
struct PanickyLoader {
    inner: ModuleDebugInfoLoader,
}

impl DebugInfoLoader for PanickyLoader {
    fn load(&self, module: &dyn Module) -> Result<ModuleDebugInfo, LoadError> {
        if module.code_file().ends_with("Broken.dll") {
            panic!("corrupt module list");
        }
        self.inner.load(module)
    }
}

#[test]
fn test_frame_failure_is_contained() {
    let native = Arc::new(NativeSymbolService::new(SymbolPathResolver::default()));
    let loader = PanickyLoader {
        inner: ModuleDebugInfoLoader::new(sample_reader(), native.clone()),
    };
    let renderer = TraceRenderer::with_loader(TraceOptions::default(), loader, native);
    let broken = Arc::new(SimpleModule::new("/app/Broken.dll", 0x3000_0000));
    let exception = ExceptionInfo::new("System.Exception", "boom").frames(vec![
        StackFrame::new(MethodInfo::new(0x0600_0001, "Broken.Thing", "Run"), broken),
        StackFrame::new(main_method(), sample_module()).il_offset(0xa),
    ]);
    assert_eq!(
        renderer.render(&exception),
        "System.Exception: boom\n   \
         at Broken.Thing.Run() [source lookup failed: corrupt module list]\n   \
         at Sample.Program.Main(System.String[] args) in https://example.org/test1234/Program.cs:line 12"
    );
}

/// A native engine that knows one module's source files and resolves addresses in it.
struct NativeEngine;

impl NativeResolver for NativeEngine {
    fn initialize(&self, _: Option<&str>, _: SymbolOptions) -> Result<(), NativeError> {
        Ok(())
    }
    fn cleanup(&self) -> Result<(), NativeError> {
        Ok(())
    }
    fn find_companion_metadata(&self, _: &dyn Module) -> Result<Option<PathBuf>, NativeError> {
        Ok(None)
    }
    fn load_module(&self, _: &dyn Module) -> Result<NativeModuleHandle, NativeError> {
        Ok(NativeModuleHandle(1))
    }
    fn unload_module(&self, _: NativeModuleHandle) -> Result<(), NativeError> {
        Ok(())
    }
    fn enumerate_source_files(
        &self,
        _: NativeModuleHandle,
    ) -> Result<Vec<NativeSourceFile>, NativeError> {
        Ok(vec![NativeSourceFile {
            raw: String::from("C:\\build\\Legacy\\Widget.cs"),
            resolved: String::from("https://example.org/legacy/Widget.cs"),
        }])
    }
    fn resolve_address(
        &self,
        _: &dyn Module,
        offset: u64,
    ) -> Result<Option<(String, u32)>, NativeError> {
        Ok((offset == 0x1234).then(|| (String::from("c:\\build\\legacy\\widget.cs"), 77)))
    }
}

#[test]
fn test_native_fallback() {
    let renderer =
        TraceRenderer::with_services(TraceOptions::default(), MemoryModuleReader::new(), NativeEngine);
    let legacy = Arc::new(SimpleModule::new("/app/Legacy.dll", 0x4000_0000));
    let method = MethodInfo::new(0x0600_0004, "Legacy.Widget", "Spin");
    let frames = vec![
        StackFrame::new(method.clone(), legacy.clone()).native_offset(0x1234),
        StackFrame::new(method, legacy).native_offset(0x9999),
    ];
    assert_eq!(
        renderer.render_stack(&frames),
        "   at Legacy.Widget.Spin() in https://example.org/legacy/Widget.cs:line 77\n   \
         at Legacy.Widget.Spin()"
    );
    assert_eq!(renderer.stats()["Legacy.dll"].source, DebugInfoSource::Native);

    renderer.shutdown();
    assert!(renderer.stats().is_empty());
}
