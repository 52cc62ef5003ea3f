use std::collections::HashMap;
use std::fmt::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use sourcelink_symbols::{
    CacheEntry, DebugInfoLoader, DebugInfoSource, FileModuleReader, FunctionId,
    ModuleDebugInfoLoader, ModuleKey, ModuleReader, ModuleResolutionCache, ModuleStats,
    NativeResolver, NativeSymbolService, SymbolOptions, SymbolPathResolver,
};
use tracing::{trace, warn};

use crate::{format_signature, AnnotatedFrame, ErrorRecord, ExceptionInfo, StackFrame};

/// Printed between an inner exception and the frames of the exception it caused.
pub const INNER_EXCEPTION_TRAILER: &str = "   --- End of inner exception stack trace ---";
/// Printed after a frame that was entered from outside managed code.
pub const FOREIGN_BOUNDARY_MARKER: &str = "--- End of stack trace from previous location ---";

/// Why a single frame could not be rendered normally.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{0}")]
    Panicked(String),
}

impl RenderError {
    fn from_panic(payload: Box<dyn std::any::Any + Send>) -> RenderError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("unknown panic")
        };
        RenderError::Panicked(message)
    }
}

/// Options for a [`TraceRenderer`].
#[derive(Clone, Debug)]
pub struct TraceOptions {
    /// Semicolon-separated directories (and symbol server caches) to search for companion PDBs.
    pub symbols_search_path: Option<String>,
    /// Log which debug information was found for each module at `info` level, and forward the
    /// native symbol engine's diagnostics.
    pub verbose: bool,
    /// Mark frames that were entered from outside managed code.
    pub include_foreign_boundary_marker: bool,
}

impl Default for TraceOptions {
    fn default() -> TraceOptions {
        TraceOptions {
            symbols_search_path: None,
            verbose: false,
            include_foreign_boundary_marker: true,
        }
    }
}

/// Renders exceptions with source locations.
///
/// A `TraceRenderer` owns the native symbol service and the module cache for the life of the
/// process. Create one with [`TraceRenderer::init`] at startup and call
/// [`TraceRenderer::shutdown`] once at exit; rendering is safe from any number of threads in
/// between.
///
/// Rendering never fails: a frame whose source can't be found is printed without it.
#[derive(Debug)]
pub struct TraceRenderer {
    options: TraceOptions,
    native: Arc<NativeSymbolService>,
    cache: ModuleResolutionCache,
}

impl TraceRenderer {
    /// Read modules from disk and find companion PDBs along the symbol search path.
    pub fn init(options: TraceOptions) -> TraceRenderer {
        TraceRenderer::with_services(options, FileModuleReader, SymbolPathResolver::default())
    }

    /// Use the given module reader and native symbol engine.
    ///
    /// If the engine fails to initialize, modules are still searched for embedded PDBs.
    pub fn with_services<R, N>(options: TraceOptions, reader: R, resolver: N) -> TraceRenderer
    where
        R: ModuleReader + 'static,
        N: NativeResolver + 'static,
    {
        let native = Arc::new(NativeSymbolService::new(resolver));
        let symbol_options = SymbolOptions::for_verbosity(options.verbose);
        if let Err(e) = native.initialize(options.symbols_search_path.as_deref(), symbol_options)
        {
            warn!("native symbol service unavailable: {e}");
        }
        let loader = ModuleDebugInfoLoader::new(reader, native.clone()).verbose(options.verbose);
        TraceRenderer::with_loader(options, loader, native)
    }

    /// Use a custom loader. `native` is only used for live address resolution.
    pub fn with_loader<L: DebugInfoLoader + 'static>(
        options: TraceOptions,
        loader: L,
        native: Arc<NativeSymbolService>,
    ) -> TraceRenderer {
        TraceRenderer {
            options,
            native,
            cache: ModuleResolutionCache::new(loader),
        }
    }

    /// Release the native symbol service and everything cached.
    ///
    /// Safe to call more than once. Rendering afterwards works, but finds less.
    pub fn shutdown(&self) {
        self.native.shutdown();
        self.cache.clear();
    }

    pub fn cache(&self) -> &ModuleResolutionCache {
        &self.cache
    }

    /// Statistics on the modules seen so far, keyed by module file name.
    pub fn stats(&self) -> HashMap<String, ModuleStats> {
        self.cache.stats()
    }

    /// Render `exception`, its inner exceptions, and their stacks.
    pub fn render(&self, exception: &ExceptionInfo) -> String {
        let mut output = String::new();
        if let Err(e) = self.write_exception(&mut output, exception) {
            warn!("failed to render exception: {e}");
        }
        output
    }

    /// Render a stack without an exception header, one frame per line.
    pub fn render_stack(&self, frames: &[StackFrame]) -> String {
        let mut output = String::new();
        if let Err(e) = self.write_frames(&mut output, frames, false) {
            warn!("failed to render stack: {e}");
        }
        output
    }

    /// Replace the detail of `record` with the rendered exception, if it has one.
    pub fn before_log(&self, record: &mut ErrorRecord) {
        if let Some(exception) = &record.exception {
            let rendered = self.render(exception);
            if !rendered.is_empty() {
                record.detail = rendered;
            }
        }
    }

    /// Resolve the signature and source location of `frame`.
    pub fn annotate(&self, frame: &StackFrame) -> AnnotatedFrame {
        let method = &frame.method;
        let function = FunctionId::new(ModuleKey::for_module(&*frame.module), method.token)
            .instantiation(
                method.declaring_type.as_deref(),
                method.parameters.iter().map(|p| p.type_name.as_str()),
            );
        let signature = self
            .cache
            .signature(&function, || format_signature(&frame.method));

        let entry = self.cache.ensure(&*frame.module);
        let (file, line) = match self.locate(frame, &entry) {
            Some((raw, line)) => (Some(self.cache.resolve_path(&entry, &raw)), line),
            None => (None, None),
        };
        trace!(
            "{}+{:?}: {:?} line {:?}",
            signature,
            frame.il_offset,
            file,
            line
        );
        AnnotatedFrame {
            signature,
            file,
            line,
        }
    }

    /// The raw file and line of `frame`, preferring what the runtime knows.
    fn locate(&self, frame: &StackFrame, entry: &CacheEntry) -> Option<(String, Option<u32>)> {
        if let Some(file) = &frame.file {
            return Some((file.clone(), frame.line));
        }
        match entry.source() {
            DebugInfoSource::Embedded | DebugInfoSource::Companion => {
                let location = entry.source_location(frame.method.token, frame.il_offset?)?;
                Some((location.file.to_string(), Some(location.line)))
            }
            DebugInfoSource::Native => {
                match self
                    .native
                    .resolve_address(&*frame.module, frame.native_offset?)
                {
                    Ok(location) => location.map(|(file, line)| (file, Some(line))),
                    Err(e) => {
                        trace!("native address resolution failed: {e}");
                        None
                    }
                }
            }
            DebugInfoSource::None => None,
        }
    }

    fn write_exception<W: Write>(&self, f: &mut W, exception: &ExceptionInfo) -> fmt::Result {
        f.write_str(&exception.type_name)?;
        if let Some(message) = exception.message.as_deref().filter(|m| !m.is_empty()) {
            write!(f, ": {message}")?;
        }
        if let Some(inner) = &exception.inner {
            f.write_str(" ---> ")?;
            self.write_exception(f, inner)?;
            write!(f, "\n{INNER_EXCEPTION_TRAILER}")?;
        }
        self.write_frames(f, &exception.frames, true)
    }

    fn write_frames<W: Write>(
        &self,
        f: &mut W,
        frames: &[StackFrame],
        after_header: bool,
    ) -> fmt::Result {
        for (i, frame) in frames.iter().enumerate() {
            if after_header || i > 0 {
                f.write_char('\n')?;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| self.annotate(frame))) {
                Ok(annotated) => write!(f, "{annotated}")?,
                Err(payload) => {
                    let e = RenderError::from_panic(payload);
                    warn!("source lookup failed for {}: {e}", frame.method.name);
                    write!(
                        f,
                        "   at {} [source lookup failed: {e}]",
                        format_signature(&frame.method)
                    )?;
                }
            }
            if frame.last_before_foreign_boundary && self.options.include_foreign_boundary_marker {
                write!(f, "\n{FOREIGN_BOUNDARY_MARKER}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MethodInfo;
    use sourcelink_symbols::{LoadError, ModuleDebugInfo, SimpleModule};

    struct NoDebugInfo;

    impl DebugInfoLoader for NoDebugInfo {
        fn load(
            &self,
            _: &dyn sourcelink_common::traits::Module,
        ) -> Result<ModuleDebugInfo, LoadError> {
            Ok(ModuleDebugInfo::none(vec![]))
        }
    }

    fn renderer() -> TraceRenderer {
        let native = Arc::new(NativeSymbolService::new(SymbolPathResolver::default()));
        TraceRenderer::with_loader(TraceOptions::default(), NoDebugInfo, native)
    }

    fn frame(token: u32, name: &str) -> StackFrame {
        let module = Arc::new(SimpleModule::new("/app/Sample.dll", 0x1000_0000));
        StackFrame::new(MethodInfo::new(token, "Sample.Program", name), module).il_offset(4)
    }

    #[test]
    fn test_empty_message() {
        let exception = ExceptionInfo {
            message: None,
            ..ExceptionInfo::new("System.Exception", "")
        };
        assert_eq!(renderer().render(&exception), "System.Exception");
        let exception = ExceptionInfo::new("System.Exception", "");
        assert_eq!(renderer().render(&exception), "System.Exception");
    }

    #[test]
    fn test_render_stack() {
        let frames = vec![frame(0x0600_0002, "Inner"), frame(0x0600_0001, "Main")];
        assert_eq!(
            renderer().render_stack(&frames),
            "   at Sample.Program.Inner()\n   at Sample.Program.Main()"
        );
        assert_eq!(renderer().render_stack(&[]), "");
    }

    #[test]
    fn test_generic_instantiations_share_token() {
        let module = Arc::new(SimpleModule::new("/app/Sample.dll", 0x1000_0000));
        let add = |ty: &str, param: &str| {
            let method = MethodInfo::new(0x0600_0010, ty, "Add").param(param, "item");
            StackFrame::new(method, module.clone()).il_offset(2)
        };
        let frames = vec![
            add("System.Collections.Generic.List`1[System.Int32]", "System.Int32"),
            add("System.Collections.Generic.List`1[System.String]", "System.String"),
            add("System.Collections.Generic.List`1[System.Int32]", "System.Int32"),
        ];
        assert_eq!(
            renderer().render_stack(&frames),
            "   at System.Collections.Generic.List`1[System.Int32].Add(System.Int32 item)\n   \
             at System.Collections.Generic.List`1[System.String].Add(System.String item)\n   \
             at System.Collections.Generic.List`1[System.Int32].Add(System.Int32 item)"
        );
    }

    #[test]
    fn test_foreign_boundary_marker() {
        let frames = vec![
            frame(0x0600_0002, "Callback").foreign_boundary(),
            frame(0x0600_0001, "Main"),
        ];
        assert_eq!(
            renderer().render_stack(&frames),
            format!(
                "   at Sample.Program.Callback()\n{FOREIGN_BOUNDARY_MARKER}\n   at Sample.Program.Main()"
            )
        );

        let native = Arc::new(NativeSymbolService::new(SymbolPathResolver::default()));
        let options = TraceOptions {
            include_foreign_boundary_marker: false,
            ..TraceOptions::default()
        };
        let quiet = TraceRenderer::with_loader(options, NoDebugInfo, native);
        assert_eq!(
            quiet.render_stack(&frames),
            "   at Sample.Program.Callback()\n   at Sample.Program.Main()"
        );
    }

    #[test]
    fn test_before_log() {
        let renderer = renderer();
        let mut record = ErrorRecord {
            exception: None,
            detail: String::from("original"),
        };
        renderer.before_log(&mut record);
        assert_eq!(record.detail, "original");

        record.exception = Some(
            ExceptionInfo::new("System.Exception", "boom").frames(vec![frame(0x0600_0001, "Main")]),
        );
        renderer.before_log(&mut record);
        assert_eq!(
            record.detail,
            "System.Exception: boom\n   at Sample.Program.Main()"
        );
    }

    #[test]
    fn test_shutdown_twice() {
        let renderer = renderer();
        renderer.render_stack(&[frame(0x0600_0001, "Main")]);
        assert_eq!(renderer.stats().len(), 1);
        renderer.shutdown();
        renderer.shutdown();
        assert!(renderer.stats().is_empty());
    }
}
