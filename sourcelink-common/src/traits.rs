use std::borrow::Cow;

use debugid::DebugId;

/// A managed executable or library loaded in a process.
pub trait Module {
    /// The base address of this module as it was loaded by the process.
    ///
    /// Zero when the runtime does not expose one.
    fn base_address(&self) -> u64;
    /// The size of the module.
    fn size(&self) -> u64;
    /// The path or file name that the module was loaded from.
    fn code_file(&self) -> Cow<'_, str>;
    /// The file containing debugging information associated with the module,
    /// when it is known up front.
    fn debug_file(&self) -> Option<Cow<'_, str>>;
    /// Identifies a specific build of the associated debug file.
    fn debug_identifier(&self) -> Option<DebugId>;
    /// Whether this module was emitted at runtime and has no backing file.
    ///
    /// Dynamic modules never have debug metadata.
    fn is_dynamic(&self) -> bool {
        false
    }
}

/// Implement Module for 2-tuples of (code file, base address) for convenience.
impl Module for (&str, u64) {
    fn base_address(&self) -> u64 {
        self.1
    }
    fn size(&self) -> u64 {
        0
    }
    fn code_file(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.0)
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        None
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        None
    }
}

/// A [`Module`] built from plain values, for hosts and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimpleModule {
    pub base_address: u64,
    pub size: u64,
    pub code_file: String,
    pub debug_file: Option<String>,
    pub debug_identifier: Option<DebugId>,
    pub dynamic: bool,
}

impl SimpleModule {
    pub fn new(code_file: &str, base_address: u64) -> SimpleModule {
        SimpleModule {
            base_address,
            code_file: code_file.to_owned(),
            ..SimpleModule::default()
        }
    }

    /// A module emitted at runtime.
    pub fn dynamic(name: &str) -> SimpleModule {
        SimpleModule {
            code_file: name.to_owned(),
            dynamic: true,
            ..SimpleModule::default()
        }
    }
}

impl Module for SimpleModule {
    fn base_address(&self) -> u64 {
        self.base_address
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn code_file(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.code_file)
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        self.debug_file.as_deref().map(Cow::Borrowed)
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_identifier
    }
    fn is_dynamic(&self) -> bool {
        self.dynamic
    }
}

/// The file name component of `path`, accepting both `/` and `\` separators.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// `path` without its final extension.
pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(dot) => &name[..dot],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basename() {
        assert_eq!(basename(r"C:\app\bin\Sample.dll"), "Sample.dll");
        assert_eq!(basename("/usr/lib/app/Sample.dll"), "Sample.dll");
        assert_eq!(basename("Sample.dll"), "Sample.dll");
        assert_eq!(strip_extension("Sample.dll"), "Sample");
        assert_eq!(strip_extension(".hidden"), ".hidden");
    }

    #[test]
    fn test_simple_module() {
        let module = SimpleModule::new("/app/Sample.dll", 0x1000);
        assert_eq!(module.code_file(), "/app/Sample.dll");
        assert!(!module.is_dynamic());
        assert!(SimpleModule::dynamic("RefEmit_InMemoryManifestModule").is_dynamic());
        assert_eq!(("/app/Other.dll", 7).base_address(), 7);
    }
}
