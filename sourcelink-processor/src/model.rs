//! The exceptions and stack frames handed over by the runtime.

use std::fmt;
use std::sync::Arc;

use sourcelink_common::traits::Module;

/// A parameter of a method, as `Type name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    pub type_name: String,
    pub name: String,
}

/// The method a frame is executing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    /// The MethodDef metadata token.
    pub token: u32,
    /// Full name of the declaring type, absent for global methods.
    pub declaring_type: Option<String>,
    pub name: String,
    pub parameters: Vec<Parameter>,
}

impl MethodInfo {
    pub fn new(token: u32, declaring_type: &str, name: &str) -> MethodInfo {
        MethodInfo {
            token,
            declaring_type: Some(declaring_type.to_owned()),
            name: name.to_owned(),
            parameters: vec![],
        }
    }

    pub fn param(mut self, type_name: &str, name: &str) -> MethodInfo {
        self.parameters.push(Parameter {
            type_name: type_name.to_owned(),
            name: name.to_owned(),
        });
        self
    }
}

/// One frame of a captured stack.
#[derive(Clone)]
pub struct StackFrame {
    pub method: MethodInfo,
    pub module: Arc<dyn Module + Send + Sync>,
    /// Offset of the current instruction in the method's IL, when known.
    pub il_offset: Option<u32>,
    /// Offset of the current instruction from the module base, when known.
    pub native_offset: Option<u64>,
    /// File name the runtime already resolved, if any.
    pub file: Option<String>,
    pub line: Option<u32>,
    /// The next frame was called from outside managed code.
    pub last_before_foreign_boundary: bool,
}

impl fmt::Debug for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackFrame")
            .field("method", &self.method)
            .field("module", &self.module.code_file())
            .field("il_offset", &self.il_offset)
            .field("native_offset", &self.native_offset)
            .field("file", &self.file)
            .field("line", &self.line)
            .field("last_before_foreign_boundary", &self.last_before_foreign_boundary)
            .finish()
    }
}

impl StackFrame {
    pub fn new(method: MethodInfo, module: Arc<dyn Module + Send + Sync>) -> StackFrame {
        StackFrame {
            method,
            module,
            il_offset: None,
            native_offset: None,
            file: None,
            line: None,
            last_before_foreign_boundary: false,
        }
    }

    pub fn il_offset(mut self, offset: u32) -> StackFrame {
        self.il_offset = Some(offset);
        self
    }

    pub fn native_offset(mut self, offset: u64) -> StackFrame {
        self.native_offset = Some(offset);
        self
    }

    /// Use a file and line the runtime already knows.
    pub fn source(mut self, file: &str, line: u32) -> StackFrame {
        self.file = Some(file.to_owned());
        self.line = Some(line);
        self
    }

    pub fn foreign_boundary(mut self) -> StackFrame {
        self.last_before_foreign_boundary = true;
        self
    }
}

/// An exception with its stack, and the exception that caused it.
#[derive(Clone, Debug)]
pub struct ExceptionInfo {
    /// Full name of the exception type.
    pub type_name: String,
    pub message: Option<String>,
    pub inner: Option<Box<ExceptionInfo>>,
    /// Innermost frame first.
    pub frames: Vec<StackFrame>,
}

impl ExceptionInfo {
    pub fn new(type_name: &str, message: &str) -> ExceptionInfo {
        ExceptionInfo {
            type_name: type_name.to_owned(),
            message: Some(message.to_owned()),
            inner: None,
            frames: vec![],
        }
    }

    pub fn inner(mut self, inner: ExceptionInfo) -> ExceptionInfo {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn frames(mut self, frames: Vec<StackFrame>) -> ExceptionInfo {
        self.frames = frames;
        self
    }
}

/// A frame ready to be printed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotatedFrame {
    pub signature: Arc<str>,
    pub file: Option<Arc<str>>,
    pub line: Option<u32>,
}

impl fmt::Display for AnnotatedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "   at {}", self.signature)?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " in {file}:line {line}"),
            (Some(file), None) => write!(f, " in {file}"),
            _ => Ok(()),
        }
    }
}

/// An error about to be logged by the host.
#[derive(Clone, Debug, Default)]
pub struct ErrorRecord {
    pub exception: Option<ExceptionInfo>,
    /// The text that will be logged.
    pub detail: String,
}
