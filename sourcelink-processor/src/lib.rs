//! A library for rendering managed exceptions with source files, line numbers and source-link
//! URLs.
//!
//! Hand a [`TraceRenderer`] the exception your runtime caught, described as an
//! [`ExceptionInfo`], and get back the familiar text:
//!
//! ```text
//! System.InvalidOperationException: Sequence contains no elements
//!    at Sample.Program.First(System.Int32[] values) in https://example.org/sample/Program.cs:line 17
//!    at Sample.Program.Main(System.String[] args) in https://example.org/sample/Program.cs:line 9
//! ```
//!
//! Source locations come from the frame itself when the runtime knows them, and otherwise from
//! the module's debug information as found by [`sourcelink_symbols`]. File paths are rewritten
//! through the module's source-link table when it has one.
//!
//! # Examples
//!
//! ```no_run
//! use sourcelink_processor::{ExceptionInfo, MethodInfo, StackFrame, TraceOptions, TraceRenderer};
//! use sourcelink_symbols::SimpleModule;
//! use std::sync::Arc;
//!
//! let renderer = TraceRenderer::init(TraceOptions::default());
//! let module = Arc::new(SimpleModule::new("/app/Sample.dll", 0x7f00_0000_0000));
//! let main = MethodInfo::new(0x0600_0001, "Sample.Program", "Main").param("System.String[]", "args");
//! let exception = ExceptionInfo::new("System.Exception", "boom")
//!     .frames(vec![StackFrame::new(main, module).il_offset(0x12)]);
//! println!("{}", renderer.render(&exception));
//! renderer.shutdown();
//! ```

#![warn(missing_debug_implementations)]

mod model;
mod renderer;
mod signature;

pub use crate::model::*;
pub use crate::renderer::*;
pub use crate::signature::*;

#[cfg(test)]
#[ctor::ctor]
unsafe fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}
