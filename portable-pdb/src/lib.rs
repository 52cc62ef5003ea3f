//! A parser for managed PE images and portable PDB debug metadata.
//!
//! [`PeImage`] reads a module's headers, its debug directory, the CodeView record naming its
//! companion PDB, and the deflate-compressed portable PDB some images embed.
//! [`PortablePdb`] reads the ECMA-335 metadata of a portable PDB: documents, per-method
//! sequence points, and custom debug information such as the source-link table.
//!
//! Both readers work over anything that derefs to `[u8]`: a `Vec<u8>`, a `&[u8]`, or a
//! `memmap2::Mmap` when created with `read_path`.
//!
//! Probing functions return a [`Probe`], which keeps "the thing isn't there" apart from "the
//! thing is there but broken" so callers can choose a fallback without inspecting errors.

#![warn(missing_debug_implementations)]

pub use sourcelink_common::format;

mod metadata;
mod pdb;
mod pe;

pub use crate::pdb::*;
pub use crate::pe::*;

/// Errors encountered while reading a `PeImage` or a `PortablePdb`.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("File not found")]
    FileNotFound,
    #[error("I/O error")]
    IoError,
    #[error("Missing DOS header (not a PE image?)")]
    MissingDosHeader,
    #[error("Missing or mismatched PE header")]
    MissingPeHeader,
    #[error("Unknown optional header magic {0:#x}")]
    UnknownOptionalHeader(u16),
    #[error("RVA {0:#x} is not mapped by any section")]
    UnmappedRva(u32),
    #[error("Error reading the debug directory")]
    DebugDirectoryReadFailure,
    #[error("Error reading CodeView data")]
    CodeViewReadFailure,
    #[error("Embedded portable PDB has a bad signature")]
    EmbeddedPdbSignatureMismatch,
    #[error("Embedded portable PDB size mismatch: expected {expected} bytes, found {actual} bytes")]
    EmbeddedPdbSizeMismatch { expected: usize, actual: usize },
    #[error("Failed to inflate embedded portable PDB")]
    InflateFailure,
    #[error("Not a portable PDB (classic MSF PDB)")]
    NotPortable,
    #[error("Missing metadata root (empty file?)")]
    MissingMetadataRoot,
    #[error("Metadata root signature mismatch")]
    MetadataSignatureMismatch,
    #[error("Stream {0} not found")]
    StreamNotFound(&'static str),
    #[error("Stream extends past the end of the metadata")]
    StreamOutOfBounds,
    #[error("Error reading the table stream")]
    TableReadFailure,
    #[error("Table {0:#x} cannot appear in debug metadata")]
    UnsupportedTable(u8),
    #[error("Row {row} out of range for table {table:?}")]
    RowOutOfRange {
        table: format::MetadataTable,
        row: u32,
    },
    #[error("Heap index out of range")]
    HeapIndexOutOfRange,
    #[error("Bad compressed integer")]
    BadCompressedInteger,
    #[error("Error decoding sequence points")]
    SequencePointsReadFailure,
    #[error("Document name is not valid UTF-8")]
    DocumentNameReadFailure,
}

impl Error {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            Error::FileNotFound => "FileNotFound",
            Error::IoError => "IoError",
            Error::MissingDosHeader => "MissingDosHeader",
            Error::MissingPeHeader => "MissingPeHeader",
            Error::UnknownOptionalHeader(_) => "UnknownOptionalHeader",
            Error::UnmappedRva(_) => "UnmappedRva",
            Error::DebugDirectoryReadFailure => "DebugDirectoryReadFailure",
            Error::CodeViewReadFailure => "CodeViewReadFailure",
            Error::EmbeddedPdbSignatureMismatch => "EmbeddedPdbSignatureMismatch",
            Error::EmbeddedPdbSizeMismatch { .. } => "EmbeddedPdbSizeMismatch",
            Error::InflateFailure => "InflateFailure",
            Error::NotPortable => "NotPortable",
            Error::MissingMetadataRoot => "MissingMetadataRoot",
            Error::MetadataSignatureMismatch => "MetadataSignatureMismatch",
            Error::StreamNotFound(_) => "StreamNotFound",
            Error::StreamOutOfBounds => "StreamOutOfBounds",
            Error::TableReadFailure => "TableReadFailure",
            Error::UnsupportedTable(_) => "UnsupportedTable",
            Error::RowOutOfRange { .. } => "RowOutOfRange",
            Error::HeapIndexOutOfRange => "HeapIndexOutOfRange",
            Error::BadCompressedInteger => "BadCompressedInteger",
            Error::SequencePointsReadFailure => "SequencePointsReadFailure",
            Error::DocumentNameReadFailure => "DocumentNameReadFailure",
        }
    }
}

/// The outcome of looking for a piece of debug metadata.
#[derive(Debug)]
pub enum Probe<T> {
    /// The metadata exists and parsed.
    Found(T),
    /// There is nothing to find here; try somewhere else.
    NotPresent,
    /// The metadata exists but could not be parsed.
    Malformed(Error),
}

impl<T> Probe<T> {
    /// Lift a read result: errors become [`Probe::Malformed`].
    pub fn from_result(result: Result<T, Error>) -> Probe<T> {
        match result {
            Ok(value) => Probe::Found(value),
            Err(e) => Probe::Malformed(e),
        }
    }

    /// Chain another probe onto a found value.
    pub fn and_then<U, F: FnOnce(T) -> Probe<U>>(self, f: F) -> Probe<U> {
        match self {
            Probe::Found(value) => f(value),
            Probe::NotPresent => Probe::NotPresent,
            Probe::Malformed(e) => Probe::Malformed(e),
        }
    }

    pub fn found(self) -> Option<T> {
        match self {
            Probe::Found(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
#[ctor::ctor]
unsafe fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
