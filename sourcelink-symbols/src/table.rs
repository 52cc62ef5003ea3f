use std::sync::Arc;

use portable_pdb::SequencePoint;
use sourcelink_common::format::HIDDEN_LINE;

/// A document path as recorded in debug metadata, shared between all breakpoints that refer to it.
pub type DocumentRef = Arc<str>;

/// A mapping from an IL offset within a method to a source location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub offset: u32,
    pub file: DocumentRef,
    pub line: u32,
    pub column: u32,
}

impl Breakpoint {
    /// Hidden breakpoints cover compiler-generated code with no user-visible location.
    pub fn is_hidden(&self) -> bool {
        self.line == HIDDEN_LINE
    }
}

/// The breakpoints of one method, ordered by offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLocationTable {
    breakpoints: Vec<Breakpoint>,
}

impl SourceLocationTable {
    pub fn new(mut breakpoints: Vec<Breakpoint>) -> SourceLocationTable {
        // Stable, so breakpoints sharing an offset keep their metadata order.
        breakpoints.sort_by_key(|b| b.offset);
        SourceLocationTable { breakpoints }
    }

    /// Build a table from decoded sequence points.
    ///
    /// `documents` holds the document names by row, so `documents[0]` is row 1. Points naming a
    /// document that doesn't exist are dropped.
    pub fn from_sequence_points(
        points: &[SequencePoint],
        documents: &[DocumentRef],
    ) -> SourceLocationTable {
        let breakpoints = points
            .iter()
            .filter_map(|point| {
                let file = documents.get((point.document as usize).checked_sub(1)?)?;
                Some(Breakpoint {
                    offset: point.il_offset,
                    file: file.clone(),
                    line: point.start_line,
                    column: point.start_column,
                })
            })
            .collect();
        SourceLocationTable::new(breakpoints)
    }

    /// Find the breakpoint covering `offset`.
    ///
    /// This is the last breakpoint at or before `offset`, or the first breakpoint if `offset`
    /// precedes all of them. Hidden breakpoints are skipped by walking backwards; if every
    /// candidate is hidden there is no location.
    pub fn lookup(&self, offset: u32) -> Option<&Breakpoint> {
        let idx = self.breakpoints.partition_point(|b| b.offset <= offset);
        let start = idx.saturating_sub(1);
        self.breakpoints
            .get(..=start)?
            .iter()
            .rev()
            .find(|b| !b.is_hidden())
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }
}
