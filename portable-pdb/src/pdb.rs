use std::fs::File;
use std::ops::{Deref, Range};
use std::path::Path;

use debugid::DebugId;
use memmap2::Mmap;
use scroll::{Pread, LE};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::format::{self as md, MetadataTable, GUID};
use crate::metadata::{self, Streams, TableLayout};
use crate::{Error, Probe};

/// A source document referenced by sequence points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    /// The path recorded at build time, e.g. `/_/src/Program.cs`.
    pub name: String,
    pub hash_algorithm: Uuid,
    pub hash: Vec<u8>,
    pub language: Uuid,
}

/// A mapping from an IL offset to a source range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SequencePoint {
    pub il_offset: u32,
    /// 1-based row of the [`Document`] this point is in.
    pub document: u32,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SequencePoint {
    /// Whether this point marks code with no user-visible location.
    pub fn is_hidden(&self) -> bool {
        self.start_line == md::HIDDEN_LINE
    }
}

/// A row of the CustomDebugInformation table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomDebugInformation<'a> {
    /// The table and 1-based row this information is attached to.
    pub parent: (MetadataTable, u32),
    pub kind: GUID,
    pub value: &'a [u8],
}

/// A parsed portable PDB.
///
/// Portable PDBs are ECMA-335 metadata containing only debug tables: the type-system tables
/// they refer to live in the assembly, and only their row counts are recorded here.
#[derive(Debug)]
pub struct PortablePdb<T>
where
    T: Deref<Target = [u8]>,
{
    data: T,
    tables: Range<usize>,
    blob: Range<usize>,
    guid: Range<usize>,
    layout: TableLayout,
    pdb_id: [u8; 20],
}

impl PortablePdb<Mmap> {
    /// Read a `PortablePdb` from a file on disk.
    pub fn read_path<P>(path: P) -> Result<PortablePdb<Mmap>, Error>
    where
        P: AsRef<Path>,
    {
        let f = File::open(path).or(Err(Error::FileNotFound))?;
        let mmap = unsafe { Mmap::map(&f).or(Err(Error::IoError))? };
        PortablePdb::read(mmap)
    }
}

impl<T> PortablePdb<T>
where
    T: Deref<Target = [u8]>,
{
    /// Read a `PortablePdb` from the provided `data`.
    ///
    /// Typically this will be a `Vec<u8>` holding an inflated embedded PDB, or a
    /// `memmap2::Mmap` of a companion file.
    pub fn read(data: T) -> Result<PortablePdb<T>, Error> {
        if data.starts_with(md::MSF_SIGNATURE) {
            return Err(Error::NotPortable);
        }
        let streams = metadata::read_streams(&data)?;
        let Streams {
            tables,
            blob,
            guid,
            pdb,
        } = streams;
        let pdb = pdb.ok_or(Error::StreamNotFound("#Pdb"))?;
        let tables = tables.ok_or(Error::StreamNotFound("#~"))?;
        let empty = || 0..0;

        let mut offset = pdb.start;
        let header: md::PDB_STREAM_HEADER = data[..pdb.end]
            .gread_with(&mut offset, LE)
            .or(Err(Error::StreamOutOfBounds))?;
        let mut external_rows = [0u32; md::METADATA_TABLE_COUNT];
        for (id, count) in external_rows.iter_mut().enumerate() {
            if header.referenced_type_system_tables & (1 << id) != 0 {
                *count = data[..pdb.end]
                    .gread_with(&mut offset, LE)
                    .or(Err(Error::StreamOutOfBounds))?;
            }
        }

        let layout = TableLayout::read(&data[tables.clone()], &external_rows)?;
        trace!(
            "pdb: {} documents, {} methods",
            layout.row_count(MetadataTable::Document),
            layout.row_count(MetadataTable::MethodDebugInformation)
        );

        Ok(PortablePdb {
            tables,
            blob: blob.unwrap_or_else(empty),
            guid: guid.unwrap_or_else(empty),
            layout,
            pdb_id: header.pdb_id,
            data,
        })
    }

    /// Read a `PortablePdb`, reporting a classic MSF PDB as [`Probe::NotPresent`].
    pub fn probe(data: T) -> Probe<PortablePdb<T>> {
        match PortablePdb::read(data) {
            Ok(pdb) => Probe::Found(pdb),
            Err(Error::NotPortable) => {
                debug!("pdb: classic MSF pdb, not portable");
                Probe::NotPresent
            }
            Err(e) => Probe::Malformed(e),
        }
    }

    fn tables(&self) -> &[u8] {
        &self.data[self.tables.clone()]
    }

    fn blob(&self) -> &[u8] {
        &self.data[self.blob.clone()]
    }

    fn guid(&self) -> &[u8] {
        &self.data[self.guid.clone()]
    }

    fn row(&self, table: MetadataTable, row: u32) -> Result<Vec<u32>, Error> {
        self.layout.read_row(self.tables(), table, row)
    }

    /// The debug identifier, derived from the GUID part of the PDB id.
    ///
    /// Portable PDBs always have an age of 1.
    pub fn debug_id(&self) -> DebugId {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&self.pdb_id[..16]);
        DebugId::from_parts(Uuid::from_bytes_le(guid), 1)
    }

    pub fn document_count(&self) -> u32 {
        self.layout.row_count(MetadataTable::Document)
    }

    /// Number of rows of the MethodDebugInformation table, which parallels MethodDef.
    pub fn method_count(&self) -> u32 {
        self.layout.row_count(MetadataTable::MethodDebugInformation)
    }

    /// The 1-based `row` of the Document table.
    pub fn document(&self, row: u32) -> Result<Document, Error> {
        let columns = self.row(MetadataTable::Document, row)?;
        Ok(Document {
            name: self.document_name(columns[0])?,
            hash_algorithm: guid_to_uuid(metadata::read_guid(self.guid(), columns[1])?),
            hash: metadata::read_blob(self.blob(), columns[2])?.to_vec(),
            language: guid_to_uuid(metadata::read_guid(self.guid(), columns[3])?),
        })
    }

    /// Every document, in row order.
    pub fn documents(&self) -> Result<Vec<Document>, Error> {
        (1..=self.document_count())
            .map(|row| self.document(row))
            .collect()
    }

    /// Decode a document name blob: a separator byte followed by blob indices of the parts.
    fn document_name(&self, index: u32) -> Result<String, Error> {
        let blob = metadata::read_blob(self.blob(), index)?;
        let (&separator, mut parts) = match blob.split_first() {
            Some(split) => split,
            None => return Ok(String::new()),
        };
        let mut name = Vec::new();
        let mut first = true;
        while !parts.is_empty() {
            let mut offset = 0;
            let part = metadata::read_compressed_u32(parts, &mut offset)?;
            parts = &parts[offset..];
            if !first && separator != 0 {
                name.push(separator);
            }
            first = false;
            name.extend_from_slice(metadata::read_blob(self.blob(), part)?);
        }
        String::from_utf8(name).or(Err(Error::DocumentNameReadFailure))
    }

    /// The sequence points of the method whose MethodDef row is `method_row`, in IL order.
    ///
    /// Methods without debug information (abstract methods, for instance) have none.
    pub fn sequence_points(&self, method_row: u32) -> Result<Vec<SequencePoint>, Error> {
        let columns = self.row(MetadataTable::MethodDebugInformation, method_row)?;
        let (document, blob_index) = (columns[0], columns[1]);
        if blob_index == 0 {
            return Ok(vec![]);
        }
        let blob = metadata::read_blob(self.blob(), blob_index)?;
        decode_sequence_points(blob, document).or(Err(Error::SequencePointsReadFailure))
    }

    /// Every row of the CustomDebugInformation table.
    pub fn custom_debug_information(&self) -> Result<Vec<CustomDebugInformation<'_>>, Error> {
        let count = self.layout.row_count(MetadataTable::CustomDebugInformation);
        (1..=count)
            .map(|row| {
                let columns = self.row(MetadataTable::CustomDebugInformation, row)?;
                let parent = metadata::decode_has_custom_debug_information(columns[0])
                    .ok_or(Error::TableReadFailure)?;
                Ok(CustomDebugInformation {
                    parent,
                    kind: metadata::read_guid(self.guid(), columns[1])?,
                    value: metadata::read_blob(self.blob(), columns[2])?,
                })
            })
            .collect()
    }

    /// The raw source-link JSON attached to the module, if any.
    pub fn source_link(&self) -> Result<Option<&[u8]>, Error> {
        Ok(self
            .custom_debug_information()?
            .into_iter()
            .find(|cdi| cdi.parent.0 == MetadataTable::Module && cdi.kind == md::SOURCE_LINK_KIND)
            .map(|cdi| cdi.value))
    }
}

fn guid_to_uuid(guid: GUID) -> Uuid {
    Uuid::from_bytes_le(guid.to_bytes())
}

/// Decode a SequencePoints blob (Portable PDB spec, "Sequence Points Blob").
///
/// `document` is the MethodDebugInformation Document column; 0 means the blob starts with the
/// initial document.
fn decode_sequence_points(blob: &[u8], document: u32) -> Result<Vec<SequencePoint>, Error> {
    let read_u32 = |offset: &mut usize| metadata::read_compressed_u32(blob, offset);
    let read_i32 = |offset: &mut usize| metadata::read_compressed_i32(blob, offset);

    let offset = &mut 0;
    let _local_signature = read_u32(offset)?;
    let mut document = if document == 0 {
        read_u32(offset)?
    } else {
        document
    };

    let mut points = vec![];
    let mut il_offset: Option<u32> = None;
    let mut previous_start: Option<(u32, u32)> = None;
    while *offset < blob.len() {
        let delta_il = read_u32(offset)?;
        let il = match il_offset {
            None => delta_il,
            Some(_) if delta_il == 0 => {
                document = read_u32(offset)?;
                continue;
            }
            Some(previous) => previous
                .checked_add(delta_il)
                .ok_or(Error::SequencePointsReadFailure)?,
        };
        il_offset = Some(il);

        let delta_lines = read_u32(offset)?;
        let delta_columns = if delta_lines == 0 {
            i64::from(read_u32(offset)?)
        } else {
            i64::from(read_i32(offset)?)
        };

        if delta_lines == 0 && delta_columns == 0 {
            points.push(SequencePoint {
                il_offset: il,
                document,
                start_line: md::HIDDEN_LINE,
                start_column: 0,
                end_line: md::HIDDEN_LINE,
                end_column: 0,
            });
            continue;
        }

        let (start_line, start_column) = match previous_start {
            None => (i64::from(read_u32(offset)?), i64::from(read_u32(offset)?)),
            Some((line, column)) => (
                i64::from(line) + i64::from(read_i32(offset)?),
                i64::from(column) + i64::from(read_i32(offset)?),
            ),
        };
        let to_u32 = |v: i64| u32::try_from(v).or(Err(Error::SequencePointsReadFailure));
        let start_line = to_u32(start_line)?;
        let start_column = to_u32(start_column)?;
        previous_start = Some((start_line, start_column));

        points.push(SequencePoint {
            il_offset: il,
            document,
            start_line,
            start_column,
            end_line: to_u32(i64::from(start_line) + i64::from(delta_lines))?,
            end_column: to_u32(i64::from(start_column) + delta_columns)?,
        });
    }
    Ok(points)
}
