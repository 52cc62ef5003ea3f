//! The ECMA-335 physical metadata layout shared by assemblies and portable PDBs.
//!
//! Only what a portable PDB needs is implemented: the metadata root and its stream headers,
//! the `#Strings`, `#Blob` and `#GUID` heaps, and a `#~` stream containing debug tables.

use std::ops::Range;

use num_traits::FromPrimitive;
use scroll::{Pread, LE};

use crate::format::{self as md, HeapSizes, MetadataTable, GUID};
use crate::Error;

/// Read an ECMA-335 compressed unsigned integer (II.23.2).
pub fn read_compressed_u32(bytes: &[u8], offset: &mut usize) -> Result<u32, Error> {
    let first = *bytes.get(*offset).ok_or(Error::BadCompressedInteger)?;
    let (len, value) = match first {
        b if b & 0x80 == 0 => (1, u32::from(b)),
        b if b & 0xc0 == 0x80 => (2, u32::from(b & 0x3f)),
        b if b & 0xe0 == 0xc0 => (4, u32::from(b & 0x1f)),
        _ => return Err(Error::BadCompressedInteger),
    };
    let rest = bytes
        .get(*offset + 1..*offset + len)
        .ok_or(Error::BadCompressedInteger)?;
    let value = rest.iter().fold(value, |acc, &b| (acc << 8) | u32::from(b));
    *offset += len;
    Ok(value)
}

/// Read an ECMA-335 compressed signed integer.
///
/// The sign bit is rotated into the least significant bit of the unsigned encoding.
pub fn read_compressed_i32(bytes: &[u8], offset: &mut usize) -> Result<i32, Error> {
    let width = match bytes.get(*offset) {
        Some(b) if b & 0x80 == 0 => 1,
        Some(b) if b & 0xc0 == 0x80 => 2,
        _ => 4,
    };
    let raw = read_compressed_u32(bytes, offset)?;
    let value = (raw >> 1) as i32;
    if raw & 1 == 0 {
        return Ok(value);
    }
    Ok(match width {
        1 => value - 0x40,
        2 => value - 0x2000,
        _ => value - 0x1000_0000,
    })
}

/// The streams of a metadata root, as ranges of the metadata bytes.
#[derive(Clone, Debug, Default)]
pub struct Streams {
    pub tables: Option<Range<usize>>,
    pub blob: Option<Range<usize>>,
    pub guid: Option<Range<usize>>,
    pub pdb: Option<Range<usize>>,
}

/// Read the metadata root at the start of `data` and locate its streams.
pub fn read_streams(data: &[u8]) -> Result<Streams, Error> {
    let mut offset = 0;
    let root: md::METADATA_ROOT = data
        .gread_with(&mut offset, LE)
        .or(Err(Error::MissingMetadataRoot))?;
    if root.signature != md::METADATA_SIGNATURE {
        return Err(Error::MetadataSignatureMismatch);
    }
    // Version string, already padded to four bytes by the writer, then flags.
    offset = offset
        .checked_add(root.length as usize)
        .ok_or(Error::MissingMetadataRoot)?;
    let _flags: u16 = data
        .gread_with(&mut offset, LE)
        .or(Err(Error::MissingMetadataRoot))?;
    let stream_count: u16 = data
        .gread_with(&mut offset, LE)
        .or(Err(Error::MissingMetadataRoot))?;

    let mut streams = Streams::default();
    for _ in 0..stream_count {
        let header: md::STREAM_HEADER = data
            .gread_with(&mut offset, LE)
            .or(Err(Error::MissingMetadataRoot))?;
        let start = header.offset as usize;
        let end = start
            .checked_add(header.size as usize)
            .filter(|&end| end <= data.len())
            .ok_or(Error::StreamOutOfBounds)?;
        let range = Some(start..end);
        match header.name.as_str() {
            // `#-` is the uncompressed variant; its layout is identical for debug tables.
            "#~" | "#-" => streams.tables = range,
            "#Blob" => streams.blob = range,
            "#GUID" => streams.guid = range,
            "#Pdb" => streams.pdb = range,
            _ => {}
        }
    }
    Ok(streams)
}

/// Read a length-prefixed blob from the `#Blob` heap. Index 0 is the empty blob.
pub fn read_blob(heap: &[u8], index: u32) -> Result<&[u8], Error> {
    if index == 0 {
        return Ok(&[]);
    }
    let mut offset = index as usize;
    let len = read_compressed_u32(heap, &mut offset).or(Err(Error::HeapIndexOutOfRange))?;
    heap.get(offset..offset + len as usize)
        .ok_or(Error::HeapIndexOutOfRange)
}

/// Read a GUID from the `#GUID` heap. Indices are 1-based; 0 is the null GUID.
pub fn read_guid(heap: &[u8], index: u32) -> Result<GUID, Error> {
    if index == 0 {
        return Ok(GUID::default());
    }
    heap.pread_with((index as usize - 1) * 16, LE)
        .or(Err(Error::HeapIndexOutOfRange))
}

/// The kind of a table column, which determines its width.
#[derive(Copy, Clone, Debug)]
enum Column {
    Fixed(usize),
    String,
    Guid,
    Blob,
    Index(MetadataTable),
    HasCustomDebugInformation,
}

fn columns(table: MetadataTable) -> Result<&'static [Column], Error> {
    use Column::*;
    use MetadataTable as T;
    Ok(match table {
        T::Document => &[Blob, Guid, Blob, Guid],
        T::MethodDebugInformation => &[Index(T::Document), Blob],
        T::LocalScope => &[
            Index(T::MethodDef),
            Index(T::ImportScope),
            Index(T::LocalVariable),
            Index(T::LocalConstant),
            Fixed(4),
            Fixed(4),
        ],
        T::LocalVariable => &[Fixed(2), Fixed(2), String],
        T::LocalConstant => &[String, Blob],
        T::ImportScope => &[Index(T::ImportScope), Blob],
        T::StateMachineMethod => &[Index(T::MethodDef), Index(T::MethodDef)],
        T::CustomDebugInformation => &[HasCustomDebugInformation, Guid, Blob],
        other => return Err(Error::UnsupportedTable(other as u8)),
    })
}

/// Where each table of a `#~` stream lives and how wide its columns are.
#[derive(Clone, Debug)]
pub struct TableLayout {
    heap_sizes: HeapSizes,
    /// Row counts of every table, including type-system tables known only through `#Pdb`.
    rows: [u32; md::METADATA_TABLE_COUNT],
    /// Offset of each present table from the start of the `#~` stream.
    offsets: [usize; md::METADATA_TABLE_COUNT],
}

impl TableLayout {
    /// Read the `#~` stream header. `external_rows` are the row counts of type-system tables
    /// the `#Pdb` stream reports.
    pub fn read(
        stream: &[u8],
        external_rows: &[u32; md::METADATA_TABLE_COUNT],
    ) -> Result<TableLayout, Error> {
        let mut offset = 0;
        let header: md::TABLES_HEADER = stream
            .gread_with(&mut offset, LE)
            .or(Err(Error::TableReadFailure))?;
        let heap_sizes = HeapSizes::from_bits_truncate(header.heap_sizes);

        let mut rows = *external_rows;
        for (id, count) in rows.iter_mut().enumerate() {
            if header.valid & (1 << id) != 0 {
                *count = stream
                    .gread_with(&mut offset, LE)
                    .or(Err(Error::TableReadFailure))?;
            }
        }

        let mut layout = TableLayout {
            heap_sizes,
            rows,
            offsets: [0; md::METADATA_TABLE_COUNT],
        };
        for id in 0..md::METADATA_TABLE_COUNT {
            if header.valid & (1 << id) == 0 {
                continue;
            }
            let table = MetadataTable::from_usize(id).ok_or(Error::UnsupportedTable(id as u8))?;
            layout.offsets[id] = offset;
            let size = (layout.row_size(table)? as u64) * u64::from(layout.rows[id]);
            offset = offset
                .checked_add(size as usize)
                .filter(|&end| end <= stream.len())
                .ok_or(Error::TableReadFailure)?;
        }
        Ok(layout)
    }

    pub fn row_count(&self, table: MetadataTable) -> u32 {
        self.rows[table as usize]
    }

    fn heap_index_size(&self, flag: HeapSizes) -> usize {
        if self.heap_sizes.contains(flag) {
            4
        } else {
            2
        }
    }

    fn column_size(&self, column: Column) -> usize {
        match column {
            Column::Fixed(size) => size,
            Column::String => self.heap_index_size(HeapSizes::STRINGS),
            Column::Guid => self.heap_index_size(HeapSizes::GUID),
            Column::Blob => self.heap_index_size(HeapSizes::BLOB),
            Column::Index(table) => {
                if self.row_count(table) < 1 << 16 {
                    2
                } else {
                    4
                }
            }
            Column::HasCustomDebugInformation => {
                let max = md::HAS_CUSTOM_DEBUG_INFORMATION
                    .iter()
                    .map(|&table| self.row_count(table))
                    .max()
                    .unwrap_or(0);
                if max < 1 << (16 - md::HAS_CUSTOM_DEBUG_INFORMATION_TAG_BITS) {
                    2
                } else {
                    4
                }
            }
        }
    }

    fn row_size(&self, table: MetadataTable) -> Result<usize, Error> {
        Ok(columns(table)?
            .iter()
            .map(|&column| self.column_size(column))
            .sum())
    }

    /// Read the columns of 1-based `row` of `table`, each widened to `u32`.
    pub fn read_row(
        &self,
        stream: &[u8],
        table: MetadataTable,
        row: u32,
    ) -> Result<Vec<u32>, Error> {
        if row == 0 || row > self.row_count(table) {
            return Err(Error::RowOutOfRange { table, row });
        }
        let columns = columns(table)?;
        let mut offset = self.offsets[table as usize] + (row as usize - 1) * self.row_size(table)?;
        columns
            .iter()
            .map(|&column| {
                let value = match self.column_size(column) {
                    2 => stream.gread_with::<u16>(&mut offset, LE).map(u32::from),
                    _ => stream.gread_with::<u32>(&mut offset, LE),
                };
                value.or(Err(Error::TableReadFailure))
            })
            .collect()
    }
}

/// Split a `HasCustomDebugInformation` coded index into its table and row.
pub fn decode_has_custom_debug_information(value: u32) -> Option<(MetadataTable, u32)> {
    let tag_bits = md::HAS_CUSTOM_DEBUG_INFORMATION_TAG_BITS;
    let tag = (value & ((1 << tag_bits) - 1)) as usize;
    let table = *md::HAS_CUSTOM_DEBUG_INFORMATION.get(tag)?;
    Some((table, value >> tag_bits))
}

#[cfg(test)]
mod test {
    use super::*;
    use test_assembler::*;

    fn metadata_root(streams: &[(u32, u32, &str)]) -> Vec<u8> {
        let version = b"PDB v1.0\0\0\0\0";
        let mut section = Section::with_endian(Endian::Little)
            .D32(md::METADATA_SIGNATURE)
            .D16(1)
            .D16(1)
            .D32(0)
            .D32(version.len() as u32)
            .append_bytes(version)
            .D16(0)
            .D16(streams.len() as u16);
        for &(offset, size, name) in streams {
            let mut name = name.as_bytes().to_vec();
            name.resize((name.len() + 4) & !3, 0);
            section = section.D32(offset).D32(size).append_bytes(&name);
        }
        section.append_repeated(0, 0x40).get_contents().unwrap()
    }

    #[test]
    fn test_read_streams() {
        let data = metadata_root(&[(0x40, 0x10, "#Pdb"), (0x50, 0x8, "#~"), (0x58, 0, "#US")]);
        let streams = read_streams(&data).unwrap();
        assert_eq!(streams.pdb, Some(0x40..0x50));
        assert_eq!(streams.tables, Some(0x50..0x58));
        assert_eq!(streams.blob, None);

        let data = metadata_root(&[(0x40, 0x1000, "#Blob")]);
        assert_eq!(read_streams(&data).unwrap_err(), Error::StreamOutOfBounds);

        let mut data = metadata_root(&[]);
        data[0] = b'X';
        assert_eq!(
            read_streams(&data).unwrap_err(),
            Error::MetadataSignatureMismatch
        );
        assert_eq!(read_streams(&[]).unwrap_err(), Error::MissingMetadataRoot);
    }

    #[test]
    fn test_compressed_unsigned() {
        // Examples from ECMA-335 II.23.2.
        let cases: &[(&[u8], u32)] = &[
            (&[0x03], 0x03),
            (&[0x7f], 0x7f),
            (&[0x80, 0x80], 0x80),
            (&[0xae, 0x57], 0x2e57),
            (&[0xbf, 0xff], 0x3fff),
            (&[0xc0, 0x00, 0x40, 0x00], 0x4000),
            (&[0xdf, 0xff, 0xff, 0xff], 0x1fff_ffff),
        ];
        for &(bytes, expected) in cases {
            let mut offset = 0;
            assert_eq!(read_compressed_u32(bytes, &mut offset).unwrap(), expected);
            assert_eq!(offset, bytes.len());
        }
        assert_eq!(
            read_compressed_u32(&[0xff], &mut 0),
            Err(Error::BadCompressedInteger)
        );
        assert_eq!(
            read_compressed_u32(&[0x80], &mut 0),
            Err(Error::BadCompressedInteger)
        );
    }

    #[test]
    fn test_compressed_signed() {
        let cases: &[(&[u8], i32)] = &[
            (&[0x06], 3),
            (&[0x7b], -3),
            (&[0x80, 0x80], 64),
            (&[0x01], -64),
            (&[0xc0, 0x00, 0x40, 0x00], 8192),
            (&[0x80, 0x01], -8192),
            (&[0xdf, 0xff, 0xff, 0xfe], 268_435_455),
            (&[0xc0, 0x00, 0x00, 0x01], -268_435_456),
        ];
        for &(bytes, expected) in cases {
            let mut offset = 0;
            assert_eq!(read_compressed_i32(bytes, &mut offset).unwrap(), expected);
            assert_eq!(offset, bytes.len());
        }
    }

    #[test]
    fn test_heaps() {
        let blobs = b"\0\x03abc\x01z";
        assert_eq!(read_blob(blobs, 0).unwrap(), b"");
        assert_eq!(read_blob(blobs, 1).unwrap(), b"abc");
        assert_eq!(read_blob(blobs, 5).unwrap(), b"z");
        assert_eq!(read_blob(blobs, 6), Err(Error::HeapIndexOutOfRange));

        let guids = md::SOURCE_LINK_KIND.to_bytes();
        assert_eq!(read_guid(&guids, 1).unwrap(), md::SOURCE_LINK_KIND);
        assert_eq!(read_guid(&guids, 0).unwrap(), GUID::default());
        assert!(read_guid(&guids, 2).is_err());
    }

    #[test]
    fn test_has_custom_debug_information() {
        assert_eq!(
            decode_has_custom_debug_information(39),
            Some((MetadataTable::Module, 1))
        );
        assert_eq!(
            decode_has_custom_debug_information((3 << 5) | 22),
            Some((MetadataTable::Document, 3))
        );
        assert_eq!(decode_has_custom_debug_information(31), None);
    }
}
