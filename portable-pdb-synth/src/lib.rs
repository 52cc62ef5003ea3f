//! Synthetic PE Images and Portable PDBs for Testing
//!
//! Like any synthetic fixture builder this intentionally doesn't use sourcelink-common's struct
//! layouts (only its constants), so that incorrect changes to those layouts get caught.
//!
//! Basic usage is to create a [`SynthPdb`], add documents and methods to it, and `finish()`
//! it into bytes. Those bytes can be read directly, written next to a module as a companion
//! file, or embedded in a [`SynthImage`].

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::Compression;
use sourcelink_common::format as md;
use test_assembler::*;

const LE: Endian = Endian::Little;

/// Encode `value` as an ECMA-335 compressed unsigned integer.
pub fn compressed_u32(value: u32) -> Vec<u8> {
    match value {
        0..=0x7f => vec![value as u8],
        0x80..=0x3fff => vec![0x80 | (value >> 8) as u8, value as u8],
        _ => vec![
            0xc0 | (value >> 24) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ],
    }
}

/// Encode `value` as an ECMA-335 compressed signed integer.
pub fn compressed_i32(value: i32) -> Vec<u8> {
    let sign = u32::from(value < 0);
    if (-0x40..0x40).contains(&value) {
        vec![((((value as u32) & 0x3f) << 1) | sign) as u8]
    } else if (-0x2000..0x2000).contains(&value) {
        let raw = (((value as u32) & 0x1fff) << 1) | sign;
        vec![0x80 | (raw >> 8) as u8, raw as u8]
    } else {
        let raw = (((value as u32) & 0x0fff_ffff) << 1) | sign;
        vec![
            0xc0 | (raw >> 24) as u8,
            (raw >> 16) as u8,
            (raw >> 8) as u8,
            raw as u8,
        ]
    }
}

/// Pad `bytes` with zeros to a multiple of four.
fn pad4(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
}

/// The `#Blob` heap, deduplicating nothing.
struct BlobHeap {
    bytes: Vec<u8>,
}

impl BlobHeap {
    fn new() -> BlobHeap {
        BlobHeap { bytes: vec![0] }
    }

    fn add(&mut self, blob: &[u8]) -> u32 {
        if blob.is_empty() {
            return 0;
        }
        let index = self.bytes.len() as u32;
        self.bytes.extend(compressed_u32(blob.len() as u32));
        self.bytes.extend_from_slice(blob);
        index
    }
}

/// One entry in a method's sequence points blob.
#[derive(Clone, Debug)]
pub enum SynthSequencePoint {
    Point {
        il_offset: u32,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    },
    Hidden {
        il_offset: u32,
    },
    /// Switch the current document to this 1-based row.
    Document(u32),
}

impl SynthSequencePoint {
    pub fn new(
        il_offset: u32,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    ) -> SynthSequencePoint {
        SynthSequencePoint::Point {
            il_offset,
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    pub fn hidden(il_offset: u32) -> SynthSequencePoint {
        SynthSequencePoint::Hidden { il_offset }
    }

    pub fn document(row: u32) -> SynthSequencePoint {
        SynthSequencePoint::Document(row)
    }
}

/// A method's debug information.
#[derive(Clone, Debug, Default)]
pub struct SynthMethod {
    /// The MethodDebugInformation Document column; 0 when the blob names its own.
    document: u32,
    /// The document the blob starts in, when `document` is 0.
    initial_document: Option<u32>,
    points: Vec<SynthSequencePoint>,
}

impl SynthMethod {
    /// A method whose sequence points are all in `document`.
    pub fn new(document: u32) -> SynthMethod {
        SynthMethod {
            document,
            ..SynthMethod::default()
        }
    }

    /// A method without any debug information.
    pub fn empty() -> SynthMethod {
        SynthMethod::default()
    }

    /// A method whose sequence points may span documents, starting in `initial_document`.
    pub fn multi_document(initial_document: u32) -> SynthMethod {
        SynthMethod {
            initial_document: Some(initial_document),
            ..SynthMethod::default()
        }
    }

    pub fn points(mut self, points: Vec<SynthSequencePoint>) -> SynthMethod {
        self.points = points;
        self
    }

    fn sequence_points_blob(&self) -> Vec<u8> {
        if self.points.is_empty() {
            return vec![];
        }
        let mut blob = compressed_u32(0); // local signature
        if self.document == 0 {
            blob.extend(compressed_u32(self.initial_document.unwrap_or(1)));
        }
        let mut previous_il: Option<u32> = None;
        let mut previous_start: Option<(u32, u32)> = None;
        for point in &self.points {
            match *point {
                SynthSequencePoint::Document(row) => {
                    blob.extend(compressed_u32(0));
                    blob.extend(compressed_u32(row));
                }
                SynthSequencePoint::Hidden { il_offset } => {
                    blob.extend(compressed_u32(il_offset - previous_il.unwrap_or(0)));
                    previous_il = Some(il_offset);
                    blob.extend(compressed_u32(0));
                    blob.extend(compressed_u32(0));
                }
                SynthSequencePoint::Point {
                    il_offset,
                    start_line,
                    start_column,
                    end_line,
                    end_column,
                } => {
                    blob.extend(compressed_u32(il_offset - previous_il.unwrap_or(0)));
                    previous_il = Some(il_offset);
                    let delta_lines = end_line - start_line;
                    let delta_columns = end_column as i32 - start_column as i32;
                    blob.extend(compressed_u32(delta_lines));
                    if delta_lines == 0 {
                        blob.extend(compressed_u32(delta_columns as u32));
                    } else {
                        blob.extend(compressed_i32(delta_columns));
                    }
                    match previous_start {
                        None => {
                            blob.extend(compressed_u32(start_line));
                            blob.extend(compressed_u32(start_column));
                        }
                        Some((line, column)) => {
                            blob.extend(compressed_i32(start_line as i32 - line as i32));
                            blob.extend(compressed_i32(start_column as i32 - column as i32));
                        }
                    }
                    previous_start = Some((start_line, start_column));
                }
            }
        }
        blob
    }
}

/// A writer of synthetic portable PDBs.
pub struct SynthPdb {
    documents: Vec<String>,
    methods: Vec<SynthMethod>,
    /// (HasCustomDebugInformation coded parent, kind, value)
    custom_debug_information: Vec<(u32, md::GUID, Vec<u8>)>,
    pdb_id: [u8; 20],
    large_heaps: bool,
}

impl Default for SynthPdb {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthPdb {
    /// The coded `HasCustomDebugInformation` value of the module definition.
    pub const MODULE_PARENT: u32 = (1 << 5) | 7;

    pub fn new() -> SynthPdb {
        let mut pdb_id = [0u8; 20];
        pdb_id[..16].copy_from_slice(&SynthImage::DEFAULT_GUID.to_bytes());
        SynthPdb {
            documents: vec![],
            methods: vec![],
            custom_debug_information: vec![],
            pdb_id,
            large_heaps: false,
        }
    }

    /// Add a document, returning its 1-based row.
    pub fn add_document(&mut self, name: &str) -> u32 {
        self.documents.push(name.to_owned());
        self.documents.len() as u32
    }

    /// Add a method, returning its 1-based MethodDef row.
    pub fn add_method(&mut self, method: SynthMethod) -> u32 {
        self.methods.push(method);
        self.methods.len() as u32
    }

    /// Attach source-link `json` to the module.
    pub fn source_link(self, json: &str) -> SynthPdb {
        self.custom_debug_information(Self::MODULE_PARENT, md::SOURCE_LINK_KIND, json.as_bytes())
    }

    pub fn custom_debug_information(mut self, parent: u32, kind: md::GUID, value: &[u8]) -> SynthPdb {
        self.custom_debug_information
            .push((parent, kind, value.to_vec()));
        self
    }

    pub fn pdb_id(mut self, pdb_id: [u8; 20]) -> SynthPdb {
        self.pdb_id = pdb_id;
        self
    }

    /// Use four-byte indices into every heap.
    pub fn large_heaps(mut self) -> SynthPdb {
        self.large_heaps = true;
        self
    }

    fn document_name_blob(name: &str, blobs: &mut BlobHeap) -> Vec<u8> {
        let separator = if name.contains('/') {
            Some('/')
        } else if name.contains('\\') {
            Some('\\')
        } else {
            None
        };
        let mut blob = vec![separator.map(|c| c as u8).unwrap_or(0)];
        let parts: Vec<&str> = match separator {
            Some(separator) => name.split(separator).collect(),
            None => vec![name],
        };
        for part in parts {
            blob.extend(compressed_u32(blobs.add(part.as_bytes())));
        }
        blob
    }

    /// Finish generating the PDB and return its contents.
    pub fn finish(self) -> Vec<u8> {
        let strings = vec![0u8];
        let mut guids: Vec<u8> = vec![];
        let mut blobs = BlobHeap::new();

        let mut documents = vec![];
        for name in &self.documents {
            let blob = Self::document_name_blob(name, &mut blobs);
            documents.push(blobs.add(&blob));
        }
        let methods: Vec<(u32, u32)> = self
            .methods
            .iter()
            .map(|method| (method.document, blobs.add(&method.sequence_points_blob())))
            .collect();

        let mut cdi = vec![];
        for (parent, kind, value) in &self.custom_debug_information {
            guids.extend_from_slice(&kind.to_bytes());
            let guid_index = (guids.len() / 16) as u32;
            cdi.push((*parent, guid_index, blobs.add(value)));
        }

        let heap_index = |section: Section, index: u32| {
            if self.large_heaps {
                section.D32(index)
            } else {
                section.D16(index as u16)
            }
        };

        // The #~ stream.
        let row_counts = [
            (md::MetadataTable::Document, documents.len()),
            (md::MetadataTable::MethodDebugInformation, methods.len()),
            (md::MetadataTable::CustomDebugInformation, cdi.len()),
        ];
        let valid = row_counts
            .iter()
            .filter(|(_, rows)| *rows > 0)
            .fold(0u64, |mask, (table, _)| mask | (1 << *table as u8));
        let heap_sizes = if self.large_heaps {
            (md::HeapSizes::STRINGS | md::HeapSizes::GUID | md::HeapSizes::BLOB).bits()
        } else {
            0
        };
        let mut tables = Section::with_endian(LE)
            .D32(0)
            .D8(2)
            .D8(0)
            .D8(heap_sizes)
            .D8(1)
            .D64(valid)
            .D64(0);
        for (_, rows) in row_counts.iter().filter(|(_, rows)| *rows > 0) {
            tables = tables.D32(*rows as u32);
        }
        for name in &documents {
            tables = heap_index(tables, *name);
            tables = heap_index(tables, 0);
            tables = heap_index(tables, 0);
            tables = heap_index(tables, 0);
        }
        for (document, sequence_points) in &methods {
            tables = tables.D16(*document as u16);
            tables = heap_index(tables, *sequence_points);
        }
        for (parent, kind, value) in &cdi {
            tables = tables.D16(*parent as u16);
            tables = heap_index(tables, *kind);
            tables = heap_index(tables, *value);
        }

        // The #Pdb stream: id, entry point, then row counts of Module and MethodDef.
        let referenced =
            (1u64 << md::MetadataTable::Module as u8) | (1u64 << md::MetadataTable::MethodDef as u8);
        let pdb = Section::with_endian(LE)
            .append_bytes(&self.pdb_id)
            .D32(0)
            .D64(referenced)
            .D32(1)
            .D32(self.methods.len() as u32);

        let streams: Vec<(&str, Vec<u8>)> = vec![
            ("#Pdb", pdb.get_contents().unwrap_or_default()),
            ("#~", tables.get_contents().unwrap_or_default()),
            ("#Strings", strings),
            ("#US", vec![0]),
            ("#GUID", guids),
            ("#Blob", blobs.bytes),
        ];

        let version = b"PDB v1.0\0\0\0\0";
        let mut root = Section::with_endian(LE)
            .D32(md::METADATA_SIGNATURE)
            .D16(1)
            .D16(1)
            .D32(0)
            .D32(version.len() as u32)
            .append_bytes(version)
            .D16(0)
            .D16(streams.len() as u16);
        root.start().set_const(0);

        let streams: Vec<(Label, Vec<u8>)> = streams
            .into_iter()
            .map(|(name, bytes)| {
                let offset = Label::new();
                let mut name = name.as_bytes().to_vec();
                name.push(0);
                root = std::mem::replace(&mut root, Section::new())
                    .D32(&offset)
                    .D32(bytes.len() as u32)
                    .append_bytes(&pad4(name));
                (offset, pad4(bytes))
            })
            .collect();
        for (offset, bytes) in streams {
            root = root.mark(&offset).append_bytes(&bytes);
        }
        root.get_contents().unwrap_or_default()
    }
}

/// A classic MSF PDB: just the signature and some padding.
pub fn synth_msf_pdb() -> Vec<u8> {
    let mut bytes = md::MSF_SIGNATURE.to_vec();
    bytes.resize(0x400, 0);
    bytes
}

/// A writer of synthetic PE images carrying debug directory entries.
pub struct SynthImage {
    managed: bool,
    pe32_plus: bool,
    text_file_offset: u32,
    /// (type, minor version, data)
    debug_entries: Vec<(u32, u16, Vec<u8>)>,
}

impl Default for SynthImage {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthImage {
    /// Virtual address of the only section.
    pub const TEXT_RVA: u32 = 0x2000;
    /// File offset of the only section, in file layout.
    pub const TEXT_FILE_OFFSET: u32 = 0x200;
    /// GUID used by default for CodeView records and PDB ids.
    pub const DEFAULT_GUID: md::GUID = md::GUID {
        data1: 0x0f0e_0d0c,
        data2: 0x0b0a,
        data3: 0x0908,
        data4: [7, 6, 5, 4, 3, 2, 1, 0],
    };

    const CLI_HEADER_SIZE: u32 = 72;
    const DEBUG_ENTRY_SIZE: u32 = 28;

    pub fn new() -> SynthImage {
        SynthImage {
            managed: true,
            pe32_plus: false,
            text_file_offset: Self::TEXT_FILE_OFFSET,
            debug_entries: vec![],
        }
    }

    /// Leave out the CLI header.
    pub fn unmanaged(mut self) -> SynthImage {
        self.managed = false;
        self
    }

    /// Write a 64-bit optional header.
    pub fn pe32_plus(mut self) -> SynthImage {
        self.pe32_plus = true;
        self
    }

    /// Lay the image out as the loader maps it, so that every RVA is a file offset.
    pub fn loaded_layout(mut self) -> SynthImage {
        self.text_file_offset = Self::TEXT_RVA;
        self
    }

    fn codeview_record(path: &str, guid: md::GUID, age: u32) -> Vec<u8> {
        let mut data = b"RSDS".to_vec();
        data.extend_from_slice(&guid.to_bytes());
        data.extend_from_slice(&age.to_le_bytes());
        data.extend_from_slice(path.as_bytes());
        data.push(0);
        data
    }

    /// Add a CodeView entry describing a portable PDB.
    pub fn codeview(mut self, path: &str, guid: md::GUID, age: u32) -> SynthImage {
        self.debug_entries.push((
            md::DebugDirectoryType::CodeView as u32,
            md::PORTABLE_PDB_MINOR_VERSION,
            Self::codeview_record(path, guid, age),
        ));
        self
    }

    /// Add a CodeView entry describing a classic PDB.
    pub fn codeview_classic(mut self, path: &str, guid: md::GUID, age: u32) -> SynthImage {
        self.debug_entries.push((
            md::DebugDirectoryType::CodeView as u32,
            0,
            Self::codeview_record(path, guid, age),
        ));
        self
    }

    /// Embed `pdb`, deflate-compressed.
    pub fn embed_pdb(self, pdb: &[u8]) -> SynthImage {
        self.embed_pdb_with_size(pdb, pdb.len() as u32)
    }

    /// Embed `pdb`, claiming its uncompressed size is `size`.
    pub fn embed_pdb_with_size(mut self, pdb: &[u8], size: u32) -> SynthImage {
        let mut encoder = DeflateEncoder::new(vec![], Compression::default());
        let _ = encoder.write_all(pdb);
        let compressed = encoder.finish().unwrap_or_default();
        let mut data = md::EMBEDDED_PORTABLE_PDB_SIGNATURE.to_le_bytes().to_vec();
        data.extend_from_slice(&size.to_le_bytes());
        data.extend(compressed);
        self.debug_entries.push((
            md::DebugDirectoryType::EmbeddedPortablePdb as u32,
            0x0100,
            data,
        ));
        self
    }

    /// Add a debug directory entry of any type.
    pub fn debug_entry(mut self, ty: u32, data: &[u8]) -> SynthImage {
        self.debug_entries.push((ty, 0, data.to_vec()));
        self
    }

    /// Finish generating the image and return its contents.
    pub fn finish(self) -> Vec<u8> {
        // Contents of the section: CLI header, debug directory, then entry data.
        let cli_size = if self.managed { Self::CLI_HEADER_SIZE } else { 0 };
        let directory_offset = cli_size;
        let directory_size = Self::DEBUG_ENTRY_SIZE * self.debug_entries.len() as u32;
        let mut data_offset = directory_offset + directory_size;

        let mut text = Section::with_endian(LE);
        if self.managed {
            text = text
                .D32(Self::CLI_HEADER_SIZE)
                .D16(2)
                .D16(5)
                .append_repeated(0, (Self::CLI_HEADER_SIZE - 8) as usize);
        }
        let mut entry_data = Section::with_endian(LE);
        for (ty, minor, data) in &self.debug_entries {
            text = text
                .D32(0)
                .D32(0x6502_4c57) // timestamp, arbitrary
                .D16(0x0100)
                .D16(*minor)
                .D32(*ty)
                .D32(data.len() as u32)
                .D32(Self::TEXT_RVA + data_offset)
                .D32(self.text_file_offset + data_offset);
            let padded = pad4(data.clone());
            data_offset += padded.len() as u32;
            entry_data = entry_data.append_bytes(&padded);
        }
        let text = text
            .append_section(entry_data)
            .get_contents()
            .unwrap_or_default();

        let (magic, optional_header_size, count_offset) = if self.pe32_plus {
            (md::IMAGE_NT_OPTIONAL_HDR64_MAGIC, 240u16, 108)
        } else {
            (md::IMAGE_NT_OPTIONAL_HDR32_MAGIC, 224u16, 92)
        };
        let nt_offset = 0x80u32;

        let mut directories = vec![(0u32, 0u32); 16];
        if self.managed {
            directories[md::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR] =
                (Self::TEXT_RVA, Self::CLI_HEADER_SIZE);
        }
        if !self.debug_entries.is_empty() {
            directories[md::IMAGE_DIRECTORY_ENTRY_DEBUG] =
                (Self::TEXT_RVA + directory_offset, directory_size);
        }

        let mut image = Section::with_endian(LE)
            .D16(md::IMAGE_DOS_SIGNATURE)
            .append_repeated(0, md::IMAGE_DOS_LFANEW_OFFSET - 2)
            .D32(nt_offset)
            .append_repeated(0, nt_offset as usize - md::IMAGE_DOS_LFANEW_OFFSET - 4)
            .D32(md::IMAGE_NT_SIGNATURE)
            // IMAGE_FILE_HEADER
            .D16(if self.pe32_plus { 0x8664 } else { 0x14c })
            .D16(1)
            .D32(0x6502_4c57)
            .D32(0)
            .D32(0)
            .D16(optional_header_size)
            .D16(0x2022)
            // Optional header, mostly zeros.
            .D16(magic)
            .append_repeated(0, count_offset - 2)
            .D32(16);
        for (rva, size) in directories {
            image = image.D32(rva).D32(size);
        }
        let text_size = pad4(text.clone()).len() as u32;
        image = image
            .append_bytes(b".text\0\0\0")
            .D32(text_size)
            .D32(Self::TEXT_RVA)
            .D32(text_size)
            .D32(self.text_file_offset)
            .D32(0)
            .D32(0)
            .D16(0)
            .D16(0)
            .D32(0x6000_0020);
        let header_size = image.size() as usize;
        image = image
            .append_repeated(0, self.text_file_offset as usize - header_size)
            .append_bytes(&pad4(text));
        image.get_contents().unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compressed_encoding() {
        assert_eq!(compressed_u32(0x03), vec![0x03]);
        assert_eq!(compressed_u32(0x2e57), vec![0xae, 0x57]);
        assert_eq!(compressed_u32(0x4000), vec![0xc0, 0x00, 0x40, 0x00]);
        assert_eq!(compressed_i32(-3), vec![0x7b]);
        assert_eq!(compressed_i32(64), vec![0x80, 0x80]);
        assert_eq!(compressed_i32(-8192), vec![0x80, 0x01]);
        assert_eq!(compressed_i32(-268_435_456), vec![0xc0, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_image_layout() {
        let image = SynthImage::new().finish();
        assert_eq!(&image[..2], b"MZ");
        assert_eq!(&image[0x80..0x84], b"PE\0\0");
        assert_eq!(image.len() % 4, 0);
        assert!(image.len() >= SynthImage::TEXT_FILE_OFFSET as usize + 72);
    }

    #[test]
    fn test_pdb_starts_with_root() {
        let pdb = SynthPdb::new().finish();
        assert_eq!(&pdb[..4], b"BSJB");
    }
}
