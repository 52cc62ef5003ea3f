//! PE image and portable PDB structure definitions.
//!
//! Types defined here should match those defined in [Microsoft's PE format documentation][pe] and
//! in [ECMA-335][ecma] (Partition II, metadata physical layout). The debug tables and the
//! `#Pdb` stream follow the [Portable PDB specification][ppdb].
//!
//! [pe]: https://learn.microsoft.com/en-us/windows/win32/debug/pe-format
//! [ecma]: https://www.ecma-international.org/publications-and-standards/standards/ecma-335/
//! [ppdb]: https://github.com/dotnet/runtime/blob/main/docs/design/specs/PortablePdb-Metadata.md
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use bitflags::bitflags;
use enum_primitive_derive::Primitive;
use scroll::{Endian, Pread, SizeWith};

/// A relative virtual address inside a loaded image.
pub type RVA = u32;

/// `MZ`, the first two bytes of every PE image.
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d;

/// Offset of `e_lfanew`, the file offset of the NT headers, inside the DOS header.
pub const IMAGE_DOS_LFANEW_OFFSET: usize = 0x3c;

/// `PE\0\0`
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;

/// Optional header magic of a 32-bit image.
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
/// Optional header magic of a 64-bit image.
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

/// Index of the debug directory in the optional header's data directories.
pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
/// Index of the CLI (COR20) header in the optional header's data directories.
pub const IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR: usize = 14;

/// The COFF file header that follows the `PE\0\0` signature.
///
/// This struct matches the [Microsoft struct][msdn] of the same name.
///
/// [msdn]: https://learn.microsoft.com/en-us/windows/win32/api/winnt/ns-winnt-image_file_header
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct IMAGE_FILE_HEADER {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    /// The optional header immediately follows this struct and is this many bytes long.
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Location and size of one of the optional header's data directories.
#[derive(Copy, Clone, Debug, Default, Pread, SizeWith)]
pub struct IMAGE_DATA_DIRECTORY {
    pub virtual_address: RVA,
    pub size: u32,
}

/// One entry of the section table.
///
/// This struct matches the [Microsoft struct][msdn] of the same name. It is what maps an
/// [`RVA`] to an offset in the file.
///
/// [msdn]: https://learn.microsoft.com/en-us/windows/win32/api/winnt/ns-winnt-image_section_header
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct IMAGE_SECTION_HEADER {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: RVA,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl IMAGE_SECTION_HEADER {
    /// Whether `rva` falls inside this section's virtual range.
    pub fn contains(&self, rva: RVA) -> bool {
        let size = self.virtual_size.max(self.size_of_raw_data);
        rva >= self.virtual_address && (rva - self.virtual_address) < size
    }
}

/// An entry of the debug directory.
///
/// This struct matches the [Microsoft struct][msdn] of the same name.
///
/// [msdn]: https://learn.microsoft.com/en-us/windows/win32/api/winnt/ns-winnt-image_debug_directory
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct IMAGE_DEBUG_DIRECTORY {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    /// [`PORTABLE_PDB_MINOR_VERSION`] for a CodeView entry describing a portable PDB.
    pub minor_version: u16,
    /// One of [`DebugDirectoryType`].
    pub ty: u32,
    pub size_of_data: u32,
    pub address_of_raw_data: RVA,
    pub pointer_to_raw_data: u32,
}

/// Known values of [`IMAGE_DEBUG_DIRECTORY::ty`].
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum DebugDirectoryType {
    Unknown = 0,
    Coff = 1,
    /// An `RSDS` record naming the PDB: [`CV_INFO_PDB70`].
    CodeView = 2,
    Fpo = 3,
    Misc = 4,
    Exception = 5,
    Fixup = 6,
    OmapToSrc = 7,
    OmapFromSrc = 8,
    Borland = 9,
    Clsid = 11,
    Repro = 16,
    /// A deflate-compressed portable PDB, see [`EMBEDDED_PORTABLE_PDB_HEADER`].
    EmbeddedPortablePdb = 17,
    PdbChecksum = 19,
}

/// `IMAGE_DEBUG_DIRECTORY::minor_version` of a CodeView entry that refers to a portable PDB.
///
/// Spells `PM` in little endian.
pub const PORTABLE_PDB_MINOR_VERSION: u16 = 0x504d;

/// A Windows GUID in its on-disk layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pread, SizeWith)]
pub struct GUID {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl GUID {
    /// The GUID's sixteen bytes in on-disk (mixed endian) order.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.data1.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.data2.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.data3.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.data4);
        bytes
    }
}

impl std::fmt::Display for GUID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08X}{:04X}{:04X}",
            self.data1, self.data2, self.data3
        )?;
        for byte in self.data4 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Known values for the `cv_signature` field of CodeView records.
#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum CvSignature {
    /// PDB 7.0 CodeView data: 'RSDS': [`CV_INFO_PDB70`]
    Pdb70 = 0x5344_5352,
}

/// CodeView debug information in the PDB 7.0 ("RSDS") format.
///
/// This struct is defined as variable-length in C with a trailing PDB filename member.
#[derive(Clone, Debug)]
pub struct CV_INFO_PDB70 {
    /// This will always be [`CvSignature::Pdb70`].
    pub cv_signature: u32,
    /// For a portable PDB the first 16 bytes of its PDB id.
    pub signature: GUID,
    pub age: u32,
    /// The PDB filename as a zero-terminated byte string
    pub pdb_file_name: Vec<u8>,
}

impl<'a> scroll::ctx::TryFromCtx<'a, Endian> for CV_INFO_PDB70 {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let cv_signature = src.gread_with(offset, endian)?;
        let signature = src.gread_with(offset, endian)?;
        let age = src.gread_with(offset, endian)?;
        let rest = &src[*offset..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let pdb_file_name = rest[..len].to_vec();
        *offset += len;
        Ok((
            CV_INFO_PDB70 {
                cv_signature,
                signature,
                age,
                pdb_file_name,
            },
            *offset,
        ))
    }
}

/// `MPDB` in little endian.
pub const EMBEDDED_PORTABLE_PDB_SIGNATURE: u32 = 0x4244_504d;

/// The header of an [`DebugDirectoryType::EmbeddedPortablePdb`] entry.
///
/// The header is followed by the raw-deflate compressed PDB.
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct EMBEDDED_PORTABLE_PDB_HEADER {
    /// This should be [`EMBEDDED_PORTABLE_PDB_SIGNATURE`].
    pub signature: u32,
    pub uncompressed_size: u32,
}

/// The CLI header, found through [`IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR`].
///
/// Only images carrying managed code have one.
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct IMAGE_COR20_HEADER {
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata: IMAGE_DATA_DIRECTORY,
    pub flags: u32,
    pub entry_point_token: u32,
    pub resources: IMAGE_DATA_DIRECTORY,
    pub strong_name_signature: IMAGE_DATA_DIRECTORY,
    pub code_manager_table: IMAGE_DATA_DIRECTORY,
    pub vtable_fixups: IMAGE_DATA_DIRECTORY,
    pub export_address_table_jumps: IMAGE_DATA_DIRECTORY,
    pub managed_native_header: IMAGE_DATA_DIRECTORY,
}

/// The magic at the start of a classic (MSF) PDB.
pub const MSF_SIGNATURE: &[u8] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// `BSJB`, the signature of an ECMA-335 metadata root.
pub const METADATA_SIGNATURE: u32 = 0x424a_5342;

/// The fixed part of the metadata root.
///
/// It is followed by a UTF-8 version string of `length` bytes (padded to a multiple of four), a
/// `u16` of flags, a `u16` stream count, and that many stream headers.
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct METADATA_ROOT {
    /// This should be [`METADATA_SIGNATURE`].
    pub signature: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub reserved: u32,
    pub length: u32,
}

/// A stream header of the metadata root.
///
/// Variable length: the name is zero-terminated and padded to a four byte boundary.
#[derive(Clone, Debug)]
pub struct STREAM_HEADER {
    /// Offset of the stream from the start of the metadata root.
    pub offset: u32,
    pub size: u32,
    pub name: String,
}

impl<'a> scroll::ctx::TryFromCtx<'a, Endian> for STREAM_HEADER {
    type Error = scroll::Error;

    fn try_from_ctx(src: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let stream_offset = src.gread_with(offset, endian)?;
        let size = src.gread_with(offset, endian)?;
        let rest = src.get(*offset..).unwrap_or_default();
        let len = rest
            .iter()
            .take(32)
            .position(|&b| b == 0)
            .ok_or(scroll::Error::BadInput {
                size: *offset,
                msg: "unterminated stream name",
            })?;
        let name = String::from_utf8_lossy(&rest[..len]).into_owned();
        // Name plus terminator, rounded up to a multiple of four.
        *offset += (len + 4) & !3;
        Ok((
            STREAM_HEADER {
                offset: stream_offset,
                size,
                name,
            },
            *offset,
        ))
    }
}

/// The header of the `#~` (compressed tables) stream.
///
/// Followed by one `u32` row count for every bit set in `valid`, then the tables themselves in
/// ascending table-id order.
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct TABLES_HEADER {
    pub reserved: u32,
    pub major_version: u8,
    pub minor_version: u8,
    /// See [`HeapSizes`].
    pub heap_sizes: u8,
    pub reserved2: u8,
    /// Bit mask of the tables present in this stream.
    pub valid: u64,
    pub sorted: u64,
}

bitflags! {
    /// Possible values of `TABLES_HEADER.heap_sizes`.
    ///
    /// A set flag means indices into that heap are four bytes wide instead of two.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct HeapSizes: u8 {
        const STRINGS = 0x01;
        const GUID = 0x02;
        const BLOB = 0x04;
    }
}

/// The fixed part of the `#Pdb` stream.
///
/// Followed by one `u32` row count for every bit set in `referenced_type_system_tables`.
#[derive(Clone, Debug, Pread, SizeWith)]
pub struct PDB_STREAM_HEADER {
    /// The first 16 bytes are the GUID a CodeView record names, the rest a timestamp.
    pub pdb_id: [u8; 20],
    pub entry_point: u32,
    pub referenced_type_system_tables: u64,
}

/// Metadata table identifiers.
///
/// The type-system tables live in the assembly itself; only their row counts are known to a
/// portable PDB (through [`PDB_STREAM_HEADER`]), which is enough to size coded indices.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Primitive)]
pub enum MetadataTable {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0a,
    Constant = 0x0b,
    CustomAttribute = 0x0c,
    FieldMarshal = 0x0d,
    DeclSecurity = 0x0e,
    ClassLayout = 0x0f,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1a,
    TypeSpec = 0x1b,
    ImplMap = 0x1c,
    FieldRva = 0x1d,
    EncLog = 0x1e,
    EncMap = 0x1f,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOs = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOs = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2a,
    MethodSpec = 0x2b,
    GenericParamConstraint = 0x2c,
    Document = 0x30,
    MethodDebugInformation = 0x31,
    LocalScope = 0x32,
    LocalVariable = 0x33,
    LocalConstant = 0x34,
    ImportScope = 0x35,
    StateMachineMethod = 0x36,
    CustomDebugInformation = 0x37,
}

/// Number of table ids a `valid` mask can describe.
pub const METADATA_TABLE_COUNT: usize = 64;

/// Tables a `HasCustomDebugInformation` coded index may refer to, in tag order.
pub const HAS_CUSTOM_DEBUG_INFORMATION: [MetadataTable; 27] = [
    MetadataTable::MethodDef,
    MetadataTable::Field,
    MetadataTable::TypeRef,
    MetadataTable::TypeDef,
    MetadataTable::Param,
    MetadataTable::InterfaceImpl,
    MetadataTable::MemberRef,
    MetadataTable::Module,
    MetadataTable::DeclSecurity,
    MetadataTable::Property,
    MetadataTable::Event,
    MetadataTable::StandAloneSig,
    MetadataTable::ModuleRef,
    MetadataTable::TypeSpec,
    MetadataTable::Assembly,
    MetadataTable::AssemblyRef,
    MetadataTable::File,
    MetadataTable::ExportedType,
    MetadataTable::ManifestResource,
    MetadataTable::GenericParam,
    MetadataTable::GenericParamConstraint,
    MetadataTable::MethodSpec,
    MetadataTable::Document,
    MetadataTable::LocalScope,
    MetadataTable::LocalVariable,
    MetadataTable::LocalConstant,
    MetadataTable::ImportScope,
];

/// Number of tag bits of a `HasCustomDebugInformation` coded index.
pub const HAS_CUSTOM_DEBUG_INFORMATION_TAG_BITS: u32 = 5;

/// The `Kind` GUID of the CustomDebugInformation row holding the source-link JSON.
pub const SOURCE_LINK_KIND: GUID = GUID {
    data1: 0xcc11_0556,
    data2: 0xa091,
    data3: 0x4d38,
    data4: [0x9f, 0xec, 0x25, 0xab, 0x9a, 0x35, 0x1a, 0x6a],
};

/// Line number of a hidden sequence point.
pub const HIDDEN_LINE: u32 = 0x00fe_efee;

/// Metadata token type of a MethodDef, in the token's high byte.
pub const METHOD_DEF_TOKEN_TYPE: u32 = (MetadataTable::MethodDef as u32) << 24;

#[cfg(test)]
mod test {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_stream_header_padding() {
        let bytes = [
            0x6c, 0, 0, 0, // offset
            0x10, 0, 0, 0, // size
            b'#', b'P', b'd', b'b', 0, 0, 0, 0, // name, padded
            0xff,
        ];
        let header: STREAM_HEADER = bytes.pread_with(0, scroll::LE).unwrap();
        assert_eq!(header.offset, 0x6c);
        assert_eq!(header.size, 0x10);
        assert_eq!(header.name, "#Pdb");

        let mut offset = 0;
        let _: STREAM_HEADER = bytes.gread_with(&mut offset, scroll::LE).unwrap();
        assert_eq!(offset, 16);
    }

    #[test]
    fn test_source_link_kind() {
        assert_eq!(
            SOURCE_LINK_KIND.to_string(),
            "CC110556A0914D389FEC25AB9A351A6A"
        );
        assert_eq!(
            SOURCE_LINK_KIND.to_bytes()[..4],
            [0x56, 0x05, 0x11, 0xcc]
        );
    }

    #[test]
    fn test_debug_directory_type() {
        assert_eq!(
            DebugDirectoryType::from_u32(17),
            Some(DebugDirectoryType::EmbeddedPortablePdb)
        );
        assert_eq!(DebugDirectoryType::from_u32(18), None);
        assert_eq!(
            MetadataTable::from_u8(0x37),
            Some(MetadataTable::CustomDebugInformation)
        );
    }
}
