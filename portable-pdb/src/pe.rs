use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;

use debugid::DebugId;
use flate2::read::DeflateDecoder;
use memmap2::Mmap;
use num_traits::FromPrimitive;
use scroll::ctx::SizeWith;
use scroll::{Pread, LE};
use tracing::{debug, trace};

use crate::format::{self as pe, DebugDirectoryType, GUID};
use crate::{Error, Probe};

/// Number of data directories a PE optional header can describe.
const MAX_DATA_DIRECTORIES: usize = 16;

/// How the bytes of an image are laid out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ImageLayout {
    /// The bytes of the file on disk; RVAs are mapped through the section table.
    #[default]
    File,
    /// The image as mapped by the loader, where an RVA is an offset.
    Loaded,
}

/// The CodeView record of an image, naming its companion PDB.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeViewInfo {
    /// The PDB path recorded at build time.
    pub pdb_file_name: String,
    pub guid: GUID,
    pub age: u32,
    /// Whether the record describes a portable (rather than classic MSF) PDB.
    pub portable: bool,
}

impl CodeViewInfo {
    /// The debug identifier a symbol server would file the PDB under.
    pub fn debug_id(&self) -> DebugId {
        DebugId::from_parts(uuid::Uuid::from_bytes_le(self.guid.to_bytes()), self.age)
    }
}

/// A managed PE image: enough of its headers to find debug information.
#[derive(Debug)]
pub struct PeImage<T>
where
    T: Deref<Target = [u8]>,
{
    data: T,
    layout: ImageLayout,
    sections: Vec<pe::IMAGE_SECTION_HEADER>,
    data_directories: Vec<pe::IMAGE_DATA_DIRECTORY>,
    pub file_header: pe::IMAGE_FILE_HEADER,
}

impl PeImage<Mmap> {
    /// Read a `PeImage` from a file on disk.
    pub fn read_path<P>(path: P) -> Result<PeImage<Mmap>, Error>
    where
        P: AsRef<Path>,
    {
        let f = File::open(path).or(Err(Error::FileNotFound))?;
        let mmap = unsafe { Mmap::map(&f).or(Err(Error::IoError))? };
        PeImage::read(mmap)
    }
}

impl<T> PeImage<T>
where
    T: Deref<Target = [u8]>,
{
    /// Read a `PeImage` from the bytes of a file on disk.
    pub fn read(data: T) -> Result<PeImage<T>, Error> {
        PeImage::read_with_layout(data, ImageLayout::File)
    }

    /// Read a `PeImage` from `data` laid out as `layout`.
    pub fn read_with_layout(data: T, layout: ImageLayout) -> Result<PeImage<T>, Error> {
        let dos_signature: u16 = data.pread_with(0, LE).or(Err(Error::MissingDosHeader))?;
        if dos_signature != pe::IMAGE_DOS_SIGNATURE {
            return Err(Error::MissingDosHeader);
        }
        let nt_offset: u32 = data
            .pread_with(pe::IMAGE_DOS_LFANEW_OFFSET, LE)
            .or(Err(Error::MissingDosHeader))?;

        let mut offset = nt_offset as usize;
        let nt_signature: u32 = data
            .gread_with(&mut offset, LE)
            .or(Err(Error::MissingPeHeader))?;
        if nt_signature != pe::IMAGE_NT_SIGNATURE {
            return Err(Error::MissingPeHeader);
        }
        let file_header: pe::IMAGE_FILE_HEADER = data
            .gread_with(&mut offset, LE)
            .or(Err(Error::MissingPeHeader))?;

        let optional_header = offset;
        let magic: u16 = data
            .pread_with(optional_header, LE)
            .or(Err(Error::MissingPeHeader))?;
        // Offsets of NumberOfRvaAndSizes and the first data directory.
        let (count_offset, directories_offset) = match magic {
            pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC => (92, 96),
            pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC => (108, 112),
            other => return Err(Error::UnknownOptionalHeader(other)),
        };
        let directory_count: u32 = data
            .pread_with(optional_header + count_offset, LE)
            .or(Err(Error::MissingPeHeader))?;
        let directory_count = (directory_count as usize).min(MAX_DATA_DIRECTORIES);
        let directory_size = pe::IMAGE_DATA_DIRECTORY::size_with(&LE);
        let directories_end = directories_offset + directory_count * directory_size;
        if directories_end > file_header.size_of_optional_header as usize {
            return Err(Error::MissingPeHeader);
        }

        let mut offset = optional_header + directories_offset;
        let data_directories = (0..directory_count)
            .map(|_| data.gread_with(&mut offset, LE))
            .collect::<Result<Vec<pe::IMAGE_DATA_DIRECTORY>, _>>()
            .or(Err(Error::MissingPeHeader))?;

        let mut offset = optional_header + file_header.size_of_optional_header as usize;
        let sections = (0..file_header.number_of_sections)
            .map(|_| data.gread_with(&mut offset, LE))
            .collect::<Result<Vec<pe::IMAGE_SECTION_HEADER>, _>>()
            .or(Err(Error::MissingPeHeader))?;

        trace!(
            "pe: {} sections, {} data directories",
            sections.len(),
            data_directories.len()
        );

        Ok(PeImage {
            data,
            layout,
            sections,
            data_directories,
            file_header,
        })
    }

    /// The data directory at `index`, if the image has a non-empty one.
    fn data_directory(&self, index: usize) -> Option<pe::IMAGE_DATA_DIRECTORY> {
        self.data_directories
            .get(index)
            .copied()
            .filter(|dir| dir.virtual_address != 0 && dir.size != 0)
    }

    /// Map `rva` to an offset into this image's bytes.
    pub fn rva_to_offset(&self, rva: pe::RVA) -> Result<usize, Error> {
        match self.layout {
            ImageLayout::Loaded => Ok(rva as usize),
            ImageLayout::File => self
                .sections
                .iter()
                .find(|section| section.contains(rva))
                .map(|section| {
                    (rva - section.virtual_address) as usize + section.pointer_to_raw_data as usize
                })
                .ok_or(Error::UnmappedRva(rva)),
        }
    }

    /// The `len` bytes at `rva`.
    fn slice_at_rva(&self, rva: pe::RVA, len: usize) -> Result<&[u8], Error> {
        let start = self.rva_to_offset(rva)?;
        self.data
            .get(start..start.saturating_add(len))
            .ok_or(Error::UnmappedRva(rva))
    }

    /// Whether this image has a CLI header, i.e. carries managed code and metadata.
    pub fn is_managed(&self) -> bool {
        self.cli_header().is_some()
    }

    /// The CLI header of a managed image.
    pub fn cli_header(&self) -> Option<pe::IMAGE_COR20_HEADER> {
        let dir = self.data_directory(pe::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR)?;
        let offset = self.rva_to_offset(dir.virtual_address).ok()?;
        self.data.pread_with(offset, LE).ok()
    }

    /// The entries of the debug directory. Empty if the image has none.
    pub fn debug_directory(&self) -> Result<Vec<pe::IMAGE_DEBUG_DIRECTORY>, Error> {
        let dir = match self.data_directory(pe::IMAGE_DIRECTORY_ENTRY_DEBUG) {
            Some(dir) => dir,
            None => return Ok(vec![]),
        };
        let entry_size = pe::IMAGE_DEBUG_DIRECTORY::size_with(&LE);
        let bytes = self
            .slice_at_rva(dir.virtual_address, dir.size as usize)
            .or(Err(Error::DebugDirectoryReadFailure))?;
        let mut offset = 0;
        (0..dir.size as usize / entry_size)
            .map(|_| bytes.gread_with(&mut offset, LE))
            .collect::<Result<Vec<_>, _>>()
            .or(Err(Error::DebugDirectoryReadFailure))
    }

    /// The data a debug directory entry points at.
    fn debug_entry_data(&self, entry: &pe::IMAGE_DEBUG_DIRECTORY) -> Result<&[u8], Error> {
        let len = entry.size_of_data as usize;
        let start = match self.layout {
            ImageLayout::File => entry.pointer_to_raw_data as usize,
            ImageLayout::Loaded => entry.address_of_raw_data as usize,
        };
        self.data
            .get(start..start.saturating_add(len))
            .ok_or(Error::DebugDirectoryReadFailure)
    }

    fn entries_of_type(
        &self,
        ty: DebugDirectoryType,
    ) -> Result<Vec<pe::IMAGE_DEBUG_DIRECTORY>, Error> {
        Ok(self
            .debug_directory()?
            .into_iter()
            .filter(|entry| DebugDirectoryType::from_u32(entry.ty) == Some(ty))
            .collect())
    }

    /// The image's CodeView record, preferring one that describes a portable PDB.
    pub fn codeview(&self) -> Probe<CodeViewInfo> {
        let entries = match self.entries_of_type(DebugDirectoryType::CodeView) {
            Ok(entries) => entries,
            Err(e) => return Probe::Malformed(e),
        };
        let entry = match entries
            .iter()
            .find(|entry| entry.minor_version == pe::PORTABLE_PDB_MINOR_VERSION)
            .or_else(|| entries.first())
        {
            Some(entry) => entry,
            None => return Probe::NotPresent,
        };

        Probe::from_result(self.read_codeview(entry))
    }

    fn read_codeview(&self, entry: &pe::IMAGE_DEBUG_DIRECTORY) -> Result<CodeViewInfo, Error> {
        let bytes = self.debug_entry_data(entry)?;
        let raw: pe::CV_INFO_PDB70 = bytes
            .pread_with(0, LE)
            .or(Err(Error::CodeViewReadFailure))?;
        if pe::CvSignature::from_u32(raw.cv_signature) != Some(pe::CvSignature::Pdb70) {
            return Err(Error::CodeViewReadFailure);
        }
        let pdb_file_name =
            String::from_utf8(raw.pdb_file_name).or(Err(Error::CodeViewReadFailure))?;
        Ok(CodeViewInfo {
            pdb_file_name,
            guid: raw.signature,
            age: raw.age,
            portable: entry.minor_version == pe::PORTABLE_PDB_MINOR_VERSION,
        })
    }

    /// Inflate the portable PDB embedded in this image.
    ///
    /// Reports [`Probe::NotPresent`] for unmanaged images and for images without an
    /// embedded-PDB debug directory entry.
    pub fn embedded_portable_pdb(&self) -> Probe<Vec<u8>> {
        if !self.is_managed() {
            debug!("pe: no CLI header, not a managed image");
            return Probe::NotPresent;
        }
        let entries = match self.entries_of_type(DebugDirectoryType::EmbeddedPortablePdb) {
            Ok(entries) => entries,
            Err(e) => return Probe::Malformed(e),
        };
        match entries.first() {
            Some(entry) => Probe::from_result(self.inflate_embedded(entry)),
            None => Probe::NotPresent,
        }
    }

    fn inflate_embedded(&self, entry: &pe::IMAGE_DEBUG_DIRECTORY) -> Result<Vec<u8>, Error> {
        let bytes = self.debug_entry_data(entry)?;
        let mut offset = 0;
        let header: pe::EMBEDDED_PORTABLE_PDB_HEADER = bytes
            .gread_with(&mut offset, LE)
            .or(Err(Error::EmbeddedPdbSignatureMismatch))?;
        if header.signature != pe::EMBEDDED_PORTABLE_PDB_SIGNATURE {
            return Err(Error::EmbeddedPdbSignatureMismatch);
        }

        // The declared size is untrusted; deflate rarely expands past a small multiple.
        let expected = header.uncompressed_size as usize;
        let mut pdb = Vec::with_capacity(expected.min(bytes.len().saturating_mul(4)));
        DeflateDecoder::new(&bytes[offset..])
            .take(expected as u64 + 1)
            .read_to_end(&mut pdb)
            .or(Err(Error::InflateFailure))?;
        if pdb.len() != expected {
            return Err(Error::EmbeddedPdbSizeMismatch {
                expected,
                actual: pdb.len(),
            });
        }
        debug!("pe: inflated embedded portable pdb ({} bytes)", expected);
        Ok(pdb)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use portable_pdb_synth::{SynthImage, SynthPdb};

    #[test]
    fn test_not_a_pe() {
        assert_eq!(
            PeImage::read(&b"not an image at all"[..]).unwrap_err(),
            Error::MissingDosHeader
        );
        assert_eq!(
            PeImage::read(&[0u8; 0][..]).unwrap_err(),
            Error::MissingDosHeader
        );
    }

    #[test]
    fn test_unmanaged_image() {
        let bytes = SynthImage::new().unmanaged().finish();
        let image = PeImage::read(bytes).unwrap();
        assert!(!image.is_managed());
        assert!(matches!(image.embedded_portable_pdb(), Probe::NotPresent));
        assert!(matches!(image.codeview(), Probe::NotPresent));
    }

    #[test]
    fn test_codeview() {
        let bytes = SynthImage::new()
            .codeview("/build/obj/Sample.pdb", SynthImage::DEFAULT_GUID, 1)
            .finish();
        let image = PeImage::read(bytes).unwrap();
        let cv = image.codeview().found().unwrap();
        assert_eq!(cv.pdb_file_name, "/build/obj/Sample.pdb");
        assert_eq!(cv.age, 1);
        assert!(cv.portable);
        assert_eq!(cv.guid, SynthImage::DEFAULT_GUID);
        assert_eq!(
            cv.debug_id().to_string(),
            "0f0e0d0c-0b0a-0908-0706-050403020100-1"
        );
    }

    #[test]
    fn test_embedded_pdb() {
        let pdb = SynthPdb::new().finish();
        let bytes = SynthImage::new().embed_pdb(&pdb).finish();
        let image = PeImage::read(bytes).unwrap();
        assert!(image.is_managed());
        assert_eq!(image.embedded_portable_pdb().found().unwrap(), pdb);
    }

    #[test]
    fn test_embedded_pdb_bad_size() {
        let pdb = SynthPdb::new().finish();
        let bytes = SynthImage::new()
            .embed_pdb_with_size(&pdb, pdb.len() as u32 + 10)
            .finish();
        let image = PeImage::read(bytes).unwrap();
        match image.embedded_portable_pdb() {
            Probe::Malformed(Error::EmbeddedPdbSizeMismatch { expected, actual }) => {
                assert_eq!(expected, pdb.len() + 10);
                assert_eq!(actual, pdb.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_embedded_pdb_huge_declared_size() {
        let pdb = SynthPdb::new().finish();
        let bytes = SynthImage::new()
            .embed_pdb_with_size(&pdb, u32::MAX)
            .finish();
        let image = PeImage::read(bytes).unwrap();
        match image.embedded_portable_pdb() {
            Probe::Malformed(Error::EmbeddedPdbSizeMismatch { expected, actual }) => {
                assert_eq!(expected, u32::MAX as usize);
                assert_eq!(actual, pdb.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pe32_plus() {
        let pdb = SynthPdb::new().finish();
        let bytes = SynthImage::new()
            .pe32_plus()
            .codeview("/build/obj/Sample.pdb", SynthImage::DEFAULT_GUID, 1)
            .embed_pdb(&pdb)
            .finish();
        let image = PeImage::read(bytes).unwrap();
        assert!(image.is_managed());
        let cv = image.codeview().found().unwrap();
        assert_eq!(cv.pdb_file_name, "/build/obj/Sample.pdb");
        assert_eq!(cv.guid, SynthImage::DEFAULT_GUID);
        assert_eq!(cv.age, 1);
        assert!(cv.portable);
        assert_eq!(image.embedded_portable_pdb().found().unwrap(), pdb);
    }

    #[test]
    fn test_unknown_debug_entries_skipped() {
        // 16 is a reproducible-build marker with no payload of interest.
        let bytes = SynthImage::new()
            .debug_entry(16, &[])
            .codeview("/build/obj/Sample.pdb", SynthImage::DEFAULT_GUID, 1)
            .debug_entry(0x7fff, &[1, 2, 3, 4])
            .finish();
        let image = PeImage::read(bytes).unwrap();
        assert_eq!(image.debug_directory().unwrap().len(), 3);
        let cv = image.codeview().found().unwrap();
        assert_eq!(cv.pdb_file_name, "/build/obj/Sample.pdb");
        assert!(matches!(image.embedded_portable_pdb(), Probe::NotPresent));
    }

    #[test]
    fn test_loaded_layout() {
        let bytes = SynthImage::new().loaded_layout().finish();
        let image = PeImage::read_with_layout(bytes, ImageLayout::Loaded).unwrap();
        assert!(image.is_managed());
        assert_eq!(image.rva_to_offset(0x2000).unwrap(), 0x2000);
    }

    #[test]
    fn test_rva_mapping() {
        let bytes = SynthImage::new().finish();
        let image = PeImage::read(bytes).unwrap();
        assert_eq!(
            image.rva_to_offset(SynthImage::TEXT_RVA + 4).unwrap(),
            SynthImage::TEXT_FILE_OFFSET as usize + 4
        );
        assert_eq!(image.rva_to_offset(0x10), Err(Error::UnmappedRva(0x10)));
    }
}
