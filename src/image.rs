//! Binary image regions for the decode engine.
//!
//! To resolve indirect branch targets the engine must be able to read the
//! instruction bytes of the traced binary, so each executable load segment is
//! registered with every decoder.

use crate::errors::CsTracerError;
use memmap2::Mmap;
use object::{elf, Object, ObjectSegment, SegmentFlags};
use std::{fs::File, path::PathBuf};

/// One loadable region of a binary, as registered with a decoder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageSection {
    pub path: PathBuf,
    /// Virtual address the region is loaded at.
    pub load_address: u64,
    /// Offset of the region within the file.
    pub file_offset: u64,
    /// Size of the region in the file, in bytes.
    pub size: u64,
}

/// Enumerate the executable load segments of an ELF binary.
pub fn code_sections(path: PathBuf) -> Result<Vec<ImageSection>, CsTracerError> {
    let img_err = |msg: String| CsTracerError::ImageRegistration {
        filename: path.display().to_string(),
        msg,
    };

    let file = File::open(&path).map_err(|e| img_err(e.to_string()))?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| img_err(e.to_string()))?;
    let obj = object::File::parse(&*mmap).map_err(|e| img_err(e.to_string()))?;

    let mut sections = Vec::new();
    for seg in obj.segments() {
        let executable = match seg.flags() {
            SegmentFlags::Elf { p_flags } => p_flags & elf::PF_X != 0,
            _ => false,
        };
        if !executable {
            continue;
        }
        let (file_offset, size) = seg.file_range();
        sections.push(ImageSection {
            path: path.clone(),
            load_address: seg.address(),
            file_offset,
            size,
        });
    }
    if sections.is_empty() {
        return Err(img_err("no executable load segments".to_owned()));
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::code_sections;
    use std::path::PathBuf;

    #[test]
    fn own_binary_has_code() {
        // The test binary itself is a convenient known-good ELF.
        let exe = std::env::current_exe().unwrap();
        let secs = code_sections(exe.clone()).unwrap();
        assert!(!secs.is_empty());
        for s in &secs {
            assert_eq!(s.path, exe);
            assert_ne!(s.size, 0);
        }
    }

    #[test]
    fn missing_file_names_the_path() {
        match code_sections(PathBuf::from("/no/such/binary")) {
            Err(crate::errors::CsTracerError::ImageRegistration { filename, .. }) => {
                assert_eq!(filename, "/no/such/binary");
            }
            _ => panic!(),
        }
    }
}
