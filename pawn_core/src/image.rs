//! Validated in-memory bytecode images.
//!
//! An [`Image`] is immutable once built. It is shared between every runtime
//! instantiated from it, so it lives behind an `Arc` in the VM.

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::debug::DebugInfo;
use crate::error::ErrorCode;
use crate::{Cell, CELL_SIZE};

bitflags! {
    /// Flags declared by the code section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CodeFlags: u16 {
        /// The image was compiled with debug information.
        const DEBUG = 0x1;
    }
}

/// A native function the image imports by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeInfo {
    /// Name the host binds against.
    pub name: String,
}

/// A public function entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicInfo {
    /// Exported name.
    pub name: String,
    /// Byte offset of the function's `PROC` in the code section.
    pub code_offset: u32,
}

/// A public variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubvarInfo {
    /// Exported name.
    pub name: String,
    /// Address in the data segment.
    pub address: u32,
}

/// An immutable bytecode image.
#[derive(Debug, Clone)]
pub struct Image {
    name: String,
    code: Vec<Cell>,
    data: Vec<u8>,
    heap_size: u32,
    flags: CodeFlags,
    natives: Vec<NativeInfo>,
    publics: Vec<PublicInfo>,
    pubvars: Vec<PubvarInfo>,
    debug: Option<DebugInfo>,
    public_index: FxHashMap<String, u32>,
    native_index: FxHashMap<String, u32>,
}

impl Image {
    /// Assemble an image from its parts.
    ///
    /// `code` must be a whole number of cells and every public must point at
    /// a cell boundary inside it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        code: Vec<Cell>,
        data: Vec<u8>,
        heap_size: u32,
        flags: CodeFlags,
        natives: Vec<NativeInfo>,
        publics: Vec<PublicInfo>,
        pubvars: Vec<PubvarInfo>,
        debug: Option<DebugInfo>,
    ) -> Result<Self, ErrorCode> {
        let code_size = code.len() as u64 * CELL_SIZE as u64;
        if code_size > u32::MAX as u64 {
            return Err(ErrorCode::FileFormat);
        }
        for public in &publics {
            if public.code_offset % CELL_SIZE != 0 || public.code_offset as u64 >= code_size {
                return Err(ErrorCode::FileFormat);
            }
        }
        for pubvar in &pubvars {
            if pubvar.address as usize >= data.len().max(1) {
                return Err(ErrorCode::FileFormat);
            }
        }

        let public_index = publics
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i as u32))
            .collect();
        let native_index = natives
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i as u32))
            .collect();

        Ok(Image {
            name: name.into(),
            code,
            data,
            heap_size,
            flags,
            natives,
            publics,
            pubvars,
            debug,
            public_index,
            native_index,
        })
    }

    /// Image name (usually the file name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytecode cells.
    #[inline]
    pub fn code(&self) -> &[Cell] {
        &self.code
    }

    /// Code size in bytes.
    #[inline]
    pub fn code_size(&self) -> u32 {
        self.code.len() as u32 * CELL_SIZE
    }

    /// Read the cell at byte offset `offset`.
    #[inline]
    pub fn code_cell(&self, offset: u32) -> Option<Cell> {
        if offset % CELL_SIZE != 0 {
            return None;
        }
        self.code.get((offset / CELL_SIZE) as usize).copied()
    }

    /// Whether `offset` is a valid code address.
    #[inline]
    pub fn is_valid_code_offset(&self, offset: u32) -> bool {
        offset % CELL_SIZE == 0 && offset < self.code_size()
    }

    /// Initial data segment bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Data segment size in bytes.
    pub fn data_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Declared total memory (data, heap and stack) in bytes.
    pub fn heap_size(&self) -> u32 {
        self.heap_size
    }

    /// Code section flags.
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// Imported natives, in index order.
    pub fn natives(&self) -> &[NativeInfo] {
        &self.natives
    }

    /// Exported functions, in index order.
    pub fn publics(&self) -> &[PublicInfo] {
        &self.publics
    }

    /// Exported variables, in index order.
    pub fn pubvars(&self) -> &[PubvarInfo] {
        &self.pubvars
    }

    /// Debug tables, if the image carries them.
    pub fn debug(&self) -> Option<&DebugInfo> {
        self.debug.as_ref()
    }

    /// Index of the public named `name`.
    pub fn find_public(&self, name: &str) -> Option<u32> {
        self.public_index.get(name).copied()
    }

    /// Index of the native named `name`.
    pub fn find_native(&self, name: &str) -> Option<u32> {
        self.native_index.get(name).copied()
    }

    /// Index of the pubvar named `name`.
    pub fn find_pubvar(&self, name: &str) -> Option<u32> {
        self.pubvars
            .iter()
            .position(|p| p.name == name)
            .map(|i| i as u32)
    }

    /// Best-effort name for the function containing `cip`.
    ///
    /// Uses debug symbols when present, otherwise the closest public whose
    /// entry is at or before `cip`.
    pub fn function_name_at(&self, cip: u32) -> Option<&str> {
        if let Some(sym) = self.debug.as_ref().and_then(|d| d.lookup_function(cip)) {
            return Some(sym.name.as_str());
        }
        self.publics
            .iter()
            .filter(|p| p.code_offset <= cip)
            .max_by_key(|p| p.code_offset)
            .map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_publics() -> Image {
        Image::new(
            "test",
            vec![0; 8],
            vec![0; 8],
            1024,
            CodeFlags::empty(),
            vec![NativeInfo {
                name: "print".into(),
            }],
            vec![
                PublicInfo {
                    name: "main".into(),
                    code_offset: 0,
                },
                PublicInfo {
                    name: "other".into(),
                    code_offset: 16,
                },
            ],
            vec![PubvarInfo {
                name: "g_count".into(),
                address: 4,
            }],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_lookups() {
        let image = image_with_publics();
        assert_eq!(image.find_public("other"), Some(1));
        assert_eq!(image.find_public("missing"), None);
        assert_eq!(image.find_native("print"), Some(0));
        assert_eq!(image.find_pubvar("g_count"), Some(0));
        assert_eq!(image.code_size(), 32);
    }

    #[test]
    fn test_function_name_falls_back_to_publics() {
        let image = image_with_publics();
        assert_eq!(image.function_name_at(4), Some("main"));
        assert_eq!(image.function_name_at(20), Some("other"));
    }

    #[test]
    fn test_code_cell_alignment() {
        let image = image_with_publics();
        assert_eq!(image.code_cell(4), Some(0));
        assert_eq!(image.code_cell(5), None);
        assert_eq!(image.code_cell(32), None);
        assert!(image.is_valid_code_offset(28));
        assert!(!image.is_valid_code_offset(32));
    }

    #[test]
    fn test_rejects_misaligned_public() {
        let err = Image::new(
            "bad",
            vec![0; 4],
            vec![],
            0,
            CodeFlags::empty(),
            vec![],
            vec![PublicInfo {
                name: "f".into(),
                code_offset: 2,
            }],
            vec![],
            None,
        )
        .unwrap_err();
        assert_eq!(err, ErrorCode::FileFormat);
    }
}
