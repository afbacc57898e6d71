//! SMX container reader and writer.
//!
//! Layout of a container, all integers little-endian and byte-packed:
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ header (24 bytes)            │ magic, version, compression, sizes
//! ├──────────────────────────────┤
//! │ section table (12 bytes each)│ name offset, data offset, size
//! ├──────────────────────────────┤ stringtab
//! │ section names                │
//! ├──────────────────────────────┤ dataoffs (compression starts here)
//! │ section contents             │ .code .data .publics .natives ...
//! └──────────────────────────────┘
//! ```

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::debug;

use crate::debug::{DebugInfo, FunctionSymbol};
use crate::error::{ErrorCode, PawnError, PawnResult};
use crate::image::{CodeFlags, Image, NativeInfo, PublicInfo, PubvarInfo};
use crate::Cell;

/// `FFPS` read as a little-endian u32.
pub const FILE_MAGIC: u32 = 0x5350_4646;
/// Oldest container version accepted.
pub const VERSION_MIN: u16 = 0x0102;
/// Newest container version accepted.
pub const VERSION_MAX: u16 = 0x0103;
/// Oldest bytecode revision accepted.
pub const CODE_VERSION_MIN: u8 = 9;
/// Newest bytecode revision accepted.
pub const CODE_VERSION_MAX: u8 = 12;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_ZLIB: u8 = 1;

const HEADER_SIZE: usize = 24;
const SECTION_ENTRY_SIZE: usize = 12;
const CODE_HEADER_SIZE: usize = 16;
const DATA_HEADER_SIZE: usize = 12;
const SYMBOL_SIZE: usize = 22;
const ARRAY_DIM_SIZE: usize = 6;
const IDENT_FUNCTION: u8 = 9;

/// Load an image from a file on disk.
pub fn load_file(path: impl AsRef<Path>) -> PawnResult<Image> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    load_image(&name, &bytes)
}

/// Parse and validate an in-memory container.
pub fn load_image(name: &str, bytes: &[u8]) -> PawnResult<Image> {
    let header = Header::parse(bytes)?;
    let buffer = header.expand(bytes)?;
    let reader = SmxReader::new(&header, &buffer)?;
    let image = reader.into_image(name)?;
    debug!(
        name,
        code_size = image.code_size(),
        data_size = image.data_size(),
        natives = image.natives().len(),
        publics = image.publics().len(),
        "loaded image"
    );
    Ok(image)
}

fn format_error(reason: impl Into<String>) -> PawnError {
    PawnError::load(ErrorCode::FileFormat, reason)
}

#[inline]
fn read_u8(bytes: &[u8], at: usize) -> Option<u8> {
    bytes.get(at).copied()
}

#[inline]
fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let raw = bytes.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]))
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_cstr(table: &[u8], offset: usize) -> Option<String> {
    let tail = table.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

struct Header {
    version: u16,
    compression: u8,
    disk_size: u32,
    image_size: u32,
    sections: u8,
    string_table: u32,
    data_offset: u32,
}

impl Header {
    fn parse(bytes: &[u8]) -> PawnResult<Header> {
        if bytes.len() < HEADER_SIZE {
            return Err(format_error("bad header"));
        }
        let field = |at| read_u32(bytes, at).ok_or_else(|| format_error("bad header"));
        if field(0)? != FILE_MAGIC {
            return Err(format_error("bad magic"));
        }
        let version = read_u16(bytes, 4).ok_or_else(|| format_error("bad header"))?;
        if version < VERSION_MIN {
            return Err(PawnError::load(
                ErrorCode::VersionTooLow,
                format!("container version {version:#06x} is too old"),
            ));
        }
        if version > VERSION_MAX {
            return Err(PawnError::load(
                ErrorCode::VersionTooHigh,
                format!("container version {version:#06x} is too new"),
            ));
        }
        Ok(Header {
            version,
            compression: read_u8(bytes, 6).ok_or_else(|| format_error("bad header"))?,
            disk_size: field(7)?,
            image_size: field(11)?,
            sections: read_u8(bytes, 15).ok_or_else(|| format_error("bad header"))?,
            string_table: field(16)?,
            data_offset: field(20)?,
        })
    }

    /// Produce the fully decompressed container.
    fn expand(&self, bytes: &[u8]) -> PawnResult<Vec<u8>> {
        match self.compression {
            COMPRESSION_NONE => Ok(bytes.to_vec()),
            COMPRESSION_ZLIB => {
                let start = self.data_offset as usize;
                if start < HEADER_SIZE || start > bytes.len() {
                    return Err(format_error("illegal compressed region"));
                }
                if self.image_size < self.data_offset {
                    return Err(format_error("illegal image size"));
                }
                let end = (self.disk_size as usize).min(bytes.len());
                if end < start {
                    return Err(format_error("illegal compressed region"));
                }
                let mut out = Vec::with_capacity(self.image_size as usize);
                out.extend_from_slice(&bytes[..start]);
                ZlibDecoder::new(&bytes[start..end])
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        PawnError::load(
                            ErrorCode::Decompressor,
                            format!("could not decode compressed region: {e}"),
                        )
                    })?;
                if out.len() != self.image_size as usize {
                    return Err(PawnError::load(
                        ErrorCode::Decompressor,
                        "decompressed size does not match the header",
                    ));
                }
                Ok(out)
            }
            other => Err(format_error(format!("unknown compression type {other}"))),
        }
    }
}

struct Section<'a> {
    name: String,
    bytes: &'a [u8],
}

struct SmxReader<'a> {
    version: u16,
    sections: Vec<Section<'a>>,
}

impl<'a> SmxReader<'a> {
    fn new(header: &Header, buffer: &'a [u8]) -> PawnResult<Self> {
        let string_table = header.string_table as usize;
        if string_table >= buffer.len() {
            return Err(format_error("invalid string table"));
        }
        let table_end = HEADER_SIZE + header.sections as usize * SECTION_ENTRY_SIZE;
        if table_end > buffer.len() {
            return Err(format_error("invalid section table"));
        }
        let names = &buffer[string_table..];

        let mut sections = Vec::with_capacity(header.sections as usize);
        for i in 0..header.sections as usize {
            let at = HEADER_SIZE + i * SECTION_ENTRY_SIZE;
            let bad = || format_error("invalid section table");
            let name_offs = read_u32(buffer, at).ok_or_else(bad)? as usize;
            let data_offs = read_u32(buffer, at + 4).ok_or_else(bad)? as usize;
            let size = read_u32(buffer, at + 8).ok_or_else(bad)? as usize;

            let name = read_cstr(names, name_offs)
                .ok_or_else(|| format_error("malformed section names header"))?;
            if data_offs > buffer.len() || size > buffer.len() - data_offs {
                return Err(format_error(format!("section {name} is out of bounds")));
            }
            sections.push(Section {
                name,
                bytes: &buffer[data_offs..data_offs + size],
            });
        }

        Ok(SmxReader {
            version: header.version,
            sections,
        })
    }

    fn find(&self, name: &str) -> Option<&'a [u8]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.bytes)
    }

    fn require(&self, name: &str) -> PawnResult<&'a [u8]> {
        self.find(name)
            .ok_or_else(|| format_error(format!("could not find {name} section")))
    }

    fn into_image(self, name: &str) -> PawnResult<Image> {
        let names = self.require(".names")?;
        if names.last().is_some_and(|&b| b != 0) {
            return Err(format_error("malformed names section"));
        }
        let name_at = |offset: u32, what: &str| {
            read_cstr(names, offset as usize)
                .ok_or_else(|| format_error(format!("invalid {what} name")))
        };

        let (code, flags) = self.read_code()?;
        let (data, mem_size) = self.read_data()?;

        let mut publics = Vec::new();
        if let Some(section) = self.find(".publics") {
            for entry in Self::records(section, 8, ".publics")? {
                publics.push(PublicInfo {
                    code_offset: read_u32(entry, 0).unwrap_or(0),
                    name: name_at(read_u32(entry, 4).unwrap_or(u32::MAX), "public")?,
                });
            }
        }

        let mut pubvars = Vec::new();
        if let Some(section) = self.find(".pubvars") {
            for entry in Self::records(section, 8, ".pubvars")? {
                pubvars.push(PubvarInfo {
                    address: read_u32(entry, 0).unwrap_or(0),
                    name: name_at(read_u32(entry, 4).unwrap_or(u32::MAX), "pubvar")?,
                });
            }
        }

        let mut natives = Vec::new();
        if let Some(section) = self.find(".natives") {
            for entry in Self::records(section, 4, ".natives")? {
                natives.push(NativeInfo {
                    name: name_at(read_u32(entry, 0).unwrap_or(u32::MAX), "native")?,
                });
            }
        }

        let debug = if flags.contains(CodeFlags::DEBUG) {
            Some(self.read_debug()?)
        } else {
            None
        };

        Image::new(
            name, code, data, mem_size, flags, natives, publics, pubvars, debug,
        )
        .map_err(|code| PawnError::load(code, "inconsistent symbol tables"))
    }

    fn records(section: &'a [u8], size: usize, what: &str) -> PawnResult<std::slice::Chunks<'a, u8>> {
        if section.len() % size != 0 {
            return Err(format_error(format!("invalid {what} section")));
        }
        Ok(section.chunks(size))
    }

    fn read_code(&self) -> PawnResult<(Vec<Cell>, CodeFlags)> {
        let section = self.require(".code")?;
        if section.len() < CODE_HEADER_SIZE {
            return Err(format_error("invalid code section"));
        }
        let bad = || format_error("invalid code section");
        let code_size = read_u32(section, 0).ok_or_else(bad)? as usize;
        let cell_size = read_u8(section, 4).ok_or_else(bad)?;
        let code_version = read_u8(section, 5).ok_or_else(bad)?;
        let raw_flags = read_u16(section, 6).ok_or_else(bad)?;
        let code_offs = read_u32(section, 12).ok_or_else(bad)? as usize;

        if code_version < CODE_VERSION_MIN {
            return Err(PawnError::load(
                ErrorCode::VersionTooLow,
                "code version is too old, no longer supported",
            ));
        }
        if code_version > CODE_VERSION_MAX {
            return Err(PawnError::load(
                ErrorCode::VersionTooHigh,
                "code version is too new, not supported",
            ));
        }
        if cell_size != 4 {
            return Err(format_error("unsupported cellsize"));
        }
        let flags = CodeFlags::from_bits(raw_flags)
            .ok_or_else(|| format_error("unsupported code settings"))?;
        if code_offs > section.len() || code_size > section.len() - code_offs {
            return Err(format_error("invalid code blob"));
        }
        if code_size % 4 != 0 {
            return Err(format_error("code size is not a whole number of cells"));
        }

        let code = section[code_offs..code_offs + code_size]
            .chunks_exact(4)
            .map(|c| Cell::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok((code, flags))
    }

    fn read_data(&self) -> PawnResult<(Vec<u8>, u32)> {
        let section = self.require(".data")?;
        if section.len() < DATA_HEADER_SIZE {
            return Err(format_error("invalid data section"));
        }
        let bad = || format_error("invalid data blob");
        let data_size = read_u32(section, 0).ok_or_else(bad)? as usize;
        let mem_size = read_u32(section, 4).ok_or_else(bad)?;
        let data_offs = read_u32(section, 8).ok_or_else(bad)? as usize;
        if data_offs > section.len() || data_size > section.len() - data_offs {
            return Err(bad());
        }
        Ok((section[data_offs..data_offs + data_size].to_vec(), mem_size))
    }

    fn read_debug(&self) -> PawnResult<DebugInfo> {
        let missing = |what: &str| format_error(format!("debug flag set but {what} is missing"));
        let info = self.find(".dbg.info").ok_or_else(|| missing(".dbg.info"))?;
        let strings = self
            .find(".dbg.strings")
            .ok_or_else(|| missing(".dbg.strings"))?;
        let files = self.find(".dbg.files").ok_or_else(|| missing(".dbg.files"))?;
        let lines = self.find(".dbg.lines").ok_or_else(|| missing(".dbg.lines"))?;
        let symbols = self
            .find(".dbg.symbols")
            .ok_or_else(|| missing(".dbg.symbols"))?;

        let bad_info = || format_error("invalid .dbg.info section");
        let num_files = read_u32(info, 0).ok_or_else(bad_info)? as usize;
        let num_lines = read_u32(info, 4).ok_or_else(bad_info)? as usize;
        let num_syms = read_u32(info, 8).ok_or_else(bad_info)? as usize;

        if strings.last().is_some_and(|&b| b != 0) {
            return Err(format_error("invalid .dbg.strings section"));
        }
        let string_at = |offset: u32| {
            read_cstr(strings, offset as usize)
                .ok_or_else(|| format_error("invalid debug string reference"))
        };

        if files.len() / 8 < num_files {
            return Err(format_error("invalid debug file table"));
        }
        let mut file_table = Vec::with_capacity(num_files);
        for entry in files.chunks_exact(8).take(num_files) {
            let addr = read_u32(entry, 0).unwrap_or(0);
            file_table.push((addr, string_at(read_u32(entry, 4).unwrap_or(u32::MAX))?));
        }

        if lines.len() / 8 < num_lines {
            return Err(format_error("invalid debug lines table"));
        }
        let line_table = lines
            .chunks_exact(8)
            .take(num_lines)
            .map(|e| (read_u32(e, 0).unwrap_or(0), read_u32(e, 4).unwrap_or(0)))
            .collect();

        let mut functions = Vec::new();
        let mut at = 0usize;
        let bad_sym = || format_error("invalid debug symbol table");
        for _ in 0..num_syms {
            if at + SYMBOL_SIZE > symbols.len() {
                return Err(bad_sym());
            }
            let code_start = read_u32(symbols, at + 6).ok_or_else(bad_sym)?;
            let code_end = read_u32(symbols, at + 10).ok_or_else(bad_sym)?;
            let ident = read_u8(symbols, at + 14).ok_or_else(bad_sym)?;
            let dim_count = read_u16(symbols, at + 16).ok_or_else(bad_sym)? as usize;
            let name = read_u32(symbols, at + 18).ok_or_else(bad_sym)?;
            if ident == IDENT_FUNCTION {
                functions.push(FunctionSymbol {
                    name: string_at(name)?,
                    code_start,
                    code_end,
                });
            }
            at += SYMBOL_SIZE + dim_count * ARRAY_DIM_SIZE;
        }

        debug!(
            version = self.version,
            files = num_files,
            lines = num_lines,
            symbols = num_syms,
            "parsed debug tables"
        );
        Ok(DebugInfo::new(file_table, line_table, functions))
    }
}

/// Serialize an image into an SMX container.
///
/// With `compress` set, everything after the section names is zlib
/// compressed, matching what the reference compiler emits.
pub fn write_image(image: &Image, compress: bool) -> PawnResult<Vec<u8>> {
    let mut names = NameTable::default();
    let mut sections: Vec<(&str, Vec<u8>)> = Vec::new();

    let mut code = Vec::with_capacity(CODE_HEADER_SIZE + image.code().len() * 4);
    code.extend_from_slice(&image.code_size().to_le_bytes());
    code.push(4);
    code.push(CODE_VERSION_MAX);
    code.extend_from_slice(&image.flags().bits().to_le_bytes());
    code.extend_from_slice(&0u32.to_le_bytes());
    code.extend_from_slice(&(CODE_HEADER_SIZE as u32).to_le_bytes());
    for cell in image.code() {
        code.extend_from_slice(&cell.to_le_bytes());
    }
    sections.push((".code", code));

    let mut data = Vec::with_capacity(DATA_HEADER_SIZE + image.data().len());
    data.extend_from_slice(&image.data_size().to_le_bytes());
    data.extend_from_slice(&image.heap_size().to_le_bytes());
    data.extend_from_slice(&(DATA_HEADER_SIZE as u32).to_le_bytes());
    data.extend_from_slice(image.data());
    sections.push((".data", data));

    let mut publics = Vec::new();
    for public in image.publics() {
        publics.extend_from_slice(&public.code_offset.to_le_bytes());
        publics.extend_from_slice(&names.add(&public.name).to_le_bytes());
    }
    sections.push((".publics", publics));

    let mut pubvars = Vec::new();
    for pubvar in image.pubvars() {
        pubvars.extend_from_slice(&pubvar.address.to_le_bytes());
        pubvars.extend_from_slice(&names.add(&pubvar.name).to_le_bytes());
    }
    sections.push((".pubvars", pubvars));

    let mut natives = Vec::new();
    for native in image.natives() {
        natives.extend_from_slice(&names.add(&native.name).to_le_bytes());
    }
    sections.push((".natives", natives));
    sections.push((".names", names.bytes));

    if let Some(dbg) = image.debug() {
        let mut strings = NameTable::default();
        let mut files = Vec::new();
        for (addr, file) in dbg.files() {
            files.extend_from_slice(&addr.to_le_bytes());
            files.extend_from_slice(&strings.add(file).to_le_bytes());
        }
        let mut lines = Vec::new();
        for (addr, line) in dbg.lines() {
            lines.extend_from_slice(&addr.to_le_bytes());
            lines.extend_from_slice(&line.to_le_bytes());
        }
        let mut symbols = Vec::new();
        for sym in dbg.functions() {
            symbols.extend_from_slice(&(sym.code_start as i32).to_le_bytes());
            symbols.extend_from_slice(&0i16.to_le_bytes());
            symbols.extend_from_slice(&sym.code_start.to_le_bytes());
            symbols.extend_from_slice(&sym.code_end.to_le_bytes());
            symbols.push(IDENT_FUNCTION);
            symbols.push(0);
            symbols.extend_from_slice(&0u16.to_le_bytes());
            symbols.extend_from_slice(&strings.add(&sym.name).to_le_bytes());
        }
        let mut info = Vec::new();
        info.extend_from_slice(&(dbg.num_files() as u32).to_le_bytes());
        info.extend_from_slice(&(dbg.num_lines() as u32).to_le_bytes());
        info.extend_from_slice(&(dbg.functions().len() as u32).to_le_bytes());
        info.extend_from_slice(&0u32.to_le_bytes());

        sections.push((".dbg.info", info));
        sections.push((".dbg.files", files));
        sections.push((".dbg.lines", lines));
        sections.push((".dbg.symbols", symbols));
        sections.push((".dbg.strings", strings.bytes));
    }

    let mut header_names = NameTable::default();
    let name_offsets: Vec<u32> = sections.iter().map(|s| header_names.add(s.0)).collect();

    let string_table = HEADER_SIZE + sections.len() * SECTION_ENTRY_SIZE;
    let data_offset = string_table + header_names.bytes.len();

    let mut body = Vec::new();
    let mut table = Vec::with_capacity(sections.len() * SECTION_ENTRY_SIZE);
    for ((_, contents), name_offs) in sections.iter().zip(&name_offsets) {
        table.extend_from_slice(&name_offs.to_le_bytes());
        table.extend_from_slice(&((data_offset + body.len()) as u32).to_le_bytes());
        table.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        body.extend_from_slice(contents);
    }

    let image_size = data_offset + body.len();
    let payload = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        encoder.finish()?
    } else {
        body
    };
    let disk_size = data_offset + payload.len();

    let mut out = Vec::with_capacity(disk_size);
    out.extend_from_slice(&FILE_MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION_MAX.to_le_bytes());
    out.push(if compress {
        COMPRESSION_ZLIB
    } else {
        COMPRESSION_NONE
    });
    out.extend_from_slice(&(disk_size as u32).to_le_bytes());
    out.extend_from_slice(&(image_size as u32).to_le_bytes());
    out.push(sections.len() as u8);
    out.extend_from_slice(&(string_table as u32).to_le_bytes());
    out.extend_from_slice(&(data_offset as u32).to_le_bytes());
    out.extend_from_slice(&table);
    out.extend_from_slice(&header_names.bytes);
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Default)]
struct NameTable {
    bytes: Vec<u8>,
}

impl NameTable {
    fn add(&mut self, name: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }
}
