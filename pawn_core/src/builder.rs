//! Programmatic image construction.
//!
//! The builder assembles instructions cell by cell, resolving code labels
//! when the image is finished. It is what tests, benchmarks and embedders
//! without an external compiler use to produce bytecode.

use smallvec::SmallVec;

use crate::debug::{DebugInfo, FunctionSymbol};
use crate::error::ErrorCode;
use crate::image::{CodeFlags, Image, NativeInfo, PublicInfo, PubvarInfo};
use crate::opcode::Opcode;
use crate::{Cell, CELL_SIZE};

/// A code position that may be referenced before it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Default)]
struct LabelState {
    bound: Option<u32>,
    fixups: SmallVec<[usize; 4]>,
}

/// Incremental bytecode assembler.
#[derive(Debug)]
pub struct ImageBuilder {
    name: String,
    code: Vec<Cell>,
    data: Vec<u8>,
    heap_size: u32,
    labels: Vec<LabelState>,
    natives: Vec<NativeInfo>,
    publics: Vec<PublicInfo>,
    pubvars: Vec<PubvarInfo>,
    files: Vec<(u32, String)>,
    lines: Vec<(u32, u32)>,
    functions: Vec<FunctionSymbol>,
    open_function: Option<(String, u32)>,
}

impl ImageBuilder {
    /// Start an empty image.
    pub fn new(name: impl Into<String>) -> Self {
        ImageBuilder {
            name: name.into(),
            code: Vec::new(),
            data: Vec::new(),
            heap_size: 0,
            labels: Vec::new(),
            natives: Vec::new(),
            publics: Vec::new(),
            pubvars: Vec::new(),
            files: Vec::new(),
            lines: Vec::new(),
            functions: Vec::new(),
            open_function: None,
        }
    }

    /// Current code offset in bytes.
    #[inline]
    pub fn here(&self) -> u32 {
        self.code.len() as u32 * CELL_SIZE
    }

    /// Declare total memory (data, heap and stack) in bytes.
    pub fn heap_size(&mut self, bytes: u32) -> &mut Self {
        self.heap_size = bytes;
        self
    }

    /// Export the next instruction as a public function.
    pub fn public(&mut self, name: impl Into<String>) -> u32 {
        let offset = self.here();
        self.publics.push(PublicInfo {
            name: name.into(),
            code_offset: offset,
        });
        offset
    }

    /// Import a native; returns its index.
    pub fn native(&mut self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(idx) = self.natives.iter().position(|n| n.name == name) {
            return idx as u32;
        }
        self.natives.push(NativeInfo { name });
        (self.natives.len() - 1) as u32
    }

    /// Append cells to the data segment; returns their address.
    pub fn data_cells(&mut self, cells: &[Cell]) -> u32 {
        let addr = self.data.len() as u32;
        for cell in cells {
            self.data.extend_from_slice(&cell.to_le_bytes());
        }
        addr
    }

    /// Append a NUL-terminated string to the data segment, padded to a cell.
    pub fn data_string(&mut self, text: &str) -> u32 {
        let addr = self.data.len() as u32;
        self.data.extend_from_slice(text.as_bytes());
        self.data.push(0);
        while self.data.len() % CELL_SIZE as usize != 0 {
            self.data.push(0);
        }
        addr
    }

    /// Export a data address as a public variable.
    pub fn pubvar(&mut self, name: impl Into<String>, address: u32) -> &mut Self {
        self.pubvars.push(PubvarInfo {
            name: name.into(),
            address,
        });
        self
    }

    /// Allocate an unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let here = self.here();
        self.labels[label.0 as usize].bound = Some(here);
        self
    }

    /// A label bound to the current offset.
    pub fn label_here(&mut self) -> Label {
        let label = self.new_label();
        self.bind(label);
        label
    }

    /// Emit a raw cell.
    pub fn cell(&mut self, value: Cell) -> &mut Self {
        self.code.push(value);
        self
    }

    /// Emit an instruction without operands.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.cell(op as Cell)
    }

    /// Emit an instruction with one operand.
    pub fn op1(&mut self, op: Opcode, a: Cell) -> &mut Self {
        self.cell(op as Cell).cell(a)
    }

    /// Emit an instruction with two operands.
    pub fn op2(&mut self, op: Opcode, a: Cell, b: Cell) -> &mut Self {
        self.cell(op as Cell).cell(a).cell(b)
    }

    /// Emit an instruction with any number of operands.
    pub fn op_n(&mut self, op: Opcode, operands: &[Cell]) -> &mut Self {
        self.cell(op as Cell);
        for &operand in operands {
            self.cell(operand);
        }
        self
    }

    /// Emit a reference to `label` as an operand cell.
    pub fn label_ref(&mut self, label: Label) -> &mut Self {
        let pos = self.code.len();
        self.labels[label.0 as usize].fixups.push(pos);
        self.cell(0)
    }

    /// Emit a jump-family instruction targeting `label`.
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        self.op(op).label_ref(label)
    }

    /// Emit `CALL label`.
    pub fn call(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::Call, label)
    }

    /// Emit `SWITCH` followed by its `CASETBL`.
    pub fn switch(&mut self, default: Label, cases: &[(Cell, Label)]) -> &mut Self {
        let table = self.new_label();
        self.op(Opcode::Switch).label_ref(table);
        self.bind(table);
        self.op(Opcode::Casetbl).cell(cases.len() as Cell).label_ref(default);
        for &(value, target) in cases {
            self.cell(value).label_ref(target);
        }
        self
    }

    /// Begin a function: records its symbol and emits `PROC`.
    pub fn begin_function(&mut self, name: impl Into<String>) -> u32 {
        self.end_function();
        let start = self.here();
        self.open_function = Some((name.into(), start));
        self.op(Opcode::Proc);
        start
    }

    /// Close the currently open function symbol.
    pub fn end_function(&mut self) -> &mut Self {
        if let Some((name, start)) = self.open_function.take() {
            let end = self.here();
            self.functions.push(FunctionSymbol {
                name,
                code_start: start,
                code_end: end,
            });
        }
        self
    }

    /// Record that code from here on comes from `file`.
    pub fn source_file(&mut self, file: impl Into<String>) -> &mut Self {
        let here = self.here();
        self.files.push((here, file.into()));
        self
    }

    /// Record that code from here on is on zero-based `line`.
    pub fn source_line(&mut self, line: u32) -> &mut Self {
        let here = self.here();
        self.lines.push((here, line));
        self
    }

    /// Resolve labels and produce the image.
    pub fn build(mut self) -> Result<Image, ErrorCode> {
        self.end_function();

        for state in &self.labels {
            if state.fixups.is_empty() {
                continue;
            }
            let target = state.bound.ok_or(ErrorCode::InstructionParam)?;
            for &pos in &state.fixups {
                self.code[pos] = target as Cell;
            }
        }

        let has_debug =
            !self.files.is_empty() || !self.lines.is_empty() || !self.functions.is_empty();
        let (flags, debug) = if has_debug {
            (
                CodeFlags::DEBUG,
                Some(DebugInfo::new(self.files, self.lines, self.functions)),
            )
        } else {
            (CodeFlags::empty(), None)
        };

        Image::new(
            self.name,
            self.code,
            self.data,
            self.heap_size,
            flags,
            self.natives,
            self.publics,
            self.pubvars,
            debug,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_function() {
        let mut b = ImageBuilder::new("t");
        b.public("main");
        b.op(Opcode::Proc)
            .op1(Opcode::ConstPri, 5)
            .op1(Opcode::ConstAlt, 7)
            .op(Opcode::Add)
            .op(Opcode::Retn);
        let image = b.build().unwrap();
        assert_eq!(image.code_size(), 28);
        assert_eq!(image.code_cell(0), Some(Opcode::Proc as Cell));
        assert_eq!(image.code_cell(8), Some(5));
        assert!(image.debug().is_none());
    }

    #[test]
    fn test_forward_and_backward_labels() {
        let mut b = ImageBuilder::new("t");
        b.op(Opcode::Proc);
        let top = b.label_here();
        let out = b.new_label();
        b.jump(Opcode::Jzer, out);
        b.jump(Opcode::Jump, top);
        b.bind(out);
        b.op(Opcode::Retn);
        let image = b.build().unwrap();
        assert_eq!(image.code_cell(8), Some(20));
        assert_eq!(image.code_cell(16), Some(4));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut b = ImageBuilder::new("t");
        let l = b.new_label();
        b.jump(Opcode::Jump, l);
        assert_eq!(b.build().unwrap_err(), ErrorCode::InstructionParam);
    }

    #[test]
    fn test_switch_layout() {
        let mut b = ImageBuilder::new("t");
        b.op(Opcode::Proc);
        let a = b.new_label();
        let d = b.new_label();
        b.switch(d, &[(3, a)]);
        b.bind(a);
        b.bind(d);
        b.op(Opcode::Retn);
        let image = b.build().unwrap();
        // proc, switch tbl, casetbl 1 default 3 target, retn
        assert_eq!(image.code_cell(8), Some(12));
        assert_eq!(image.code_cell(12), Some(Opcode::Casetbl as Cell));
        assert_eq!(image.code_cell(16), Some(1));
        assert_eq!(image.code_cell(20), Some(32));
        assert_eq!(image.code_cell(24), Some(3));
        assert_eq!(image.code_cell(28), Some(32));
    }

    #[test]
    fn test_function_symbols_enable_debug() {
        let mut b = ImageBuilder::new("t");
        b.source_file("main.sp");
        b.begin_function("main");
        b.source_line(3);
        b.op(Opcode::Retn);
        b.begin_function("second");
        b.op(Opcode::Retn);
        let image = b.build().unwrap();
        assert!(image.flags().contains(CodeFlags::DEBUG));
        let dbg = image.debug().unwrap();
        assert_eq!(dbg.functions().len(), 2);
        assert_eq!(dbg.lookup_function(8).unwrap().name, "second");
        assert_eq!(dbg.lookup_line(4), Some(4));
    }

    #[test]
    fn test_data_segment() {
        let mut b = ImageBuilder::new("t");
        let a = b.data_cells(&[1, 2]);
        let s = b.data_string("hey");
        assert_eq!(a, 0);
        assert_eq!(s, 8);
        b.pubvar("greeting", s);
        let image = b.build().unwrap();
        assert_eq!(image.data_size(), 12);
        assert_eq!(&image.data()[8..12], b"hey\0");
    }
}
