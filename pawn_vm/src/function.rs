//! Host-side calls into public functions.
//!
//! A [`Function`] collects arguments and runs one invocation. Cells pass by
//! value. Arrays and strings are copied into heap allocations made just for
//! the call and passed by address; arrays may be copied back afterwards.
//! The allocations are freed in reverse order whatever the outcome.

use pawn_core::{Cell, ErrorCode, PawnResult, MAX_EXEC_PARAMS};
use smallvec::SmallVec;

use crate::runtime::Runtime;

/// A pending argument.
#[derive(Debug)]
enum Param<'a> {
    Cell(Cell),
    Array { data: &'a mut [Cell], copy_back: bool },
    String(String),
}

/// A public function ready to be called.
#[derive(Debug)]
pub struct Function<'a> {
    rt: &'a mut Runtime,
    id: u32,
    name: String,
    offset: u32,
    params: SmallVec<[Param<'a>; 8]>,
}

impl<'a> Function<'a> {
    pub(crate) fn new(rt: &'a mut Runtime, id: u32, name: String, offset: u32) -> Self {
        Function {
            rt,
            id,
            name,
            offset,
            params: SmallVec::new(),
        }
    }

    /// Index in the image's public table.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Code offset of the function's `PROC`.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Arguments pushed so far.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    fn push_param(&mut self, param: Param<'a>) -> PawnResult<()> {
        if self.params.len() >= MAX_EXEC_PARAMS {
            return Err(ErrorCode::ParamsMax.into());
        }
        self.params.push(param);
        Ok(())
    }

    pub fn push_cell(&mut self, value: Cell) -> PawnResult<()> {
        self.push_param(Param::Cell(value))
    }

    /// Push each of `values` as its own argument.
    pub fn push_cells(&mut self, values: &[Cell]) -> PawnResult<()> {
        if self.params.len() + values.len() > MAX_EXEC_PARAMS {
            return Err(ErrorCode::ParamsMax.into());
        }
        self.params.extend(values.iter().map(|&v| Param::Cell(v)));
        Ok(())
    }

    /// Pass `data` by reference. With `copy_back`, whatever the script left
    /// in the array is written back after a successful call.
    pub fn push_array(&mut self, data: &'a mut [Cell], copy_back: bool) -> PawnResult<()> {
        self.push_param(Param::Array { data, copy_back })
    }

    /// Pass a NUL-terminated copy of `text`.
    pub fn push_string(&mut self, text: &str) -> PawnResult<()> {
        self.push_param(Param::String(text.to_owned()))
    }

    /// Run the function and return its result. Pushed arguments are
    /// consumed either way.
    pub fn execute(&mut self) -> PawnResult<Cell> {
        let mut params = std::mem::take(&mut self.params);
        let mut cells = SmallVec::<[Cell; 8]>::with_capacity(params.len());
        let mut allocations = SmallVec::<[(u32, usize); 4]>::new();

        let marshalled = self.marshal(&params, &mut cells, &mut allocations);
        let result = match marshalled {
            Ok(()) => self.rt.invoke(self.offset, &cells),
            Err(code) => Err(code.into()),
        };

        let mut release = Ok(());
        for &(addr, index) in allocations.iter().rev() {
            if result.is_ok() {
                if let Param::Array { data, copy_back: true } = &mut params[index] {
                    for (i, slot) in data.iter_mut().enumerate() {
                        match self.rt.state.read_cell(addr + 4 * i as u32) {
                            Ok(value) => *slot = value,
                            Err(code) => release = release.and(Err(code)),
                        }
                    }
                }
            }
            if let Err(code) = self.rt.state.heap_pop(addr) {
                release = release.and(Err(code));
            }
        }

        let value = result?;
        release?;
        Ok(value)
    }

    /// Copy by-reference arguments into the heap and build the cell list.
    fn marshal(
        &mut self,
        params: &[Param<'a>],
        cells: &mut SmallVec<[Cell; 8]>,
        allocations: &mut SmallVec<[(u32, usize); 4]>,
    ) -> Result<(), ErrorCode> {
        let state = &mut self.rt.state;
        for (index, param) in params.iter().enumerate() {
            match param {
                Param::Cell(value) => cells.push(*value),
                Param::Array { data, .. } => {
                    let addr = state.heap_alloc(data.len().max(1) as u32)?;
                    allocations.push((addr, index));
                    for (i, &value) in data.iter().enumerate() {
                        state.write_cell(addr + 4 * i as u32, value)?;
                    }
                    cells.push(addr as Cell);
                }
                Param::String(text) => {
                    let bytes = text.len() as u32 + 1;
                    let addr = state.heap_alloc(bytes.div_ceil(4))?;
                    allocations.push((addr, index));
                    state.write_string(addr, text, bytes)?;
                    cells.push(addr as Cell);
                }
            }
        }
        Ok(())
    }
}
