//! Debug tables: source files, line numbers and function extents.
//!
//! Each table is sorted by code address. A lookup finds the last entry whose
//! address is at or below the queried cip.

/// A function symbol with the code range it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    /// Function name.
    pub name: String,
    /// First code byte of the function.
    pub code_start: u32,
    /// One past the last code byte.
    pub code_end: u32,
}

/// Debug information attached to an image.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    files: Vec<(u32, String)>,
    lines: Vec<(u32, u32)>,
    functions: Vec<FunctionSymbol>,
}

impl DebugInfo {
    /// Build from unsorted tables.
    pub fn new(
        mut files: Vec<(u32, String)>,
        mut lines: Vec<(u32, u32)>,
        mut functions: Vec<FunctionSymbol>,
    ) -> Self {
        files.sort_by_key(|f| f.0);
        lines.sort_by_key(|l| l.0);
        functions.sort_by_key(|f| f.code_start);
        DebugInfo {
            files,
            lines,
            functions,
        }
    }

    /// Source file containing `cip`.
    pub fn lookup_file(&self, cip: u32) -> Option<&str> {
        let idx = self.files.partition_point(|f| f.0 <= cip);
        idx.checked_sub(1).map(|i| self.files[i].1.as_str())
    }

    /// Source line of `cip`.
    ///
    /// Line numbers are stored zero-based and reported one-based.
    pub fn lookup_line(&self, cip: u32) -> Option<u32> {
        let idx = self.lines.partition_point(|l| l.0 <= cip);
        idx.checked_sub(1).map(|i| self.lines[i].1 + 1)
    }

    /// Function containing `cip`.
    pub fn lookup_function(&self, cip: u32) -> Option<&FunctionSymbol> {
        self.functions
            .iter()
            .find(|f| cip >= f.code_start && cip < f.code_end)
    }

    /// Number of file entries.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Number of line entries.
    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    /// File table as `(first address, name)` pairs.
    pub fn files(&self) -> &[(u32, String)] {
        &self.files
    }

    /// Line table as `(first address, zero-based line)` pairs.
    pub fn lines(&self) -> &[(u32, u32)] {
        &self.lines
    }

    /// All function symbols.
    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DebugInfo {
        DebugInfo::new(
            vec![(40, "b.sp".into()), (0, "a.sp".into())],
            vec![(0, 0), (8, 1), (24, 5), (40, 0)],
            vec![
                FunctionSymbol {
                    name: "main".into(),
                    code_start: 0,
                    code_end: 40,
                },
                FunctionSymbol {
                    name: "helper".into(),
                    code_start: 40,
                    code_end: 80,
                },
            ],
        )
    }

    #[test]
    fn test_lookup_file() {
        let dbg = sample();
        assert_eq!(dbg.lookup_file(0), Some("a.sp"));
        assert_eq!(dbg.lookup_file(39), Some("a.sp"));
        assert_eq!(dbg.lookup_file(44), Some("b.sp"));
    }

    #[test]
    fn test_lookup_line() {
        let dbg = sample();
        assert_eq!(dbg.lookup_line(4), Some(1));
        assert_eq!(dbg.lookup_line(28), Some(6));
    }

    #[test]
    fn test_lookup_function() {
        let dbg = sample();
        assert_eq!(dbg.lookup_function(12).map(|f| f.name.as_str()), Some("main"));
        assert_eq!(dbg.lookup_function(40).map(|f| f.name.as_str()), Some("helper"));
        assert!(dbg.lookup_function(80).is_none());
    }

    #[test]
    fn test_empty_tables() {
        let dbg = DebugInfo::default();
        assert_eq!(dbg.lookup_file(0), None);
        assert_eq!(dbg.lookup_line(0), None);
    }
}
