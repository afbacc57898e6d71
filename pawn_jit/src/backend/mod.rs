//! Native code generation backends.

pub mod x64;
