//! Quiesce Types
//!
//! Shared atoms of the quiesce engine: constants, symbols, identifier handles,
//! timetags and the thread-safe constant interning table. Every agent of a
//! kernel shares one [`SymbolTable`]; everything else is per agent.

#![allow(missing_docs)]

mod types;
pub use types::{ConstId, Constant, IdHandle, Symbol, SymbolTable, Timetag, TimetagSource};
