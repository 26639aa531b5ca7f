// patchc: featherweight dataflow patch compiler.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate enumflags2;
extern crate lalrpop_util;
extern crate regex;
extern crate serde;
extern crate serde_json;
#[macro_use]
extern crate lazy_static;

lalrpop_util::lalrpop_mod!(pub grammar, "/grammar.rs");

#[macro_use]
pub mod util;
pub mod ast;
pub mod blocks;
pub mod compile;
pub mod debug;
pub mod diag;
pub mod history;
pub mod ir;
pub mod lower;
pub mod parser;
pub mod passes;
pub mod patch;
pub mod program;
pub mod registry;
pub mod schedule;
pub mod shapes;
pub mod typechecker;
pub mod types;

pub use crate::compile::compile;
pub use crate::diag::Diagnostic;
pub use crate::patch::Patch;
pub use crate::program::CompiledProgram;
pub use crate::registry::Registry;
