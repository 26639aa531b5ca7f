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

use std::env::args;
use std::fs;
use std::io::{stdin, Read};
use std::process::exit;

use patchc::{compile, Patch, Registry};

// Reads a patch as JSON (file argument or stdin), writes the compiled
// program or the diagnostics as JSON. Exit code 1 means the patch did
// not compile, 2 means we never got as far as a patch.
fn main() {
    let source = match args().nth(1) {
        Some(path) => match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("couldn't read {}: {}", path, e);
                exit(2);
            }
        },
        None => {
            let mut text = String::new();
            if let Err(e) = stdin().read_to_string(&mut text) {
                eprintln!("couldn't read stdin: {}", e);
                exit(2);
            }
            text
        }
    };

    let patch: Patch = match serde_json::from_str(&source) {
        Ok(patch) => patch,
        Err(e) => {
            eprintln!("malformed patch: {}", e);
            exit(2);
        }
    };

    let registry = Registry::builtins();
    match compile(&registry, &patch) {
        Ok(program) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&program).expect("program serializes")
            );
        }
        Err(errors) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&errors).expect("diagnostics serialize")
            );
            exit(1);
        }
    }
}
