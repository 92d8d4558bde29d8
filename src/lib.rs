// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/lib.rs

// Top level lib: declares the interpreter module tree.

// <>

pub mod wisp;

pub use wisp::{interpret, run_file, ErrCode};
