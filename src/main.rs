// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/main.rs

// Command line driver: reads one source file, runs the pipeline and
// reports wall-clock timing on stderr.

// <>

use clap::Parser;

use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "wisp", version, about = "An annotation-driven Lisp interpreter")]
struct Cli {
    /// Source file to interpret
    path: PathBuf,
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()
        .unwrap();

    let cli = Cli::parse();

    let start = Instant::now();
    let result = wisp::run_file(&cli.path);
    eprintln!("Total time: {:.6}", start.elapsed().as_secs_f64());

    if let Err(e) = result {
        eprintln!("Error: {} (status {})", e, e.status());
        process::exit(-1);
    }
}
