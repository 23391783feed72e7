//! Benchmark driver. See `manifold::perf` for modes and arguments.

use manifold::perf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let outcome = perf::parse_args(std::env::args()).and_then(|cmd| perf::run(&cmd));
    match outcome {
        Ok(Some(report)) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(2)
        }
    }
}
