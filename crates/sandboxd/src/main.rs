use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    match sandboxd::run_server() {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            // Telemetry may not be installed when bootstrap fails.
            drop(writeln!(io::stderr(), "sandboxd: {error}"));
            ExitCode::FAILURE
        }
    }
}
