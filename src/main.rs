#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

use std::process::ExitCode;

fn main() -> ExitCode {
    match proximity_watch::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("proximity-watch: {}", e);
            ExitCode::FAILURE
        }
    }
}
