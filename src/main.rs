use std::io;
use std::process;

use clap::Parser;
use rsprovision::backends::{self, Services};
use rsprovision::cli::{self, Cli};
use rsprovision::init_logging;
use rsprovision::task::{TaskReport, TaskRunner};

fn main() {
    let report = match Cli::try_parse() {
        Ok(args) => run(args),
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => TaskRunner::new(cli::UNKNOWN_BACKEND).reject(cli::usage_error(&e).into()),
    };

    println!("{}", report.line);
    process::exit(report.exit_code);
}

fn run(args: Cli) -> TaskReport {
    let backend = args.backend;
    let runner = TaskRunner::new(backend.to_string());
    if let Err(e) = init_logging(args.log_level) {
        return runner.reject(e);
    }
    runner.run_from(io::stdin().lock(), || backends::build(backend, &Services::system()))
}
