use clap::Parser;
use std::process::ExitCode;
use tickdb::StoreError;
use tickdb::cli::{self, Cli};
use tickdb::logging::init_logging;

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(err) = init_logging(args.verbose, args.quiet, args.log_file.as_deref()) {
        eprintln!("warning: logging disabled: {err}");
    }

    match cli::run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.chain().find_map(|cause| cause.downcast_ref::<StoreError>()) {
                Some(store_err) => eprintln!("error[{}]: {err:#}", store_err.code()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
