mod args;

use clap::Parser;
use log::{debug, warn, LevelFilter};
use snafu::ErrorCompat;

use astra_elections::elections::runner::{run_simulate, run_tally, run_verify_chain};

use crate::args::{Args, Command};

fn main() {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
    debug!("args: {:?}", args);

    let res = match &args.command {
        Command::Tally {
            input,
            out,
            reference,
        } => run_tally(input, out.as_deref(), reference.as_deref()),
        Command::VerifyChain { input } => run_verify_chain(input).map(|_| ()),
        Command::Simulate {
            input,
            settings,
            out,
        } => run_simulate(input, settings.as_deref(), out.as_deref()),
    };

    if let Err(e) = res {
        warn!("Error occured {:?}", e);
        eprintln!("An error occured ({}): {}", e.code(), e);
        for cause in ErrorCompat::iter_chain(&e).skip(1) {
            eprintln!("caused by: {}", cause);
        }
        if let Some(bt) = ErrorCompat::backtrace(&e) {
            eprintln!("trace: {}", bt);
        }
        std::process::exit(1);
    }
}
