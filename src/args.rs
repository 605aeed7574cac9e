use clap::{Parser, Subcommand};

/// Meek STV counting and ballot chain verification for organizational elections.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Counts the ballots of a tally input file.
    Tally {
        /// (file path) The tally input, in JSON format. See the `manual` module of meek_stv for the format.
        #[clap(short, long, value_parser)]
        input: String,

        /// (file path, 'stdout' or empty) Where to write the result in JSON format. Defaults to the standard output.
        #[clap(short, long, value_parser)]
        out: Option<String>,

        /// (file path) A reference file containing the expected result in JSON format. If provided, the command
        /// fails when the computed result differs from it.
        #[clap(short, long, value_parser)]
        reference: Option<String>,
    },

    /// Recomputes the ballot chain of a public ballots export and checks its head.
    VerifyChain {
        /// (file path) The public ballots export of a closed election.
        #[clap(short, long, value_parser)]
        input: String,
    },

    /// Replays a scripted election from draft to tally, in memory.
    Simulate {
        /// (file path) The scenario, in JSON format.
        #[clap(short, long, value_parser)]
        input: String,

        /// (file path, optional) The settings, in JSON format. Defaults apply when missing.
        #[clap(short, long, value_parser)]
        settings: Option<String>,

        /// (file path, 'stdout' or empty) Where to write the public exports. Defaults to the standard output.
        #[clap(short, long, value_parser)]
        out: Option<String>,
    },
}
