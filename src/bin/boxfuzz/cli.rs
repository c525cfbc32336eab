//! The command line interface of the fuzzer

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    about = "Fuzz the interface between a shared library and the application hosting it"
)]
pub struct Cli {
    #[arg(
        help = "Number of target libraries preceding the application binary",
        short = 'l',
        default_value_t = 1
    )]
    pub num_libraries: usize,

    #[arg(
        help = "Workload generator for the application, executed once per run",
        short = 't'
    )]
    pub workload: Option<PathBuf>,

    #[arg(
        help = "Regex describing the component fuzz target's API",
        short = 'r'
    )]
    pub api_regex: Option<String>,

    #[arg(
        help = "Max time between two interface crossings, in seconds",
        short = 'T',
        default_value_t = 30
    )]
    pub timeout: u64,

    #[arg(help = "Use version 2 of the symbol extractor", short = 'x')]
    pub extractor_v2: bool,

    #[arg(help = "RNG seed to use (default: wall time)", short = 's')]
    pub seed: Option<u64>,

    #[arg(
        help = "Limit the number of fuzzing iterations (default unlimited)",
        short = 'i'
    )]
    pub iterations: Option<u64>,

    #[arg(
        help = "Provide the API description manually instead of generating it",
        short = 'F'
    )]
    pub api_file: Option<PathBuf>,

    #[arg(
        help = "Provide the types description manually instead of generating it",
        short = 'G'
    )]
    pub types_file: Option<PathBuf>,

    #[arg(
        help = "Generate the API and type description files, then exit",
        short = 'X',
        conflicts_with_all = ["api_file", "types_file"]
    )]
    pub extract_only: bool,

    #[arg(
        help = "Additional library to be used as part of type analysis (repeatable)",
        short = 'L'
    )]
    pub analysis_libraries: Vec<PathBuf>,

    #[arg(help = "Path to store fuzzer output", short = 'O')]
    pub crash_root: Option<PathBuf>,

    #[arg(help = "Enable debugging output", short = 'd')]
    pub debug: bool,

    #[arg(help = "Enable heavy debugging mode", short = 'D')]
    pub heavy_debug: bool,

    #[arg(
        help = "Statically determine the API entry point count",
        short = 'S'
    )]
    pub static_estimate: bool,

    #[arg(
        help = "Also reproduce and minimize false positives",
        short = 'm'
    )]
    pub minimize_false_positives: bool,

    #[arg(help = "Disable fancy output", short = 'C')]
    pub no_colour: bool,

    #[arg(
        help = "Enable safebox mode: the component fuzz target is attacked (default is \
                sandbox mode, where the application is attacked)",
        short = 'R'
    )]
    pub safebox: bool,

    #[arg(
        help = "Target shared libraries followed by the application binary",
        name = "TARGETS",
        required = true,
        num_args(1..)
    )]
    pub targets: Vec<PathBuf>,

    #[arg(
        help = "Arguments passed to the application",
        last = true,
        allow_hyphen_values = true
    )]
    pub app_args: Vec<String>,
}
