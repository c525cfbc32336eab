//! The supervisor binary: sanity checks and API extraction up front, then
//! the fuzzing session.

mod cli;

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use log::LevelFilter;
use nix::sys::personality::{self, Persona};
use signal_hook::consts::SIGINT;

use boxfuzz::{
    error::{Error, Result},
    extract, fuzzer,
    supervisor::{
        Config, Mode, Supervisor, SYMBOLS_FILE_PATH, TYPES_FILE_PATH, WORKER_MAPPINGS_COPY_PATH,
        WORKER_OUTPUT_PATH_OLD,
    },
    ui::Console,
};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // -d / -D raise the log level unless RUST_LOG already decides
    let mut builder = env_logger::Builder::from_default_env();
    if env::var_os("RUST_LOG").is_none() {
        let level = if cli.heavy_debug {
            LevelFilter::Trace
        } else if cli.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        };
        builder.filter_level(level);
    }
    builder.init();

    let console = Console::new(!cli.no_colour);
    console.banner();

    if cli.targets.len() < cli.num_libraries + 1 {
        return Err(Error::Precondition(
            "not enough arguments supplied; is the application binary path missing?".into(),
        ));
    }
    let libraries: Vec<PathBuf> = cli.targets[..cli.num_libraries].to_vec();
    let app = std::path::absolute(&cli.targets[cli.num_libraries])?;
    let app_args = cli.app_args.clone();

    console.info("Starting up...");

    // disable randomization; this applies to children as well and keeps
    // stack traces comparable across runs
    personality::set(personality::get()? | Persona::ADDR_NO_RANDOMIZE)?;

    let seed = cli.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    });
    log::debug!("using seed {seed}");

    let exe_dir = env::current_exe()?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let helpers = extract::Helpers::discover(&exe_dir)?;
    let crash_root = cli.crash_root.clone().unwrap_or_else(|| exe_dir.join(".."));

    console.info("Performing sanity checks");

    // stale scratch files from a previous session
    let _ = fs::remove_file(WORKER_MAPPINGS_COPY_PATH);
    let _ = fs::remove_file(WORKER_OUTPUT_PATH_OLD);

    if let Some(workload) = &cli.workload {
        extract::check_exists("workload script", workload)?;
    }
    for library in libraries.iter().chain(cli.analysis_libraries.iter()) {
        extract::check_exists("shared library", library)?;
    }
    extract::check_exists("application", &app)?;

    console.info("Sanity-checking binaries...");
    extract::check_sanitizer(&app)?;
    extract::check_debug_info(&app)?;
    for library in &libraries {
        extract::check_debug_info(library)?;
    }

    if let Some(api_file) = &cli.api_file {
        extract::check_exists("existing API description", api_file)?;
        console.info(format!(
            "Retrieving library symbols from {}",
            api_file.display()
        ));
        fs::copy(api_file, SYMBOLS_FILE_PATH)?;
        if extract::symbols_count(Path::new(SYMBOLS_FILE_PATH)) == 0 {
            return Err(Error::Precondition(
                "passed API description looks invalid".into(),
            ));
        }
    } else {
        console.info("Retrieving library symbols (can take a bit of time)");
        extract::extract_symbols(
            &helpers,
            cli.extractor_v2,
            cli.api_regex.as_deref().unwrap_or(""),
            &libraries,
            Path::new(SYMBOLS_FILE_PATH),
        )?;
    }

    // type analysis also considers the -L libraries
    let mut analysis_union = libraries.clone();
    for library in &cli.analysis_libraries {
        if !analysis_union.contains(library) {
            analysis_union.push(library.clone());
        }
    }

    if let Some(types_file) = &cli.types_file {
        extract::check_exists("existing types description", types_file)?;
        console.info(format!(
            "Retrieving type information from {}",
            types_file.display()
        ));
        fs::copy(types_file, TYPES_FILE_PATH)?;
    } else {
        console.info("Retrieving symbol type information (can take a bit of time)");
        extract::extract_types(
            &helpers,
            Path::new(TYPES_FILE_PATH),
            Path::new(SYMBOLS_FILE_PATH),
            &analysis_union,
        )?;
    }

    if cli.extract_only {
        return Ok(());
    }

    let cfg = Config {
        mode: if cli.safebox {
            Mode::Safebox
        } else {
            Mode::Sandbox
        },
        libraries,
        app,
        app_args,
        workload: cli.workload.clone(),
        worker_timeout: Duration::from_secs(cli.timeout),
        seed,
        iterations: cli.iterations,
        crash_root,
        minimize_false_positives: cli.minimize_false_positives,
        static_estimate: cli.static_estimate,
        debug: cli.debug || cli.heavy_debug,
        heavy_debug: cli.heavy_debug,
        colour: !cli.no_colour,
    };
    let mut sup = Supervisor::new(cfg, helpers);

    sup.artifacts.init(seed)?;
    sup.artifacts
        .backup_instrumented_functions(Path::new(SYMBOLS_FILE_PATH))?;
    sup.artifacts.append_session_info(&format!(
        "Total instrumented API size: {}",
        extract::symbols_count(Path::new(SYMBOLS_FILE_PATH))
    ))?;

    console.info("Registering handlers");
    signal_hook::flag::register(SIGINT, sup.quit_flag())?;

    console.info("All done. Ready to fuzz!");
    console.blank();

    let result = fuzzer::fuzzing_loop(&mut sup);

    console.info("Done fuzzing. Exiting.");
    console.blank();

    sup.finalize_session()?;
    sup.remove_fifos();

    result
}
