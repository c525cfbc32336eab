//! The offline side of the toolkit: locating the instrumentation helpers,
//! sanity-checking the targets, extracting the instrumentable API, and
//! assembling the worker command line.
//!
//! The helpers themselves (symbol extractors, type analyzers, the
//! instrumentation engine) are external programs shipped next to the
//! supervisor binary; this module only invokes them.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::{
    error::{Error, Result},
    maps::AddressSpace,
};

const INSTRUMENTATION_NAME: &str = "instrumentation.so";
const SYMBOL_EXTRACTOR_NAME: &str = "interface-extracter.sh";
const SYMBOL_EXTRACTOR_NAME_V2: &str = "interface-extracter-v2.sh";
const SYMBOL_RESOLVER_NAME: &str = "find-symbol-from-mappings.sh";
const TYPE_ANALYZER_NAME: &str = "analyze-type-wrapper.sh";
const TYPE_ALL_ANALYZER_NAME: &str = "analyze-all-types.sh";
const STATIC_ANALYZER_NAME: &str = "static-analyze-entry-points.py";
const ENGINE_RELATIVE_PATH: &str = "../pintools/pin";

/// Paths of the external helper programs, all relative to the directory
/// holding the supervisor binary.
#[derive(Debug, Clone)]
pub struct Helpers {
    pub engine: PathBuf,
    pub instrumentation: PathBuf,
    pub symbol_extractor: PathBuf,
    pub symbol_extractor_v2: PathBuf,
    pub symbol_resolver: PathBuf,
    pub type_analyzer: PathBuf,
    pub type_all_analyzer: PathBuf,
    pub static_analyzer: PathBuf,
}

impl Helpers {
    pub fn discover(exe_dir: &Path) -> Result<Self> {
        let helpers = Self {
            engine: exe_dir.join(ENGINE_RELATIVE_PATH),
            instrumentation: exe_dir.join(INSTRUMENTATION_NAME),
            symbol_extractor: exe_dir.join(SYMBOL_EXTRACTOR_NAME),
            symbol_extractor_v2: exe_dir.join(SYMBOL_EXTRACTOR_NAME_V2),
            symbol_resolver: exe_dir.join(SYMBOL_RESOLVER_NAME),
            type_analyzer: exe_dir.join(TYPE_ANALYZER_NAME),
            type_all_analyzer: exe_dir.join(TYPE_ALL_ANALYZER_NAME),
            static_analyzer: exe_dir.join(STATIC_ANALYZER_NAME),
        };
        for (what, path) in [
            ("instrumentation engine", &helpers.engine),
            ("instrumentation tool", &helpers.instrumentation),
            ("symbol extractor", &helpers.symbol_extractor),
            ("symbol extractor v2", &helpers.symbol_extractor_v2),
            ("symbol resolver", &helpers.symbol_resolver),
            ("type analyzer", &helpers.type_analyzer),
            ("full type analyzer", &helpers.type_all_analyzer),
            ("static analyzer", &helpers.static_analyzer),
        ] {
            if !path.exists() {
                return Err(Error::Precondition(format!(
                    "could not find the {what}, has this binary been moved? \
                     It should have been at {}",
                    path.display()
                )));
            }
        }
        Ok(helpers)
    }
}

pub fn check_exists(what: &str, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::Precondition(format!(
            "{what} path looks invalid, there is nothing at {}",
            path.display()
        )))
    }
}

/// The target must carry the sanitizer runtime; triage parses its reports.
pub fn check_sanitizer(app: &Path) -> Result<()> {
    let output = Command::new("objdump").arg("-TC").arg(app).output()?;
    if String::from_utf8_lossy(&output.stdout).contains("__asan_init") {
        Ok(())
    } else {
        Err(Error::Precondition(format!(
            "cannot detect ASan on {}, have you compiled it with -fsanitize=address?",
            app.display()
        )))
    }
}

/// Debug symbols are needed by the symbol and type extractors.
pub fn check_debug_info(target: &Path) -> Result<()> {
    if has_debug_info(target)? {
        Ok(())
    } else {
        Err(Error::Precondition(format!(
            "cannot detect debug symbols on {}, have you compiled it with -g?",
            target.display()
        )))
    }
}

fn has_debug_info(target: &Path) -> Result<bool> {
    let output = Command::new("file").arg("-L").arg(target).output()?;
    Ok(String::from_utf8_lossy(&output.stdout).contains("with debug_info"))
}

/// Run the symbol extractor over every target library, concatenating into
/// the symbols file. `api_regex` narrows the exported functions to
/// instrument; an empty result is a startup failure.
pub fn extract_symbols(
    helpers: &Helpers,
    use_v2: bool,
    api_regex: &str,
    libraries: &[PathBuf],
    symbols: &Path,
) -> Result<()> {
    let _ = fs::remove_file(symbols);
    let extractor = if use_v2 {
        &helpers.symbol_extractor_v2
    } else {
        &helpers.symbol_extractor
    };

    let mut collected = Vec::new();
    for library in libraries {
        let output = Command::new(extractor)
            .arg(api_regex)
            .arg(library)
            .output()?;
        collected.extend_from_slice(&output.stdout);
    }
    fs::write(symbols, &collected)?;

    if collected.is_empty() {
        return Err(diagnose_empty_symbols(api_regex, libraries));
    }
    Ok(())
}

/// Tell apart "no symbols at all" from "the regex matched nothing".
fn diagnose_empty_symbols(api_regex: &str, libraries: &[PathBuf]) -> Error {
    for library in libraries {
        let has_text = Command::new("objdump")
            .arg("-T")
            .arg(library)
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(".text"))
            .unwrap_or(false);
        if !has_text {
            return Error::Precondition(format!(
                "no symbols detected in {}; is this even a shared lib?",
                library.display()
            ));
        }
    }
    Error::Precondition(format!(
        "regex '{api_regex}' did not match any symbols in the target libraries"
    ))
}

/// Resolve argument and return types for the extracted API, considering
/// extra `-L` analysis libraries as well.
pub fn extract_types(
    helpers: &Helpers,
    types: &Path,
    symbols: &Path,
    libraries: &[PathBuf],
) -> Result<()> {
    let status = Command::new(&helpers.type_all_analyzer)
        .arg(types)
        .arg(symbols)
        .args(libraries)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        log::warn!("type analysis exited with {status}");
    }
    Ok(())
}

/// Number of instrumentable API functions, for the session statistics.
pub fn symbols_count(symbols: &Path) -> usize {
    fs::read_to_string(symbols)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StaticEstimate {
    pub call_sites: u64,
    pub endpoints: u64,
    pub components: u64,
}

/// Statically count API call sites in every caller component mapped into
/// the worker. Slow; only runs on request, once per session.
pub fn static_endpoint_estimate(
    helpers: &Helpers,
    maps: &AddressSpace,
    symbols: &Path,
) -> StaticEstimate {
    let mut estimate = StaticEstimate::default();
    let mut seen: Vec<&str> = Vec::new();

    for region in maps.text_regions() {
        let name = region.name.as_str();
        if name.is_empty() || seen.contains(&name) {
            continue;
        }
        seen.push(name);

        if name.contains("asan") || maps.instrumented_paths().any(|lib| lib == name) {
            continue;
        }
        if !has_debug_info(Path::new(name)).unwrap_or(false) {
            continue;
        }

        let output = match Command::new(&helpers.static_analyzer)
            .arg("-f")
            .arg(symbols)
            .arg("-b")
            .arg(name)
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                log::warn!("static analysis of {name} failed: {e}");
                continue;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut numbers = stdout.split_whitespace().filter_map(|w| w.parse::<u64>().ok());
        let call_sites = numbers.next().unwrap_or(0);
        let endpoints = numbers.next().unwrap_or(0);

        log::debug!("  {name}: {call_sites} call sites ({endpoints} endpoints)");

        if call_sites > 0 {
            estimate.components += 1;
        }
        estimate.call_sites += call_sites;
        estimate.endpoints += endpoints;
    }

    estimate
}

/// Everything needed to assemble one worker invocation: the engine runs
/// the instrumentation tool inside the target application, with the FIFO
/// endpoints and description files on its command line. Arguments after
/// `--` belong to the application.
#[derive(Debug)]
pub struct WorkerLaunch<'a> {
    pub helpers: &'a Helpers,
    pub symbols: &'a Path,
    pub types: &'a Path,
    pub monitor_fifo: &'a Path,
    pub worker_fifo: &'a Path,
    pub fuzz_log: &'a Path,
    pub libraries: &'a [PathBuf],
    pub app: &'a Path,
    pub app_args: &'a [String],
    pub verbose: bool,
}

impl WorkerLaunch<'_> {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.helpers.engine);
        cmd.arg("-t")
            .arg(&self.helpers.instrumentation)
            .arg("-symbols")
            .arg(self.symbols)
            .arg("-symboltool")
            .arg(&self.helpers.symbol_resolver)
            .arg("-typetool")
            .arg(&self.helpers.type_analyzer)
            .arg("-fifoMonitor")
            .arg(self.monitor_fifo)
            .arg("-fifoWorker")
            .arg(self.worker_fifo)
            .arg("-o")
            .arg(self.fuzz_log)
            .arg("-typesPath")
            .arg(self.types)
            // legacy knob on the instrumentation side, always on
            .arg("-instrRetCB")
            .arg("1")
            .arg("-Verbose")
            .arg(if self.verbose { "1" } else { "0" });
        for library in self.libraries {
            cmd.arg("-libPath").arg(library);
        }
        cmd.arg("--").arg(self.app).args(self.app_args);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_helpers_fail_discovery() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Helpers::discover(dir.path()),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn worker_command_assembly() {
        let helpers = Helpers {
            engine: PathBuf::from("/opt/tk/pintools/pin"),
            instrumentation: PathBuf::from("/opt/tk/instrumentation.so"),
            symbol_extractor: PathBuf::from("/opt/tk/interface-extracter.sh"),
            symbol_extractor_v2: PathBuf::from("/opt/tk/interface-extracter-v2.sh"),
            symbol_resolver: PathBuf::from("/opt/tk/find-symbol-from-mappings.sh"),
            type_analyzer: PathBuf::from("/opt/tk/analyze-type-wrapper.sh"),
            type_all_analyzer: PathBuf::from("/opt/tk/analyze-all-types.sh"),
            static_analyzer: PathBuf::from("/opt/tk/static-analyze-entry-points.py"),
        };
        let libraries = vec![PathBuf::from("/lib/libgs.so.9.55")];
        let app_args = vec!["foo.ps".to_owned(), "foo.pdf".to_owned()];
        let launch = WorkerLaunch {
            helpers: &helpers,
            symbols: Path::new("/tmp/functions.txt"),
            types: Path::new("/tmp/types.txt"),
            monitor_fifo: Path::new("/tmp/monitor.fifo"),
            worker_fifo: Path::new("/tmp/worker.fifo"),
            fuzz_log: Path::new("/tmp/fuzzseq.txt"),
            libraries: &libraries,
            app: Path::new("/usr/bin/convert"),
            app_args: &app_args,
            verbose: false,
        };

        let cmd = launch.command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program().to_string_lossy(), "/opt/tk/pintools/pin");
        assert_eq!(args[0], "-t");
        assert_eq!(args[1], "/opt/tk/instrumentation.so");
        let dashdash = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[dashdash + 1], "/usr/bin/convert");
        assert_eq!(&args[dashdash + 2..], &["foo.ps", "foo.pdf"]);
        let libpath = args.iter().position(|a| a == "-libPath").unwrap();
        assert!(libpath < dashdash);
        assert_eq!(args[libpath + 1], "/lib/libgs.so.9.55");
    }
}
