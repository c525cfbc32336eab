//! On-disk layout of a fuzzing session.
//!
//! Under the crash-output root:
//!
//! ```text
//! crashes/session_info.txt
//! crashes/instrumented_functions.txt
//! crashes/bugs/crashN/{crash_trace.txt, crash_info.txt, runM/, rpK/, minimal/}
//! crashes/bugs-non-ASan/...        (signal crashes without a report)
//! crashes/false-positives/...      (attacker crashed itself)
//! ```
//!
//! Only the supervisor writes here.

use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::Local;

use crate::{
    corpus::Corpus,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashCategory {
    Sanitizer,
    NonSanitizer,
    FalsePositive,
}

impl CrashCategory {
    fn dir_name(self) -> &'static str {
        match self {
            CrashCategory::Sanitizer => "bugs",
            CrashCategory::NonSanitizer => "bugs-non-ASan",
            CrashCategory::FalsePositive => "false-positives",
        }
    }
}

#[derive(Debug)]
pub struct Artifacts {
    root: PathBuf,
    minimize_false_positives: bool,
}

impl Artifacts {
    pub fn new(root: PathBuf, minimize_false_positives: bool) -> Self {
        Self {
            root,
            minimize_false_positives,
        }
    }

    fn crashes_dir(&self) -> PathBuf {
        self.root.join("crashes")
    }

    fn session_info_path(&self) -> PathBuf {
        self.crashes_dir().join("session_info.txt")
    }

    /// Create the session tree. A leftover `crashes/` directory from an
    /// earlier session must be moved away first, so runs never mix.
    pub fn init(&self, seed: u64) -> Result<()> {
        if !self.root.is_dir() {
            return Err(Error::Precondition(format!(
                "could not find crash folder base path: {}",
                self.root.display()
            )));
        }
        let crashes = self.crashes_dir();
        if crashes.is_dir() {
            return Err(Error::Precondition(format!(
                "crash directory already exists at {}; remove it and restart",
                crashes.display()
            )));
        }
        fs::create_dir_all(&crashes)?;

        let mut info = File::create(self.session_info_path())?;
        writeln!(info, "Fuzzing seed: {seed}")?;
        writeln!(
            info,
            "Starting time: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;
        Ok(())
    }

    pub fn append_session_info(&self, text: &str) -> Result<()> {
        let mut info = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_info_path())?;
        writeln!(info, "{text}")?;
        Ok(())
    }

    /// Keep a copy of the instrumented symbol list with the session.
    pub fn backup_instrumented_functions(&self, symbols: &Path) -> Result<()> {
        copy_if_exists(symbols, &self.crashes_dir().join("instrumented_functions.txt"))?;
        Ok(())
    }

    /// Directory of a crash in its category, created on first use.
    pub fn crash_dir(&self, category: CrashCategory, crash_id: u32) -> Result<PathBuf> {
        let dir = self
            .crashes_dir()
            .join(category.dir_name())
            .join(format!("crash{crash_id}"));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Where reproduce/minimize artifacts for `crash_id` live. Normally
    /// under `bugs/`; with false-positive minimization enabled, a crash
    /// missing there is looked up in `false-positives/`.
    pub fn lookup_crash_dir(&self, crash_id: u32) -> PathBuf {
        let bugs = self
            .crashes_dir()
            .join("bugs")
            .join(format!("crash{crash_id}"));
        if !bugs.is_dir() && self.minimize_false_positives {
            let fp = self
                .crashes_dir()
                .join("false-positives")
                .join(format!("crash{crash_id}"));
            if fp.is_dir() {
                return fp;
            }
        }
        bugs
    }

    /// Save the normalized trace, even though it is also in the app log.
    pub fn write_trace(&self, crash_dir: &Path, normalized: &str) -> Result<()> {
        fs::write(crash_dir.join("crash_trace.txt"), normalized)?;
        Ok(())
    }

    pub fn write_crash_info(&self, crash_dir: &Path, fault_location: &str) -> Result<()> {
        let location = if fault_location.is_empty() {
            "unknown (wild jump?)"
        } else {
            fault_location
        };
        fs::write(
            crash_dir.join("crash_info.txt"),
            format!("fault_location {location}\n"),
        )?;
        Ok(())
    }

    pub fn append_crash_info(&self, crash_dir: &Path, line: &str) -> Result<()> {
        let mut info = OpenOptions::new()
            .create(true)
            .append(true)
            .open(crash_dir.join("crash_info.txt"))?;
        writeln!(info, "{line}")?;
        Ok(())
    }

    /// Collect the per-run evidence: fuzzing event log, sanitizer capture,
    /// and the worker's mappings. Sources the worker never wrote are
    /// skipped.
    pub fn record_run(
        &self,
        crash_dir: &Path,
        label: &str,
        seq_log: &Path,
        capture: &Path,
        maps_copy: &Path,
    ) -> Result<PathBuf> {
        let run_dir = crash_dir.join(label);
        fs::create_dir_all(&run_dir)?;

        // not a rename: /tmp and the crash root may be different devices
        copy_if_exists(seq_log, &run_dir.join("input.log"))?;
        let _ = fs::remove_file(seq_log);

        copy_if_exists(capture, &run_dir.join("app.log"))?;
        copy_if_exists(maps_copy, &run_dir.join("mappings.txt"))?;
        Ok(run_dir)
    }

    /// The fuzzing run that discovered the crash already is the minimal
    /// witness; copy its artifacts over.
    pub fn promote_run_to_minimal(&self, crash_dir: &Path, label: &str) -> Result<()> {
        copy_dir_recursive(&crash_dir.join(label), &crash_dir.join("minimal"))?;
        Ok(())
    }

    /// The last successful replay carried the minimal witness.
    pub fn promote_replay_to_minimal(&self, crash_dir: &Path, label: &str) -> Result<()> {
        fs::rename(crash_dir.join(label), crash_dir.join("minimal"))?;
        Ok(())
    }

    /// Drop the replay scratch dirs (`rpK/`) of a crash.
    pub fn clean_replay_runs(&self, crash_dir: &Path) -> Result<()> {
        if !crash_dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(crash_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("rp") && entry.path().is_dir() {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    /// Persist the minimal witness itself next to its artifacts.
    pub fn write_minimal_corpus(&self, crash_dir: &Path, corpus: &Corpus) -> Result<()> {
        let minimal = crash_dir.join("minimal");
        fs::create_dir_all(&minimal)?;
        let file = File::create(minimal.join("corpus.cbor"))?;
        ciborium::into_writer(corpus, file)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        Ok(())
    }

    /// Final session accounting. A no-op if the session never initialized.
    pub fn finalize_session(
        &self,
        max_call_sites: usize,
        observed_endpoints: usize,
        critical_endpoints: &BTreeSet<String>,
    ) -> Result<()> {
        if !self.session_info_path().exists() {
            return Ok(());
        }
        let mut info = OpenOptions::new()
            .append(true)
            .open(self.session_info_path())?;
        writeln!(info, "Max number of call sites reached in a run: {max_call_sites}")?;
        writeln!(info, "Number of API endpoints reached: {observed_endpoints}")?;
        writeln!(
            info,
            "Number of API endpoints that are vulnerability vectors: {}",
            critical_endpoints.len()
        )?;
        if !critical_endpoints.is_empty() {
            writeln!(info, "List of these endpoints:")?;
            for endpoint in critical_endpoints {
                writeln!(info, "  [api] {endpoint}")?;
            }
        }
        writeln!(
            info,
            "Ending time: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;
        Ok(())
    }
}

fn copy_if_exists(from: &Path, to: &Path) -> Result<()> {
    match fs::copy(from, to) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (tempfile::TempDir, Artifacts) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path().to_path_buf(), false);
        artifacts.init(1234).unwrap();
        (dir, artifacts)
    }

    #[test]
    fn init_writes_session_header_and_refuses_rerun() {
        let (_dir, artifacts) = session();
        let info = fs::read_to_string(artifacts.session_info_path()).unwrap();
        assert!(info.contains("Fuzzing seed: 1234"));
        assert!(info.contains("Starting time: "));

        assert!(matches!(
            artifacts.init(1234),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn crash_tree_layout() {
        let (_dir, artifacts) = session();
        let bug = artifacts.crash_dir(CrashCategory::Sanitizer, 0).unwrap();
        let fp = artifacts.crash_dir(CrashCategory::FalsePositive, 1).unwrap();
        assert!(bug.ends_with("crashes/bugs/crash0"));
        assert!(fp.ends_with("crashes/false-positives/crash1"));
        assert_eq!(artifacts.lookup_crash_dir(0), bug);
    }

    #[test]
    fn run_recording_and_minimal_promotion() {
        let (dir, artifacts) = session();
        let crash = artifacts.crash_dir(CrashCategory::Sanitizer, 0).unwrap();

        let seq = dir.path().join("seq.txt");
        let capture = dir.path().join("out.txt");
        fs::write(&seq, "fuzz sequence").unwrap();
        fs::write(&capture, "asan report").unwrap();

        let run = artifacts
            .record_run(&crash, "run1", &seq, &capture, dir.path().join("nope").as_path())
            .unwrap();
        assert_eq!(
            fs::read_to_string(run.join("input.log")).unwrap(),
            "fuzz sequence"
        );
        assert_eq!(
            fs::read_to_string(run.join("app.log")).unwrap(),
            "asan report"
        );
        // the sequence log is consumed
        assert!(!seq.exists());
        // a missing mappings copy is not an error
        assert!(!run.join("mappings.txt").exists());

        artifacts.promote_run_to_minimal(&crash, "run1").unwrap();
        assert!(crash.join("minimal/app.log").exists());
    }

    #[test]
    fn replay_dirs_are_cleaned_and_promoted() {
        let (dir, artifacts) = session();
        let crash = artifacts.crash_dir(CrashCategory::Sanitizer, 0).unwrap();
        let capture = dir.path().join("out.txt");
        fs::write(&capture, "report").unwrap();

        for label in ["rp0", "rp1"] {
            artifacts
                .record_run(
                    &crash,
                    label,
                    dir.path().join("none").as_path(),
                    &capture,
                    dir.path().join("none").as_path(),
                )
                .unwrap();
        }
        artifacts.promote_replay_to_minimal(&crash, "rp1").unwrap();
        assert!(crash.join("minimal/app.log").exists());
        assert!(!crash.join("rp1").exists());

        artifacts.clean_replay_runs(&crash).unwrap();
        assert!(!crash.join("rp0").exists());
        assert!(crash.join("minimal").exists());
    }

    #[test]
    fn session_finalization_lists_critical_endpoints() {
        let (_dir, artifacts) = session();
        let critical: BTreeSet<String> =
            ["gsapi_run_string".to_owned(), "gsapi_init".to_owned()].into();
        artifacts.finalize_session(17, 42, &critical).unwrap();
        let info = fs::read_to_string(artifacts.session_info_path()).unwrap();
        assert!(info.contains("Max number of call sites reached in a run: 17"));
        assert!(info.contains("  [api] gsapi_init"));
        assert!(info.contains("Ending time: "));
    }
}
