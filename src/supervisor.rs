//! The supervisor: spawns instrumented workers, drives the wire protocol,
//! and implements the mode-specific fuzzing strategy.
//!
//! One `Supervisor` value carries all session state (oracle, RNG, corpus,
//! dedup maps, artifact paths) and is threaded through the outer loop. The
//! protocol is strictly request/reply: every monitor message answering a
//! worker event is flushed before the next opcode is read.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use nix::{
    sys::{
        signal::{kill, Signal},
        stat::Mode as FifoMode,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{mkfifo, Pid},
};

use crate::{
    artifacts::{Artifacts, CrashCategory},
    corpus::{Corpus, Message},
    error::{Error, Result},
    extract::{self, Helpers, WorkerLaunch},
    maps::AddressSpace,
    mutator::Mutator,
    triage::{Triage, ENGINE_ERREXIT_CODE},
    ui::{self, Console},
    wire::{self, Opcode, ARG_COUNT_LIMIT},
};

// Scratch files of the live session. Transient; the per-run evidence is
// copied under the crash root by triage.
pub const MONITOR_FIFO_PATH: &str = "/tmp/boxfuzz_monitor.fifo";
pub const WORKER_FIFO_PATH: &str = "/tmp/boxfuzz_worker.fifo";
pub const WORKER_OUTPUT_PATH: &str = "/tmp/boxfuzz_child_out.txt";
pub const WORKER_OUTPUT_PATH_OLD: &str = "/tmp/boxfuzz_child_out.txt.old";
pub const WORKER_FUZZING_SEQ_LOG: &str = "/tmp/boxfuzz_child_fuzzseq.txt";
pub const WORKER_MAPPINGS_COPY_PATH: &str = "/tmp/boxfuzz_child_mappings.txt";
pub const SYMBOLS_FILE_PATH: &str = "/tmp/boxfuzz_functions.txt";
pub const TYPES_FILE_PATH: &str = "/tmp/boxfuzz_types.txt";

/// Keep the sanitizer's output shape deterministic across runs.
const ASAN_OPTIONS: &str = "detect_leaks=0 detect_odr_violation=0";

/// At most this many scattered writes through one remembered pointer. More
/// writes make crashes slower to minimize, which gets expensive.
const MAX_BUFFER_WRITES: u64 = 3;

/// Sanity cap on function-name frames; anything longer is corruption.
const MAX_FUNCTION_NAME_LEN: u64 = 4096;

/// Which side of the boundary is hostile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The library attacks the application: mutate callback inputs and
    /// library returns, write through returned pointers.
    Sandbox,
    /// The application attacks the library: mutate library arguments and
    /// callback return values.
    Safebox,
}

#[derive(Debug)]
pub struct Config {
    pub mode: Mode,
    pub libraries: Vec<PathBuf>,
    pub app: PathBuf,
    pub app_args: Vec<String>,
    pub workload: Option<PathBuf>,
    pub worker_timeout: Duration,
    pub seed: u64,
    pub iterations: Option<u64>,
    pub crash_root: PathBuf,
    pub minimize_false_positives: bool,
    pub static_estimate: bool,
    pub debug: bool,
    pub heavy_debug: bool,
    pub colour: bool,
}

/// What one fuzzing run amounted to, as seen by the outer loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunOutcome {
    /// A new non-duplicate, non-false-positive sanitizer crash.
    pub new_unique_crash: bool,
    /// The recorded corpus should go through reproduce + minimize.
    pub wants_reproduction: bool,
    pub crash_id: Option<u32>,
}

/// How the arguments of a call crossing are treated in the current mode.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallPolicy {
    pub mutate: bool,
    pub instrument: bool,
    pub collect: bool,
}

pub struct Supervisor {
    pub cfg: Config,
    pub helpers: Helpers,
    pub console: Console,
    pub mutator: Mutator,
    pub maps: AddressSpace,
    pub triage: Triage,
    pub corpus: Corpus,
    pub artifacts: Artifacts,

    /// Callback addresses already ordered instrumented, per worker.
    known_callbacks: HashSet<u64>,
    /// Call-site IPs seen this run; the max across runs is a coverage proxy.
    known_call_sites: HashSet<u64>,
    pub(crate) max_call_sites: usize,
    pub(crate) observed_api: BTreeSet<String>,
    pub(crate) critical_api: BTreeSet<String>,
    /// Non-code pointer arguments of the current library call, with their
    /// object sizes, for shared-buffer writes at return time.
    current_pointers: BTreeMap<u64, u64>,

    monitor_pipe: Option<File>,
    worker_pipe: Option<File>,
    worker: Option<Child>,
    workload: Option<Child>,
    worker_status: Option<WaitStatus>,
    last_worker_pid: i32,

    /// How many fuzzing runs actually started (handshake included).
    pub run_counter: u64,
    /// Counted attempts of the current reproduce loop.
    pub(crate) replay_counter: u64,

    static_estimate_done: bool,
    quitting: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(cfg: Config, helpers: Helpers) -> Self {
        let maps = AddressSpace::new(&cfg.libraries, PathBuf::from(WORKER_MAPPINGS_COPY_PATH));
        let mutator = Mutator::new(cfg.seed);
        let artifacts = Artifacts::new(cfg.crash_root.clone(), cfg.minimize_false_positives);
        let console = Console::new(cfg.colour);
        Self {
            mutator,
            maps,
            triage: Triage::new(),
            corpus: Corpus::new(),
            artifacts,
            console,
            helpers,
            known_callbacks: HashSet::new(),
            known_call_sites: HashSet::new(),
            max_call_sites: 0,
            observed_api: BTreeSet::new(),
            critical_api: BTreeSet::new(),
            current_pointers: BTreeMap::new(),
            monitor_pipe: None,
            worker_pipe: None,
            worker: None,
            workload: None,
            worker_status: None,
            last_worker_pid: -1,
            run_counter: 0,
            replay_counter: 0,
            static_estimate_done: false,
            quitting: Arc::new(AtomicBool::new(false)),
            cfg,
        }
    }

    /// Flag checked at every loop boundary; registered on SIGINT by the
    /// binary so the session can finalize without further pipe I/O.
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quitting)
    }

    pub fn quitting(&self) -> bool {
        self.quitting.load(Ordering::Relaxed)
    }

    pub fn iterations_exhausted(&self) -> bool {
        self.cfg
            .iterations
            .is_some_and(|cap| self.run_counter >= cap)
    }

    // ======================================================================
    // Pipe lifecycle
    // ======================================================================

    /// Fresh FIFOs for every run so no stale frames survive a dead worker.
    /// The monitor FIFO is opened read-write: writes then never block while
    /// the worker is still starting up.
    pub fn setup(&mut self) -> Result<()> {
        let _ = fs::remove_file(MONITOR_FIFO_PATH);
        let _ = fs::remove_file(WORKER_FIFO_PATH);
        mkfifo(MONITOR_FIFO_PATH, FifoMode::from_bits_truncate(0o666))?;
        mkfifo(WORKER_FIFO_PATH, FifoMode::from_bits_truncate(0o666))?;

        let monitor = OpenOptions::new()
            .read(true)
            .write(true)
            .open(MONITOR_FIFO_PATH)?;
        self.monitor_pipe = Some(monitor);
        Ok(())
    }

    pub fn teardown(&mut self) {
        self.monitor_pipe = None;
    }

    /// Remove the FIFOs from disk at the end of the session.
    pub fn remove_fifos(&self) {
        let _ = fs::remove_file(MONITOR_FIFO_PATH);
        let _ = fs::remove_file(WORKER_FIFO_PATH);
    }

    fn monitor_pipe(&mut self) -> Result<&mut File> {
        self.monitor_pipe.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "monitor pipe is not open",
            ))
        })
    }

    pub(crate) fn worker_pipe(&mut self) -> Result<&mut File> {
        self.worker_pipe.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "worker pipe is not open",
            ))
        })
    }

    pub(crate) fn close_worker_pipe(&mut self) {
        self.worker_pipe = None;
    }

    pub(crate) fn last_worker_pid(&self) -> i32 {
        self.last_worker_pid
    }

    // ======================================================================
    // Worker lifecycle
    // ======================================================================

    fn spawn_worker(&mut self) -> Result<()> {
        // truncate the capture on every run; it doubles as the sanitizer
        // report source for triage
        let capture = File::create(WORKER_OUTPUT_PATH)?;

        let launch = WorkerLaunch {
            helpers: &self.helpers,
            symbols: Path::new(SYMBOLS_FILE_PATH),
            types: Path::new(TYPES_FILE_PATH),
            monitor_fifo: Path::new(MONITOR_FIFO_PATH),
            worker_fifo: Path::new(WORKER_FIFO_PATH),
            fuzz_log: Path::new(WORKER_FUZZING_SEQ_LOG),
            libraries: &self.cfg.libraries,
            app: &self.cfg.app,
            app_args: &self.cfg.app_args,
            verbose: self.cfg.heavy_debug,
        };
        let mut cmd = launch.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(capture.try_clone()?))
            .stderr(Stdio::from(capture))
            .env("ASAN_OPTIONS", ASAN_OPTIONS);

        let child = cmd.spawn()?;
        self.last_worker_pid = child.id() as i32;
        self.worker = Some(child);
        self.worker_status = None;
        Ok(())
    }

    /// Blocks until the worker opens its end of the FIFO write-only.
    fn open_worker_pipe(&mut self) -> Result<()> {
        self.worker_pipe = Some(OpenOptions::new().read(true).open(WORKER_FIFO_PATH)?);
        Ok(())
    }

    fn spawn_workload(&mut self) -> Result<()> {
        let Some(path) = &self.cfg.workload else {
            return Ok(());
        };
        let child = Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        self.workload = Some(child);
        Ok(())
    }

    /// Spawn the worker, open the pipe, shake hands, start the workload.
    /// Failures are survivable: the iteration is simply discarded.
    pub(crate) fn start_worker_session(&mut self, announce: bool) -> bool {
        if let Err(e) = self.spawn_worker() {
            self.console.error(format!("Failed to spawn application: {e}"));
            return false;
        }
        if let Err(e) = self.open_worker_pipe() {
            self.console.error(format!("Failed to open worker FIFO: {e}"));
            return false;
        }
        if let Err(e) = self.handshake(announce) {
            if announce {
                self.console
                    .error(format!("Failed handshake with worker {}: {e}", self.last_worker_pid));
            }
            return false;
        }
        if self.cfg.workload.is_some() {
            if announce {
                self.console.info("Starting workload script...");
            }
            if let Err(e) = self.spawn_workload() {
                self.console.error(format!("Failed to spawn workload script: {e}"));
                return false;
            }
        }
        true
    }

    /// Expect `WORKER_UP`, answer with a raw `MONITOR_UP_ACK`.
    fn handshake(&mut self, announce: bool) -> Result<()> {
        let timeout = self.cfg.worker_timeout;
        let op = wire::read_opcode(self.worker_pipe()?, Some(timeout));
        self.corpus
            .begin_event(*op.as_ref().unwrap_or(&Opcode::Invalid));

        match op {
            Ok(Opcode::WorkerUp) => {
                wire::write_frame(self.monitor_pipe()?, Some(Opcode::MonitorUpAck), &[])?;
                if announce {
                    self.console.info(format!(
                        "Communication established with worker {}",
                        self.last_worker_pid
                    ));
                }
                Ok(())
            }
            Ok(other) => Err(Error::WorkerGarbage(other.to_wire() as u64)),
            Err(e) => Err(e),
        }
    }

    /// SIGKILL whatever is left and collect the worker's exit status if we
    /// do not have it yet.
    pub(crate) fn kill_and_reap_children(&mut self) {
        if let Some(child) = self.worker.take() {
            let pid = Pid::from_raw(child.id() as i32);
            let _ = kill(pid, Signal::SIGKILL);
            if self.worker_status.is_none() {
                match waitpid(pid, None) {
                    Ok(status) => self.worker_status = Some(status),
                    Err(e) => log::debug!("waitpid on worker failed: {e}"),
                }
            }
        }
        if let Some(mut workload) = self.workload.take() {
            let _ = kill(Pid::from_raw(workload.id() as i32), Signal::SIGKILL);
            let _ = workload.wait();
        }
    }

    // ======================================================================
    // Protocol plumbing
    // ======================================================================

    /// Read the next worker event, logging it into the corpus. A failed
    /// read records the invalid marker so triage can see where the run
    /// ended.
    pub(crate) fn read_worker_opcode(&mut self) -> Result<Opcode> {
        let timeout = self.cfg.worker_timeout;
        match wire::read_opcode(self.worker_pipe()?, Some(timeout)) {
            Ok(op) => {
                self.corpus.begin_event(op);
                Ok(op)
            }
            Err(e) => {
                self.corpus.begin_event(Opcode::Invalid);
                Err(e)
            }
        }
    }

    /// Record the reply in the corpus, then put it on the wire.
    pub(crate) fn send(&mut self, message: Message) -> Result<()> {
        self.corpus.record(message.clone());
        wire::write_encoded(self.monitor_pipe()?, message.opcode, &message.payload)
    }

    /// Keep the oracle in sync with the worker; on the first usable view,
    /// seed the interesting-pointer pool.
    pub(crate) fn refresh_maps(&mut self) {
        let pid = self.last_worker_pid;
        if pid <= 0 {
            return;
        }
        match self.maps.refresh(pid) {
            Ok(true) if !self.mutator.pointers_populated() => {
                self.mutator.populate_pointers(&self.maps.interesting_bases());
                log::debug!(
                    "determined worker mappings, process base {:#x}",
                    self.maps.base()
                );
                if self.cfg.static_estimate && !self.static_estimate_done {
                    self.static_estimate_done = true;
                    self.run_static_estimate();
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("maps refresh failed: {e}"),
        }
    }

    fn run_static_estimate(&mut self) {
        self.console
            .info("Statically determining API call sites... This can be very slow.");
        let estimate = extract::static_endpoint_estimate(
            &self.helpers,
            &self.maps,
            Path::new(SYMBOLS_FILE_PATH),
        );
        for line in [
            format!("Statically detected call sites: {}", estimate.call_sites),
            format!(
                "Statically detected called API endpoints: {}",
                estimate.endpoints
            ),
            format!(
                "Statically detected caller components: {}",
                estimate.components
            ),
        ] {
            if let Err(e) = self.artifacts.append_session_info(&line) {
                log::warn!("could not record static estimate: {e}");
            }
        }
        self.console.info(format!(
            "Done! {} entry points detected ({} caller components).",
            estimate.call_sites, estimate.components
        ));
    }

    /// Consume the length-prefixed function name of a call crossing and
    /// attach it to the current corpus event.
    pub(crate) fn read_function_name(&mut self) -> Result<()> {
        let len = wire::read_word(self.worker_pipe()?)?;
        if len > MAX_FUNCTION_NAME_LEN {
            return Err(Error::WorkerGarbage(len));
        }
        let name = wire::read_bytes(self.worker_pipe()?, len as usize)?;
        self.observed_api
            .insert(String::from_utf8_lossy(&name).into_owned());
        self.corpus.set_event_name(&name);
        Ok(())
    }

    pub(crate) fn call_policy(&self, op: Opcode) -> CallPolicy {
        match (self.cfg.mode, op) {
            // the library's arguments are genuine, but remember its buffers
            // and hook any callback it is being handed
            (Mode::Sandbox, Opcode::LibraryCall) => CallPolicy {
                mutate: false,
                instrument: true,
                collect: true,
            },
            // callback inputs come from the attacker
            (Mode::Sandbox, _) => CallPolicy {
                mutate: true,
                instrument: false,
                collect: false,
            },
            // the application is hostile towards the library
            (Mode::Safebox, Opcode::LibraryCall) => CallPolicy {
                mutate: true,
                instrument: true,
                collect: false,
            },
            (Mode::Safebox, _) => CallPolicy {
                mutate: false,
                instrument: false,
                collect: false,
            },
        }
    }

    /// Drain and process one `*_CALL` event: call site, function name, then
    /// the argument list. Ends with the exec ack.
    pub(crate) fn process_call(&mut self, op: Opcode, policy: CallPolicy) -> Result<()> {
        self.process_call_body(op, policy)?;
        self.send(Message::new(Opcode::ExecAck, &[]))
    }

    /// The call processing without the closing ack; replay closes the reply
    /// itself, from the recorded messages.
    pub(crate) fn process_call_body(&mut self, op: Opcode, policy: CallPolicy) -> Result<()> {
        let call_site = wire::read_word(self.worker_pipe()?)?;
        if op == Opcode::LibraryCall && self.known_call_sites.insert(call_site) {
            log::debug!("discovered new call site {call_site:#x}");
        }

        self.read_function_name()?;

        let argc = wire::read_word(self.worker_pipe()?)?;
        if argc > ARG_COUNT_LIMIT {
            return Err(Error::WorkerGarbage(argc));
        }

        for i in 0..argc {
            let size = wire::read_word(self.worker_pipe()?)?;
            let value = wire::read_word(self.worker_pipe()?)?;

            if policy.collect && self.maps.is_non_code_pointer(value) {
                self.current_pointers.insert(value, size);
            } else if policy.instrument
                && self.maps.is_code(value)
                && !self.known_callbacks.contains(&value)
            {
                self.send(Message::new(Opcode::InstrumentOrder, &[value]))?;
                log::debug!(
                    "instrumenting newly found callback {value:#x} in worker {}",
                    self.last_worker_pid
                );
                self.known_callbacks.insert(value);
            }

            if policy.mutate {
                let is_pointer = self.maps.is_pointer(value);
                let mutated = self.mutator.mutate(value, is_pointer);
                if mutated != value {
                    self.send(Message::new(Opcode::WriteArgOrder, &[i, mutated]))?;
                    log::debug!("messing with arg #{i} ({value:#x} -> {mutated:#x})");
                }
            }
        }

        Ok(())
    }

    /// Library return in sandbox mode: scatter writes through the buffers
    /// remembered at call time, then maybe swap the return value.
    fn on_library_return_sandbox(&mut self, op: Opcode) -> Result<()> {
        let retval = if op.has_retval() {
            wire::read_word(self.worker_pipe()?)?
        } else {
            0
        };

        let pointers: Vec<(u64, u64)> = self
            .current_pointers
            .iter()
            .map(|(p, s)| (*p, *s))
            .collect();
        for (pointer, buf_size) in pointers {
            if buf_size == 0 {
                continue;
            }
            if !self.mutator.should_mutate() {
                continue;
            }

            let max_size = buf_size.min(8);
            // enough room that the distinct-offset draw below terminates
            let max_writes = 1 + buf_size - max_size;
            let num_writes = self.mutator.range(1, MAX_BUFFER_WRITES.min(max_writes));

            let mut offsets: Vec<u64> = Vec::new();
            for _ in 0..num_writes {
                let value = self.mutator.mutate(0, false);
                // not always "as much as you can": small writes can trigger
                // subtler faults than full-width ones
                let size = self.mutator.range(1, max_size);
                let mut offset = self.mutator.range(0, buf_size - size);
                while offsets.contains(&offset) {
                    offset = self.mutator.range(0, buf_size - size);
                }
                offsets.push(offset);

                self.send(Message::new(
                    Opcode::WriteOrder,
                    &[pointer + offset, size, value],
                ))?;
                log::debug!(
                    "messing with shared memory of worker {} at {pointer:#x} + {offset} \
                     (-> {value:#x}, size {size} / {buf_size})",
                    self.last_worker_pid
                );
            }
        }
        self.current_pointers.clear();

        if op.has_retval() {
            let mutated = self.mutator.mutate(retval, self.maps.is_pointer(retval));
            if mutated != retval {
                log::debug!("library return {retval:#x} -> {mutated:#x}");
                return self.send(Message::new(Opcode::ReturnOrder, &[mutated]));
            }
        }
        self.send(Message::new(Opcode::Nop, &[]))
    }

    /// A return crossing the current mode does not touch: drain the value,
    /// confirm with a NOP.
    fn on_passive_return(&mut self, op: Opcode) -> Result<()> {
        if op.has_retval() {
            let _ = wire::read_word(self.worker_pipe()?)?;
        }
        self.send(Message::new(Opcode::Nop, &[]))
    }

    /// Callback return in safebox mode: the application answers the library
    /// with whatever we make up.
    fn on_callback_return_safebox(&mut self, op: Opcode) -> Result<()> {
        if op.has_retval() {
            let retval = wire::read_word(self.worker_pipe()?)?;
            let mutated = self.mutator.mutate(retval, self.maps.is_pointer(retval));
            if mutated != retval {
                log::debug!("callback return {retval:#x} -> {mutated:#x}");
                return self.send(Message::new(Opcode::ReturnOrder, &[mutated]));
            }
        }
        self.send(Message::new(Opcode::Nop, &[]))
    }

    // ======================================================================
    // The fuzzing loop proper
    // ======================================================================

    fn inner_loop(&mut self) {
        loop {
            if self.quitting() {
                break;
            }
            let op = match self.read_worker_opcode() {
                Ok(op) => op,
                Err(e) => {
                    self.handle_read_failure(&e);
                    break;
                }
            };

            // keep the oracle as fresh as possible; cheap when unchanged
            self.refresh_maps();

            let result = match op {
                Opcode::LibraryCall | Opcode::CallbackCall => {
                    log::debug!("got {op:?} signal from worker {}", self.last_worker_pid);
                    let policy = self.call_policy(op);
                    self.process_call(op, policy)
                }
                Opcode::LibraryReturn | Opcode::LibraryReturnNoRetval => {
                    log::debug!("got library return signal from worker {}", self.last_worker_pid);
                    match self.cfg.mode {
                        Mode::Sandbox => self.on_library_return_sandbox(op),
                        Mode::Safebox => self.on_passive_return(op),
                    }
                }
                Opcode::CallbackReturn | Opcode::CallbackReturnNoRetval => {
                    log::debug!("got callback return signal from worker {}", self.last_worker_pid);
                    match self.cfg.mode {
                        Mode::Sandbox => self.on_passive_return(op),
                        Mode::Safebox => self.on_callback_return_safebox(op),
                    }
                }
                other => {
                    self.console.error(format!(
                        "Worker {} is sending garbage [{}]",
                        self.last_worker_pid,
                        other.to_wire()
                    ));
                    break;
                }
            };

            if let Err(e) = result {
                log::warn!("protocol handling failed: {e}");
                break;
            }
        }
    }

    /// The opcode read failed: either the worker is dying (fine, triage
    /// picks it up from the exit status) or the pipe broke under a live
    /// worker, which deserves a complaint.
    pub(crate) fn handle_read_failure(&mut self, error: &Error) {
        if let Error::PipeTimeout(secs) = error {
            self.console.error(format!(
                "Timeout reached reading FIFO after {secs}s; \
                 this might be the cause of future errors"
            ));
        } else {
            log::debug!("reading worker FIFO failed: {error}");
        }

        // let the child die properly before probing it
        thread::sleep(Duration::from_secs(1));

        let pid = self.last_worker_pid;
        if pid <= 0 {
            return;
        }
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                self.console.error(format!(
                    "Read from worker {pid} FIFO failed unexpectedly ({error})"
                ));
            }
            Ok(status) => self.worker_status = Some(status),
            Err(_) => {
                // already reaped, or never ours to begin with
            }
        }
    }

    /// One full fuzzing iteration against a fresh worker. Returns what the
    /// outer loop needs to decide on reproduction.
    pub fn fuzzing_run(&mut self) -> Result<RunOutcome> {
        self.run_counter += 1;
        self.console
            .highlight(ui::BOLD, format!("Run #{}", self.run_counter));

        let ready = self.start_worker_session(true);
        if ready {
            log::debug!("in the fuzzing loop");
            self.inner_loop();
        }
        self.kill_and_reap_children();

        let outcome = if ready {
            self.handle_termination()?
        } else {
            log::debug!("failed iteration, ignore");
            // we didn't even manage to run it, don't count it
            self.run_counter -= 1;
            RunOutcome::default()
        };

        self.cleanup_run_state();
        self.close_worker_pipe();
        Ok(outcome)
    }

    /// Write the end-of-session accounting into `session_info.txt`.
    pub fn finalize_session(&self) -> Result<()> {
        self.artifacts.finalize_session(
            self.max_call_sites.max(self.known_call_sites.len()),
            self.observed_api.len(),
            &self.critical_api,
        )
    }

    /// Per-worker state does not survive the worker.
    pub(crate) fn cleanup_run_state(&mut self) {
        self.mutator.begin_run();
        self.known_callbacks.clear();
        self.max_call_sites = self.max_call_sites.max(self.known_call_sites.len());
        self.known_call_sites.clear();
        self.current_pointers.clear();
    }

    // ======================================================================
    // Termination analysis
    // ======================================================================

    /// Analyze the worker's exit and the sanitizer capture.
    fn handle_termination(&mut self) -> Result<RunOutcome> {
        let report = fs::read_to_string(WORKER_OUTPUT_PATH).unwrap_or_default();
        let status = self.worker_status;

        let exited_code = match status {
            Some(WaitStatus::Exited(_, code)) => Some(code),
            _ => None,
        };
        let killed_sig = match status {
            Some(WaitStatus::Signaled(_, sig, _)) => Some(sig),
            _ => None,
        };

        let sanitizer_crash = exited_code.is_some() && self.triage.is_sanitizer_crash(&report);
        let engine_crash = killed_sig.is_some() && Triage::is_engine_crash(&report);
        let segv_crash = killed_sig == Some(Signal::SIGSEGV) && !engine_crash;

        let mut engine_bug = false;
        let desc = if sanitizer_crash {
            "ASan crash".to_owned()
        } else if let Some(code) = exited_code {
            if code == ENGINE_ERREXIT_CODE {
                engine_bug = true;
                format!("exited, code {code} = instrumentation bug")
            } else {
                format!("exited, code {code}")
            }
        } else if engine_crash {
            "instrumentation crash".to_owned()
        } else if segv_crash {
            "killed, SIGSEGV".to_owned()
        } else if let Some(sig) = killed_sig {
            format!("killed, signal {sig}")
        } else {
            "unknown?".to_owned()
        };
        self.console.info(format!(
            "Death of worker {} detected ({desc})",
            self.last_worker_pid
        ));

        if engine_bug && self.cfg.heavy_debug {
            return Err(Error::Precondition(
                "instrumentation bug detected, aborting".into(),
            ));
        }

        self.debug_backup();

        if sanitizer_crash {
            self.handle_crash(true, &report)
        } else if segv_crash {
            self.handle_crash(false, &report)
        } else {
            Ok(RunOutcome::default())
        }
    }

    fn handle_crash(&mut self, sanitizer: bool, report: &str) -> Result<RunOutcome> {
        let raw_trace_empty = self.triage.extract_trace(report).is_empty();

        let verdict = if sanitizer {
            Some(self.triage.classify_sanitizer(
                report,
                &self.maps,
                &self.corpus,
                self.cfg.mode == Mode::Safebox,
            ))
        } else {
            None
        };

        let (crash_id, duplicate, false_positive) = match &verdict {
            Some(v) => (v.crash_id, v.duplicate, v.false_positive),
            // no trace, so no dedup and no false-positive filter
            None => (self.triage.allocate_raw_id(), false, false),
        };

        let category = if false_positive {
            CrashCategory::FalsePositive
        } else if sanitizer {
            CrashCategory::Sanitizer
        } else {
            CrashCategory::NonSanitizer
        };
        let crash_dir = self.artifacts.crash_dir(category, crash_id)?;

        if let Some(verdict) = &verdict {
            if !duplicate {
                self.artifacts
                    .write_trace(&crash_dir, &verdict.normalized_trace)?;
                self.artifacts
                    .write_crash_info(&crash_dir, &verdict.fault_location)?;
            }
            if let Some(tag) = self.triage.impact_tag(crash_id, report, raw_trace_empty) {
                log::debug!("vulnerability has {tag} capability");
                self.artifacts.append_crash_info(&crash_dir, &tag)?;
            }
        }

        self.artifacts.record_run(
            &crash_dir,
            &format!("run{}", self.run_counter),
            Path::new(WORKER_FUZZING_SEQ_LOG),
            Path::new(WORKER_OUTPUT_PATH),
            Path::new(WORKER_MAPPINGS_COPY_PATH),
        )?;

        let mut outcome = RunOutcome {
            crash_id: Some(crash_id),
            ..Default::default()
        };
        if !duplicate {
            if !false_positive {
                self.console.highlight(
                    ui::BLUE,
                    "New interesting crash (non-duplicate, non-false-positive) detected.",
                );
            } else {
                log::debug!("new false positive detected");
            }
            if sanitizer && !false_positive {
                outcome.new_unique_crash = true;
                outcome.wants_reproduction = true;
            } else if sanitizer && self.cfg.minimize_false_positives {
                outcome.wants_reproduction = true;
            }
        }
        Ok(outcome)
    }

    pub(crate) fn debug_backup(&self) {
        if self.cfg.debug {
            let _ = fs::remove_file(WORKER_OUTPUT_PATH_OLD);
            let _ = fs::copy(WORKER_OUTPUT_PATH, WORKER_OUTPUT_PATH_OLD);
        }
        if self.cfg.heavy_debug {
            if let Ok(log) = fs::read_to_string(WORKER_FUZZING_SEQ_LOG) {
                self.console.info("Fuzzer logs for this run:");
                for line in log.lines() {
                    println!("    {line}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom};

    use super::*;

    const MAPS: &str = "\
555555554000-555555556000 r--p 00000000 08:01 1001 /usr/bin/convert
555555556000-555555560000 r-xp 00002000 08:01 1001 /usr/bin/convert
7f0000000000-7f0000010000 r-xp 00000000 08:01 2002 /usr/lib/libgs.so.9.55
55555a000000-55555a100000 rw-p 00000000 00:00 0 [heap]
7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0 [stack]
";

    const HEAP_PTR: u64 = 0x55555a000100;
    const CODE_PTR: u64 = 0x7f0000000800;

    fn helpers() -> Helpers {
        Helpers {
            engine: PathBuf::from("/opt/tk/pintools/pin"),
            instrumentation: PathBuf::from("/opt/tk/instrumentation.so"),
            symbol_extractor: PathBuf::from("/opt/tk/interface-extracter.sh"),
            symbol_extractor_v2: PathBuf::from("/opt/tk/interface-extracter-v2.sh"),
            symbol_resolver: PathBuf::from("/opt/tk/find-symbol-from-mappings.sh"),
            type_analyzer: PathBuf::from("/opt/tk/analyze-type-wrapper.sh"),
            type_all_analyzer: PathBuf::from("/opt/tk/analyze-all-types.sh"),
            static_analyzer: PathBuf::from("/opt/tk/static-analyze-entry-points.py"),
        }
    }

    fn supervisor(mode: Mode, seed: u64) -> Supervisor {
        let cfg = Config {
            mode,
            libraries: vec![PathBuf::from("/usr/lib/libgs.so.9.55")],
            app: PathBuf::from("/usr/bin/convert"),
            app_args: vec![],
            workload: None,
            worker_timeout: Duration::from_secs(1),
            seed,
            iterations: None,
            crash_root: std::env::temp_dir(),
            minimize_false_positives: false,
            static_estimate: false,
            debug: false,
            heavy_debug: false,
            colour: false,
        };
        let mut sup = Supervisor::new(cfg, helpers());
        sup.maps =
            AddressSpace::from_snapshot(&[PathBuf::from("/usr/lib/libgs.so.9.55")], MAPS).unwrap();
        sup.mutator.populate_pointers(&sup.maps.interesting_bases());
        sup
    }

    /// Pre-encode a call event payload (everything after the opcode) into
    /// the fake worker pipe.
    fn feed_call(sup: &mut Supervisor, name: &[u8], args: &[(u64, u64)]) {
        let mut pipe = tempfile::tempfile().unwrap();
        let mut words = vec![0x1000u64, name.len() as u64];
        wire::write_frame(&mut pipe, None, &words).unwrap();
        use std::io::Write as _;
        pipe.write_all(name).unwrap();
        words = vec![args.len() as u64];
        for (size, value) in args {
            words.push(*size);
            words.push(*value);
        }
        wire::write_frame(&mut pipe, None, &words).unwrap();
        pipe.seek(SeekFrom::Start(0)).unwrap();
        sup.worker_pipe = Some(pipe);
    }

    fn feed_return(sup: &mut Supervisor, retval: Option<u64>) {
        let mut pipe = tempfile::tempfile().unwrap();
        if let Some(retval) = retval {
            wire::write_frame(&mut pipe, None, &[retval]).unwrap();
        }
        pipe.seek(SeekFrom::Start(0)).unwrap();
        sup.worker_pipe = Some(pipe);
    }

    fn attach_reply_sink(sup: &mut Supervisor) {
        sup.monitor_pipe = Some(tempfile::tempfile().unwrap());
    }

    /// Decode everything the supervisor wrote to the monitor pipe.
    fn drain_replies(sup: &mut Supervisor) -> Vec<(Opcode, Vec<u64>)> {
        let mut pipe = sup.monitor_pipe.take().unwrap();
        pipe.seek(SeekFrom::Start(0)).unwrap();
        let mut replies = Vec::new();
        loop {
            let op = match wire::read_opcode(&mut pipe, None) {
                Ok(op) => op,
                Err(Error::PipePeerClosed) => break,
                Err(e) => panic!("undecodable reply stream: {e}"),
            };
            let arity = match op {
                Opcode::InstrumentOrder | Opcode::ReturnOrder => 1,
                Opcode::WriteArgOrder => 2,
                Opcode::WriteOrder => 3,
                _ => 0,
            };
            replies.push((op, wire::read_words(&mut pipe, arity).unwrap()));
        }
        replies
    }

    #[test]
    fn callback_call_reply_is_writeargs_then_single_ack() {
        // arguments of a callback are attacker-controlled in sandbox mode;
        // across seeds the reply is always orders-then-ack
        let mut saw_mutation = false;
        for seed in 0..50 {
            let mut sup = supervisor(Mode::Sandbox, seed);
            feed_call(&mut sup, b"cb", &[(8, 42)]);
            attach_reply_sink(&mut sup);
            sup.corpus.begin_event(Opcode::CallbackCall);

            let policy = sup.call_policy(Opcode::CallbackCall);
            sup.process_call(Opcode::CallbackCall, policy).unwrap();

            let replies = drain_replies(&mut sup);
            assert_eq!(replies.last().unwrap().0, Opcode::ExecAck);
            assert_eq!(
                replies.iter().filter(|(op, _)| *op == Opcode::ExecAck).count(),
                1
            );
            for (op, words) in &replies[..replies.len() - 1] {
                assert_eq!(*op, Opcode::WriteArgOrder);
                assert_eq!(words[0], 0, "only argument 0 exists");
                assert_ne!(words[1], 42, "a mutation must change the value");
                saw_mutation = true;
            }
        }
        assert!(saw_mutation, "no seed out of 50 ever mutated");
    }

    #[test]
    fn library_call_collects_pointers_and_return_scatters_writes() {
        let mut saw_write = false;
        for seed in 0..50 {
            let mut sup = supervisor(Mode::Sandbox, seed);

            feed_call(&mut sup, b"gsapi_run_string", &[(16, HEAP_PTR)]);
            attach_reply_sink(&mut sup);
            sup.corpus.begin_event(Opcode::LibraryCall);
            let policy = sup.call_policy(Opcode::LibraryCall);
            sup.process_call(Opcode::LibraryCall, policy).unwrap();

            // sandbox never mutates library arguments
            let replies = drain_replies(&mut sup);
            assert_eq!(replies, vec![(Opcode::ExecAck, vec![])]);
            assert_eq!(sup.current_pointers.get(&HEAP_PTR), Some(&16));

            feed_return(&mut sup, Some(0));
            attach_reply_sink(&mut sup);
            sup.corpus.begin_event(Opcode::LibraryReturn);
            sup.on_library_return_sandbox(Opcode::LibraryReturn).unwrap();

            let replies = drain_replies(&mut sup);
            let (closer, _) = replies.last().unwrap();
            assert!(matches!(closer, Opcode::ReturnOrder | Opcode::Nop));
            for (op, words) in &replies[..replies.len() - 1] {
                assert_eq!(*op, Opcode::WriteOrder);
                let (addr, size) = (words[0], words[1]);
                assert!((1..=8).contains(&size));
                assert!(addr >= HEAP_PTR && addr + size <= HEAP_PTR + 16);
                saw_write = true;
            }
            // the pointer set never outlives the return
            assert!(sup.current_pointers.is_empty());
        }
        assert!(saw_write, "no seed out of 50 ever wrote through the buffer");
    }

    #[test]
    fn callback_pointers_are_instrumented_exactly_once() {
        let mut sup = supervisor(Mode::Sandbox, 7);

        feed_call(&mut sup, b"gsapi_set_poll", &[(8, CODE_PTR)]);
        attach_reply_sink(&mut sup);
        sup.corpus.begin_event(Opcode::LibraryCall);
        let policy = sup.call_policy(Opcode::LibraryCall);
        sup.process_call(Opcode::LibraryCall, policy).unwrap();

        let replies = drain_replies(&mut sup);
        assert_eq!(
            replies,
            vec![
                (Opcode::InstrumentOrder, vec![CODE_PTR]),
                (Opcode::ExecAck, vec![]),
            ]
        );

        // the same address again: no second order
        feed_call(&mut sup, b"gsapi_set_poll", &[(8, CODE_PTR)]);
        attach_reply_sink(&mut sup);
        sup.corpus.begin_event(Opcode::LibraryCall);
        let policy = sup.call_policy(Opcode::LibraryCall);
        sup.process_call(Opcode::LibraryCall, policy).unwrap();
        assert_eq!(drain_replies(&mut sup), vec![(Opcode::ExecAck, vec![])]);

        // a fresh worker starts over
        sup.cleanup_run_state();
        feed_call(&mut sup, b"gsapi_set_poll", &[(8, CODE_PTR)]);
        attach_reply_sink(&mut sup);
        sup.corpus.begin_event(Opcode::LibraryCall);
        let policy = sup.call_policy(Opcode::LibraryCall);
        sup.process_call(Opcode::LibraryCall, policy).unwrap();
        assert_eq!(
            drain_replies(&mut sup).first().unwrap().0,
            Opcode::InstrumentOrder
        );
    }

    #[test]
    fn safebox_flips_the_mutation_polarity() {
        let mut mutated_arg = false;
        let mut mutated_ret = false;
        for seed in 0..50 {
            let mut sup = supervisor(Mode::Safebox, seed);

            // library arguments are hostile now
            feed_call(&mut sup, b"gsapi_run_string", &[(8, 42)]);
            attach_reply_sink(&mut sup);
            sup.corpus.begin_event(Opcode::LibraryCall);
            let policy = sup.call_policy(Opcode::LibraryCall);
            sup.process_call(Opcode::LibraryCall, policy).unwrap();
            mutated_arg |= drain_replies(&mut sup)
                .iter()
                .any(|(op, _)| *op == Opcode::WriteArgOrder);

            // library returns are trusted
            feed_return(&mut sup, Some(0xabc));
            attach_reply_sink(&mut sup);
            sup.corpus.begin_event(Opcode::LibraryReturn);
            sup.on_passive_return(Opcode::LibraryReturn).unwrap();
            assert_eq!(drain_replies(&mut sup), vec![(Opcode::Nop, vec![])]);

            // callback returns are hostile
            feed_return(&mut sup, Some(0xdef));
            attach_reply_sink(&mut sup);
            sup.corpus.begin_event(Opcode::CallbackReturn);
            sup.on_callback_return_safebox(Opcode::CallbackReturn).unwrap();
            let replies = drain_replies(&mut sup);
            match replies.as_slice() {
                [(Opcode::Nop, _)] => {}
                [(Opcode::ReturnOrder, words)] => {
                    assert_ne!(words[0], 0xdef);
                    mutated_ret = true;
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
        assert!(mutated_arg, "no seed mutated a library argument");
        assert!(mutated_ret, "no seed mutated a callback return");
    }

    #[test]
    fn oversized_argc_is_garbage() {
        let mut sup = supervisor(Mode::Sandbox, 1);
        let mut pipe = tempfile::tempfile().unwrap();
        wire::write_frame(&mut pipe, None, &[0x1000, 2]).unwrap();
        use std::io::Write as _;
        pipe.write_all(b"fn").unwrap();
        wire::write_frame(&mut pipe, None, &[ARG_COUNT_LIMIT + 1]).unwrap();
        pipe.seek(SeekFrom::Start(0)).unwrap();
        sup.worker_pipe = Some(pipe);
        attach_reply_sink(&mut sup);
        sup.corpus.begin_event(Opcode::LibraryCall);

        let policy = sup.call_policy(Opcode::LibraryCall);
        assert!(matches!(
            sup.process_call(Opcode::LibraryCall, policy),
            Err(Error::WorkerGarbage(_))
        ));
    }
}

