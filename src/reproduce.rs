//! Deterministic replay of a recorded corpus, and delta-debug minimization
//! of the recorded messages down to a minimal witness.
//!
//! Replay drives a fresh worker while walking a cursor over the reference
//! corpus. Matching events get their recorded replies verbatim (except
//! instrumentation orders, which are re-derived live because callback
//! addresses can move); non-matching events are answered with the plain
//! protocol so the worker keeps progressing.

use std::{collections::BTreeSet, fs, thread, time::Duration};

use crate::{
    corpus::{Corpus, Message},
    error::{Error, Result},
    supervisor::{
        CallPolicy, Supervisor, WORKER_FUZZING_SEQ_LOG, WORKER_MAPPINGS_COPY_PATH,
        WORKER_OUTPUT_PATH,
    },
    wire::{self, Opcode},
};

/// Attempts granted to the initial reproduction of a fresh crash.
pub const REPRODUCE_MAX_RETRIES: u64 = 30;

/// Minimization probes get a multiple of the attempts reproduction took:
/// the bug is already known to reproduce.
pub const MINIMIZE_RETRY_FACTOR: u64 = 3;

/// Pause after a transient system error before the uncounted retry.
const TRANSIENT_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Consecutive transient errors before giving up on the session; they are
/// not counted against the budget, so something must bound them.
const TRANSIENT_ERROR_LIMIT: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReproduceStatus {
    /// The whole reference replayed and the same crash came out.
    Success,
    /// Replay finished, but the crash was absent or a different one.
    Unreproducible,
    /// The worker died before the cursor reached the end of the reference.
    Failure,
    /// A system hiccup unrelated to the target; retried without counting.
    TransientError,
}

impl Supervisor {
    /// One replay attempt against a fresh worker.
    fn replay_run(&mut self, reference: &Corpus) -> ReproduceStatus {
        let ready = self.start_worker_session(false);
        let mut status = if ready {
            self.replay_inner(reference)
        } else {
            ReproduceStatus::TransientError
        };
        self.kill_and_reap_children();

        let termination = self.handle_termination_replay();
        if status == ReproduceStatus::Success {
            status = termination;
        }

        self.cleanup_run_state();
        self.close_worker_pipe();
        status
    }

    fn replay_inner(&mut self, reference: &Corpus) -> ReproduceStatus {
        let mut cursor = 0usize;
        loop {
            if self.quitting() {
                break;
            }
            let done = cursor == reference.len();
            let op = match self.read_worker_opcode() {
                Ok(op) => op,
                Err(e) => {
                    self.handle_read_failure(&e);
                    break;
                }
            };
            self.refresh_maps();

            let step = match op {
                Opcode::LibraryCall | Opcode::CallbackCall => {
                    self.replay_call(op, reference, cursor, done)
                }
                op if op.is_return() => self.replay_return(op, reference, cursor, done),
                other => {
                    // a live worker violating the protocol consumes the
                    // attempt
                    log::warn!(
                        "worker {} is sending garbage [{}] during replay",
                        self.last_worker_pid(),
                        other.to_wire()
                    );
                    return ReproduceStatus::Failure;
                }
            };

            match step {
                Ok(true) => cursor += 1,
                Ok(false) => {}
                Err(e) => {
                    log::debug!("replay step failed: {e}");
                    return ReproduceStatus::TransientError;
                }
            }
        }

        if cursor < reference.len() {
            log::debug!(
                "didn't reproduce, the application took another path? \
                 replayed {cursor}/{} actions",
                reference.len()
            );
            ReproduceStatus::Failure
        } else {
            ReproduceStatus::Success
        }
    }

    /// Drain a call event and, if it matches the cursor, replay its
    /// recorded replies. Returns whether the cursor advances.
    fn replay_call(
        &mut self,
        op: Opcode,
        reference: &Corpus,
        cursor: usize,
        done: bool,
    ) -> Result<bool> {
        let policy = CallPolicy {
            mutate: false,
            // callback addresses may have changed even with randomization
            // off, so instrumentation orders are derived live, not replayed
            instrument: op == Opcode::LibraryCall,
            collect: false,
        };
        self.process_call_body(op, policy)?;

        let matched = !done
            && match (reference.get(cursor), self.corpus.last_event()) {
                (Some((expected, _)), Some(live)) => expected.matches(live),
                _ => false,
            };

        if matched {
            let replies = reference.get(cursor).map(|(_, r)| r.clone()).unwrap_or_default();
            let mut acked = false;
            for message in replies {
                if message.opcode == Opcode::InstrumentOrder {
                    continue;
                }
                acked |= message.opcode == Opcode::ExecAck;
                self.send(message)?;
            }
            // a probe may have shaved off the closer; the protocol still
            // needs one
            if !acked {
                self.send(Message::new(Opcode::ExecAck, &[]))?;
            }
        } else {
            self.send(Message::new(Opcode::ExecAck, &[]))?;
        }
        Ok(matched)
    }

    /// Same for return events; non-matching ones are confirmed with a NOP.
    fn replay_return(
        &mut self,
        op: Opcode,
        reference: &Corpus,
        cursor: usize,
        done: bool,
    ) -> Result<bool> {
        if op.has_retval() {
            let _ = wire::read_word(self.worker_pipe()?)?;
        }

        let matched = !done
            && match (reference.get(cursor), self.corpus.last_event()) {
                (Some((expected, _)), Some(live)) => expected.matches(live),
                _ => false,
            };

        if matched {
            let replies = reference.get(cursor).map(|(_, r)| r.clone()).unwrap_or_default();
            let mut closed = false;
            for message in replies {
                closed |= matches!(message.opcode, Opcode::ReturnOrder | Opcode::Nop);
                self.send(message)?;
            }
            if !closed {
                self.send(Message::new(Opcode::Nop, &[]))?;
            }
        } else {
            self.send(Message::new(Opcode::Nop, &[]))?;
        }
        Ok(matched)
    }

    /// Did this replay run end in the crash we are chasing?
    fn handle_termination_replay(&mut self) -> ReproduceStatus {
        let report = fs::read_to_string(WORKER_OUTPUT_PATH).unwrap_or_default();

        if !self.triage.is_sanitizer_crash(&report) {
            self.console
                .info("Unsuccessful run, didn't get an ASan crash.");
            self.debug_backup();
            return ReproduceStatus::Unreproducible;
        }
        self.debug_backup();

        let expected = self.triage.last_crash_id();
        let got = self.triage.matches_last_crash(&report, &self.maps);
        match (expected, got) {
            (Some(expected_id), Some(got_id)) if expected_id == got_id => {
                let crash_dir = self.artifacts.lookup_crash_dir(expected_id);
                let label = format!("rp{}", self.replay_counter);
                if let Err(e) = self.artifacts.record_run(
                    &crash_dir,
                    &label,
                    std::path::Path::new(WORKER_FUZZING_SEQ_LOG),
                    std::path::Path::new(WORKER_OUTPUT_PATH),
                    std::path::Path::new(WORKER_MAPPINGS_COPY_PATH),
                ) {
                    log::warn!("could not record replay artifacts: {e}");
                }
                ReproduceStatus::Success
            }
            (expected_id, got_id) => {
                let got_str = got_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".to_owned());
                let expected_str = expected_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "none".to_owned());
                self.console.info(format!(
                    "Unsuccessful run, didn't get the right crash ({got_str} != {expected_str})."
                ));
                ReproduceStatus::Unreproducible
            }
        }
    }

    /// Drive fresh workers against `reference` until the crash reproduces,
    /// proves unreproducible, or the budget runs out. Transient errors
    /// pause briefly and do not consume attempts; `Err` aborts the whole
    /// session.
    pub fn reproduce_loop(
        &mut self,
        reference: &Corpus,
        max_tries: u64,
    ) -> Result<ReproduceStatus> {
        self.replay_counter = 0;
        let mut transients = 0u32;
        let mut status = ReproduceStatus::Failure;

        while self.replay_counter < max_tries && status != ReproduceStatus::Success {
            if self.quitting() {
                return Err(Error::ReproduceCritical("interrupted".into()));
            }

            self.corpus.clear();
            self.setup()
                .map_err(|e| Error::ReproduceCritical(e.to_string()))?;
            log::debug!("ready to replay (attempt #{})", self.replay_counter);
            status = self.replay_run(reference);
            self.teardown();

            match status {
                ReproduceStatus::Unreproducible => return Ok(status),
                ReproduceStatus::TransientError => {
                    transients += 1;
                    if transients >= TRANSIENT_ERROR_LIMIT {
                        return Err(Error::ReproduceCritical(
                            "replay keeps failing with system errors".into(),
                        ));
                    }
                    thread::sleep(TRANSIENT_ERROR_PAUSE);
                }
                _ => {
                    transients = 0;
                    self.replay_counter += 1;
                }
            }
        }
        Ok(status)
    }
}

/// Result of a minimization pass.
#[derive(Debug)]
pub enum MinimizeOutcome {
    /// A sufficiency probe reproduced the crash: this is the witness.
    Minimal(Corpus),
    /// No sufficiency probe ever hit; the best-known necessary set.
    Unminimized(Corpus),
}

/// Two-level delta debugging over `(event, message)` coordinates, most
/// recent first (the decisive mutation is usually near the end).
///
/// For each recorded message, two probes: is the crash reproducible with
/// *only* this message on top of those already proven necessary
/// (sufficiency, terminates the search on success)? If not, is it still
/// reproducible *without* the message (necessity)?
///
/// Generic over the reproduce oracle so the schedule itself can be tested
/// without live workers.
pub fn minimize_with<F>(backup: &Corpus, mut reproduce: F) -> Result<MinimizeOutcome>
where
    F: FnMut(&Corpus) -> Result<ReproduceStatus>,
{
    let mut working = backup.clone();
    let mut minimized = backup.empty_shell();

    for event_idx in (0..backup.len()).rev() {
        let messages = backup
            .get(event_idx)
            .map(|(_, m)| m.clone())
            .unwrap_or_default();
        for msg_idx in (0..messages.len()).rev() {
            let message = messages[msg_idx].clone();

            let candidate = minimized.with_message_front(event_idx, message.clone());
            if reproduce(&candidate)? == ReproduceStatus::Success {
                return Ok(MinimizeOutcome::Minimal(candidate));
            }

            // reverse order keeps msg_idx valid in the working copy: only
            // higher indices can have been removed already
            let reduced = working.without_message(event_idx, msg_idx);
            if reproduce(&reduced)? == ReproduceStatus::Success {
                log::debug!("identified an unnecessary action");
                working = reduced;
            } else {
                log::debug!("identified a necessary action");
                minimized = minimized.with_message_front(event_idx, message);
            }
        }
    }
    Ok(MinimizeOutcome::Unminimized(minimized))
}

/// Boundary functions that materially participated in the witness:
/// library-side events whose replies carry more than instrumentation
/// orders and protocol closers. Returns are attributed to the innermost
/// library call.
pub fn critical_endpoints(minimal: &Corpus) -> BTreeSet<String> {
    let mut endpoints = BTreeSet::new();
    let mut current_call = String::new();

    for (event, replies) in minimal.entries() {
        if event.opcode == Opcode::LibraryCall {
            current_call = event.name_str();
        }
        let library_side = matches!(
            event.opcode,
            Opcode::LibraryCall | Opcode::LibraryReturn | Opcode::LibraryReturnNoRetval
        );
        if !library_side || replies.is_empty() || current_call.is_empty() {
            continue;
        }
        let material = replies.iter().any(|m| {
            !matches!(
                m.opcode,
                Opcode::InstrumentOrder | Opcode::ExecAck | Opcode::Nop
            )
        });
        if material {
            endpoints.insert(current_call.clone());
        }
    }
    endpoints
}
