//! Crash triage: parse the sanitizer capture, normalize the stack trace,
//! deduplicate, and decide which side of the boundary actually faulted.
//!
//! The dedup key is the normalized primary trace: frames of the sanitizer
//! runtime dropped, every hex literal replaced by a fixed placeholder. With
//! address-space randomization disabled the key is stable across runs.

use std::collections::BTreeMap;

use regex::Regex;

use crate::{corpus::Corpus, maps::AddressSpace, wire::Opcode};

/// Signature printed when the instrumentation engine itself faults. Such
/// runs tell us nothing about the target and are dropped.
const ENGINE_CRASH_SIGNATURE: &str = "Tool (or Pin) caused signal 11";

/// Exit code the instrumentation uses for its own internal errors.
pub const ENGINE_ERREXIT_CODE: i32 = 66;

/// Fixed placeholder for hex literals. Deliberately free of lowercase hex
/// digits so normalization is idempotent.
const ADDR_PLACEHOLDER: &str = "0xADDR";

/// What a worker death amounted to.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub crash_id: u32,
    pub duplicate: bool,
    pub false_positive: bool,
    pub normalized_trace: String,
    pub fault_location: String,
}

#[derive(Debug)]
pub struct Triage {
    frame_re: Regex,
    addr_re: Regex,
    hex_re: Regex,
    /// Normalized trace per crash id, the dedup map.
    traces: BTreeMap<u32, String>,
    /// Capability tags already registered per crash id.
    impacts: BTreeMap<u32, Vec<String>>,
    next_crash_id: u32,
}

impl Default for Triage {
    fn default() -> Self {
        Self::new()
    }
}

impl Triage {
    pub fn new() -> Self {
        Self {
            frame_re: Regex::new(r"^\s+#\d+ 0x").unwrap(),
            addr_re: Regex::new(r"^\s+#\d+ 0x([0-9a-f]+)").unwrap(),
            hex_re: Regex::new(r"0x[0-9a-f]+").unwrap(),
            traces: BTreeMap::new(),
            impacts: BTreeMap::new(),
            next_crash_id: 0,
        }
    }

    pub fn is_engine_crash(report: &str) -> bool {
        report.contains(ENGINE_CRASH_SIGNATURE)
    }

    /// A variety of heuristics to detect sanitizer reports.
    pub fn is_sanitizer_crash(&self, report: &str) -> bool {
        report.contains("AddressSanitizer:DEADLYSIGNAL")
            || report.contains("ERROR: AddressSanitizer:")
            || !self.extract_trace(report).is_empty()
    }

    /// All stack frame lines of the report, in order.
    pub fn extract_trace(&self, report: &str) -> String {
        let mut trace = String::new();
        for line in report.lines() {
            if self.frame_re.is_match(line) {
                trace.push_str(line);
                trace.push('\n');
            }
        }
        trace
    }

    /// The dedup key: primary trace only, sanitizer-runtime frames dropped,
    /// hex literals replaced. Idempotent.
    pub fn normalize(&self, trace: &str, maps: &AddressSpace) -> String {
        let first = keep_first_trace(trace);
        let stripped = self.strip_sanitizer_frames(&first, maps);
        self.hex_re.replace_all(&stripped, ADDR_PLACEHOLDER).into_owned()
    }

    /// The sanitizer picks different detectors depending on the faulty
    /// address, prepending frames of its own runtime. Those frames vary
    /// between otherwise identical crashes, so drop them.
    fn strip_sanitizer_frames(&self, trace: &str, maps: &AddressSpace) -> String {
        let mut out = String::new();
        for line in trace.lines() {
            let in_sanitizer = self
                .frame_addr(line)
                .and_then(|addr| maps.owner_of(addr))
                .is_some_and(|owner| owner.contains("asan"));
            if !in_sanitizer {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    fn frame_addr(&self, line: &str) -> Option<u64> {
        let caps = self.addr_re.captures(line)?;
        u64::from_str_radix(&caps[1], 16).ok()
    }

    /// Classify a sanitizer crash: dedupe it and run the false-positive
    /// filter. Allocates a crash id on first sight.
    pub fn classify_sanitizer(
        &mut self,
        report: &str,
        maps: &AddressSpace,
        corpus: &Corpus,
        safebox: bool,
    ) -> Verdict {
        let trace = self.extract_trace(report);
        let normalized = self.normalize(&trace, maps);

        let known = self
            .traces
            .iter()
            .find(|(_, t)| **t == normalized)
            .map(|(id, _)| *id);

        let (crash_id, duplicate) = match known {
            Some(id) => (id, true),
            None => {
                let id = self.next_crash_id;
                self.next_crash_id += 1;
                self.traces.insert(id, normalized.clone());
                (id, false)
            }
        };

        let (false_positive, fault_location) =
            self.false_positive(report, maps, corpus, safebox);

        Verdict {
            crash_id,
            duplicate,
            false_positive,
            normalized_trace: normalized,
            fault_location,
        }
    }

    /// A SIGSEGV without a sanitizer report still counts as a crash, but
    /// there is no trace to dedupe or filter.
    pub fn allocate_raw_id(&mut self) -> u32 {
        let id = self.next_crash_id;
        self.next_crash_id += 1;
        id
    }

    /// Id of the most recently discovered crash, the one reproduce runs
    /// compare against.
    pub fn last_crash_id(&self) -> Option<u32> {
        self.next_crash_id.checked_sub(1)
    }

    /// Does this replay run's report reproduce the last discovered crash?
    pub fn matches_last_crash(&self, report: &str, maps: &AddressSpace) -> Option<u32> {
        let normalized = self.normalize(&self.extract_trace(report), maps);
        self.traces
            .iter()
            .find(|(_, t)| **t == normalized)
            .map(|(id, _)| *id)
    }

    /// Walk the stack top-down, skipping standard-library frames. The first
    /// frame with a definite owner decides: in sandbox mode a frame inside
    /// the instrumented library means the attacker crashed itself (false
    /// positive); in safebox mode the polarity is reversed. Traces that
    /// never leave the standard library fall back to the last recorded
    /// event.
    fn false_positive(
        &self,
        report: &str,
        maps: &AddressSpace,
        corpus: &Corpus,
        safebox: bool,
    ) -> (bool, String) {
        let mut location = String::new();

        for line in self.extract_trace(report).lines() {
            let Some(addr) = self.frame_addr(line) else {
                continue;
            };
            if let Some(owner) = maps.owner_of(addr) {
                location = owner.to_owned();
            }

            if maps.is_lib_code(addr) {
                return (!safebox, location);
            }
            if !maps.is_stdlib_code(addr) {
                return (safebox, location);
            }
        }

        // No decisive frame, usually PC corruption. Use the last thing we
        // knew: which side was executing when the worker died?
        let fp = match corpus.last_real_opcode() {
            Some(op) if safebox => op == Opcode::LibraryCall || op.is_return(),
            Some(op) => op.is_return(),
            None => false,
        };
        (fp, location)
    }

    /// Scan the report for capability markers and register the strongest
    /// one for this crash. Returns the tag when it is new for the crash.
    pub fn impact_tag(
        &mut self,
        crash_id: u32,
        report: &str,
        trace_empty: bool,
    ) -> Option<String> {
        let mut exec = trace_empty;
        let mut alloc_corruption = false;
        let mut null_deref = false;
        let mut write = false;
        let mut read = false;
        let mut arbitrary = false;
        let mut negative_size = false;

        for line in report.lines() {
            if line.contains("negative-size-param") {
                negative_size = true;
            }
            if line.contains("caused by a READ memory access") || line.contains("READ of size") {
                read = true;
            }
            if line.contains("__interceptor_memcpy") && negative_size {
                write = true;
            }
            if line.contains("stack-overflow on address")
                || line.contains("caused by a WRITE memory access")
                || line.contains("WRITE of size")
            {
                write = true;
            }
            if line.contains("pc points to the zero page")
                || line.contains("Hint: PC is at a non-executable region")
            {
                exec = true;
            }
            if line.contains("AddressSanitizer: requested allocation size")
                || line.contains("attempting free on address which was not malloc()-ed")
            {
                alloc_corruption = true;
            }
            if line.contains("address points to the zero page")
                || line.contains("on unknown address 0x000000000000 ")
            {
                null_deref = true;
            }
            if line.contains("caused by a dereference of a high value address") {
                arbitrary = true;
            }
        }

        let cap = if exec {
            "cap_exec"
        } else if alloc_corruption {
            "cap_corrupt_allocator"
        } else if null_deref {
            "cap_null_deref"
        } else if write {
            "cap_write"
        } else if read {
            "cap_read"
        } else {
            return None;
        };

        let mut tag = cap.to_owned();
        if arbitrary {
            tag.push_str("_arbitrary");
        }

        let tags = self.impacts.entry(crash_id).or_default();
        if tags.contains(&tag) {
            return None;
        }
        tags.push(tag.clone());
        Some(tag)
    }
}

/// A report may contain several traces: the faulting one first, then
/// allocation traces for the memory involved. Keep only the first.
fn keep_first_trace(trace: &str) -> String {
    let mut out = String::new();
    for (i, line) in trace.lines().enumerate() {
        if i > 0 && line.trim_start().starts_with("#0 ") {
            break;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const MAPS: &str = "\
555555554000-555555556000 r--p 00000000 08:01 1001 /usr/bin/convert
555555556000-555555560000 r-xp 00002000 08:01 1001 /usr/bin/convert
7f0000000000-7f0000010000 r-xp 00000000 08:01 2002 /usr/lib/libgs.so.9.55
7f0000100000-7f0000180000 r-xp 00000000 08:01 3003 /usr/lib/libc-2.31.so
7f0000200000-7f0000280000 r-xp 00000000 08:01 4004 /usr/lib/libasan.so.6
55555a000000-55555a100000 rw-p 00000000 00:00 0 [heap]
7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0 [stack]
";

    fn oracle() -> AddressSpace {
        AddressSpace::from_snapshot(&[PathBuf::from("/usr/lib/libgs.so.9.55")], MAPS).unwrap()
    }

    fn report(frames: &[u64]) -> String {
        let mut report = String::from(
            "==77==ERROR: AddressSanitizer: heap-buffer-overflow on address \
             0x602000000018 at pc 0x7f0000000123 bp 0x7ffc sp 0x7ffb\n\
             WRITE of size 8 at 0x602000000018 thread T0\n",
        );
        for (i, addr) in frames.iter().enumerate() {
            report.push_str(&format!("    #{i} 0x{addr:012x} in frame_{i} /src/x.c:{i}\n"));
        }
        report
    }

    #[test]
    fn normalization_is_idempotent() {
        let triage = Triage::new();
        let maps = oracle();
        let trace = triage.extract_trace(&report(&[0x555555556123, 0x7f0000100200]));
        let once = triage.normalize(&trace, &maps);
        assert_eq!(triage.normalize(&once, &maps), once);
        assert!(!once.contains("0x5555"));
    }

    #[test]
    fn address_differences_dedupe_to_one_crash() {
        let mut triage = Triage::new();
        let maps = oracle();
        let corpus = Corpus::new();
        let a = triage.classify_sanitizer(&report(&[0x555555556123]), &maps, &corpus, false);
        let b = triage.classify_sanitizer(&report(&[0x555555556200]), &maps, &corpus, false);
        assert!(!a.duplicate);
        assert!(b.duplicate);
        assert_eq!(a.crash_id, b.crash_id);

        // a genuinely different trace gets a fresh id
        let c = triage.classify_sanitizer(
            &report(&[0x555555556123, 0x555555556200]),
            &maps,
            &corpus,
            false,
        );
        assert!(!c.duplicate);
        assert_ne!(c.crash_id, a.crash_id);
    }

    #[test]
    fn only_the_primary_trace_is_kept() {
        let triage = Triage::new();
        let maps = oracle();
        let two_traces = "    #0 0x555555556123 in main /src/a.c:1\n\
                              #1 0x555555556200 in start /src/a.c:2\n\
                              #0 0x7f0000100300 in malloc\n\
                              #1 0x7f0000100400 in __libc_start_main\n";
        let normalized = triage.normalize(two_traces, &maps);
        assert!(normalized.contains("main"));
        assert!(!normalized.contains("malloc"));
    }

    #[test]
    fn sanitizer_runtime_frames_are_dropped() {
        let triage = Triage::new();
        let maps = oracle();
        let trace = "    #0 0x7f0000200100 in __asan_report_store8\n\
                     #1 0x555555556123 in main /src/a.c:1\n";
        let normalized = triage.normalize(trace, &maps);
        assert!(!normalized.contains("__asan_report_store8"));
        assert!(normalized.contains("main"));
    }

    #[test]
    fn false_positive_polarity() {
        let mut triage = Triage::new();
        let maps = oracle();
        let corpus = Corpus::new();

        // first decisive frame inside the instrumented library
        let in_lib = report(&[0x7f0000000123, 0x555555556123]);
        // first decisive frame in the application
        let in_app = report(&[0x555555556123, 0x7f0000000123]);

        let v = triage.classify_sanitizer(&in_lib, &maps, &corpus, false);
        assert!(v.false_positive, "sandbox: crash in attacker library");
        assert_eq!(v.fault_location, "/usr/lib/libgs.so.9.55");

        let v = triage.classify_sanitizer(&in_app, &maps, &corpus, false);
        assert!(!v.false_positive, "sandbox: crash in victim application");

        let v = triage.classify_sanitizer(&in_lib, &maps, &corpus, true);
        assert!(!v.false_positive, "safebox: crash in victim library");

        let v = triage.classify_sanitizer(&in_app, &maps, &corpus, true);
        assert!(v.false_positive, "safebox: crash in attacker application");
    }

    #[test]
    fn stdlib_frames_are_skipped_not_decisive() {
        let mut triage = Triage::new();
        let maps = oracle();
        let corpus = Corpus::new();
        // libc frame first, then the application
        let v = triage.classify_sanitizer(
            &report(&[0x7f0000100200, 0x555555556123]),
            &maps,
            &corpus,
            false,
        );
        assert!(!v.false_positive);
        assert_eq!(v.fault_location, "/usr/bin/convert");
    }

    #[test]
    fn all_stdlib_trace_falls_back_to_last_event() {
        let mut triage = Triage::new();
        let maps = oracle();

        let mut corpus = Corpus::new();
        corpus.begin_event(Opcode::LibraryReturn);
        corpus.begin_event(Opcode::Invalid);

        let stdlib_only = report(&[0x7f0000100200, 0x7f0000100300]);
        let v = triage.classify_sanitizer(&stdlib_only, &maps, &corpus, false);
        assert!(v.false_positive, "sandbox: died right after a library return");

        let mut corpus = Corpus::new();
        corpus.begin_event(Opcode::CallbackCall);
        let v = triage.classify_sanitizer(&stdlib_only, &maps, &corpus, false);
        assert!(!v.false_positive, "sandbox: callback was running");

        let mut corpus = Corpus::new();
        corpus.begin_event(Opcode::LibraryCall);
        let v = triage.classify_sanitizer(&stdlib_only, &maps, &corpus, true);
        assert!(v.false_positive, "safebox: library was running");
    }

    #[test]
    fn impact_priority_and_arbitrary_suffix() {
        let mut triage = Triage::new();
        let report = "READ of size 4 at 0x1 thread T0\n\
                      WRITE of size 8 at 0x2 thread T0\n";
        assert_eq!(triage.impact_tag(0, report, false).as_deref(), Some("cap_write"));
        // registering again is silent
        assert_eq!(triage.impact_tag(0, report, false), None);

        let arb = "caused by a READ memory access\n\
                   caused by a dereference of a high value address\n";
        assert_eq!(
            triage.impact_tag(1, arb, false).as_deref(),
            Some("cap_read_arbitrary")
        );

        // an empty trace means the PC itself went wild
        assert_eq!(triage.impact_tag(2, "", true).as_deref(), Some("cap_exec"));

        let memcpy = "negative-size-param found\n\
                      #0 0x1 in __interceptor_memcpy\n";
        assert_eq!(
            triage.impact_tag(3, memcpy, false).as_deref(),
            Some("cap_write")
        );
    }

    #[test]
    fn engine_crashes_are_recognized() {
        assert!(Triage::is_engine_crash(
            "C: Tool (or Pin) caused signal 11 at PC 0x123\n"
        ));
        assert!(!Triage::is_engine_crash("SEGV on unknown address"));
    }
}
