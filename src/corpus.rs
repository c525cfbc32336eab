//! The recorded trace of one fuzzing run.
//!
//! Every worker event and every monitor reply is appended here in order,
//! from the first post-handshake crossing to the worker's death. Triage
//! consults the tail, the reproducer replays a stripped copy, and the
//! minimizer shrinks it message by message. The supervisor owns the live
//! corpus; reproduce and minimize always work on copies.

use serde::{Deserialize, Serialize};

use crate::wire::{self, Opcode};

/// One monitor -> worker write: the opcode plus the encoded word tail,
/// kept as raw bytes so replay can resend it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: Opcode, words: &[u64]) -> Self {
        Self {
            opcode,
            payload: wire::encode_words(words),
        }
    }

    pub fn words(&self) -> Vec<u64> {
        wire::decode_words(&self.payload)
    }
}

/// One worker event. For call crossings `name` holds the unmangled or
/// linkage-name bytes of the function, the equality key during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub opcode: Opcode,
    pub name: Vec<u8>,
}

impl Event {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            name: Vec::new(),
        }
    }

    /// The replay cursor advances only over matching events: equal opcodes,
    /// and for call crossings an equal function name.
    pub fn matches(&self, other: &Event) -> bool {
        if self.opcode != other.opcode {
            return false;
        }
        if self.opcode.is_call() {
            return self.name == other.name;
        }
        true
    }

    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Ordered sequence of `(event, replies)` entries for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Corpus {
    entries: Vec<(Event, Vec<Message>)>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, idx: usize) -> Option<&(Event, Vec<Message>)> {
        self.entries.get(idx)
    }

    pub fn entries(&self) -> impl Iterator<Item = &(Event, Vec<Message>)> {
        self.entries.iter()
    }

    /// Open a new entry for a worker event; replies recorded from now on
    /// belong to it.
    pub fn begin_event(&mut self, opcode: Opcode) {
        self.entries.push((Event::new(opcode), Vec::new()));
    }

    /// Attach the function name to the current event (call crossings only).
    pub fn set_event_name(&mut self, name: &[u8]) {
        if let Some((event, _)) = self.entries.last_mut() {
            event.name = name.to_vec();
        }
    }

    /// Record one monitor reply under the current event.
    pub fn record(&mut self, message: Message) {
        if let Some((_, replies)) = self.entries.last_mut() {
            replies.push(message);
        }
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.entries.last().map(|(event, _)| event)
    }

    /// The opcode of the last event that is not the trailing read-failure
    /// marker. Triage falls back to this when a crash has no stack trace.
    pub fn last_real_opcode(&self) -> Option<Opcode> {
        self.entries
            .iter()
            .rev()
            .map(|(event, _)| event.opcode)
            .find(|op| *op != Opcode::Invalid)
    }

    /// Turn a recorded run into a reference corpus: drop the leading
    /// `WORKER_UP` event and a trailing `INVALID_OPCODE` marker if present.
    pub fn strip_for_replay(&mut self) {
        if self
            .entries
            .first()
            .is_some_and(|(event, _)| event.opcode == Opcode::WorkerUp)
        {
            self.entries.remove(0);
        }
        if self
            .entries
            .last()
            .is_some_and(|(event, _)| event.opcode == Opcode::Invalid)
        {
            self.entries.pop();
        }
    }

    /// Total number of recorded replies across all events.
    pub fn message_count(&self) -> usize {
        self.entries.iter().map(|(_, replies)| replies.len()).sum()
    }

    /// Same event sequence, every reply list empty. The minimizer grows its
    /// witness from this shell.
    pub fn empty_shell(&self) -> Corpus {
        Corpus {
            entries: self
                .entries
                .iter()
                .map(|(event, _)| (event.clone(), Vec::new()))
                .collect(),
        }
    }

    /// Copy with `message` pushed to the front of event `event_idx`'s reply
    /// list.
    pub fn with_message_front(&self, event_idx: usize, message: Message) -> Corpus {
        let mut copy = self.clone();
        copy.entries[event_idx].1.insert(0, message);
        copy
    }

    /// Copy with reply `msg_idx` of event `event_idx` removed.
    pub fn without_message(&self, event_idx: usize, msg_idx: usize) -> Corpus {
        let mut copy = self.clone();
        copy.entries[event_idx].1.remove(msg_idx);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Corpus {
        let mut corpus = Corpus::new();
        corpus.begin_event(Opcode::WorkerUp);
        corpus.begin_event(Opcode::LibraryCall);
        corpus.set_event_name(b"png_read_info");
        corpus.record(Message::new(Opcode::InstrumentOrder, &[0x4000]));
        corpus.record(Message::new(Opcode::ExecAck, &[]));
        corpus.begin_event(Opcode::LibraryReturn);
        corpus.record(Message::new(Opcode::WriteOrder, &[0x7000, 4, 0xdeadbeef]));
        corpus.record(Message::new(Opcode::ReturnOrder, &[0]));
        corpus.begin_event(Opcode::Invalid);
        corpus
    }

    #[test]
    fn strip_removes_handshake_and_failure_marker() {
        let mut corpus = sample();
        corpus.strip_for_replay();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.get(0).unwrap().0.opcode, Opcode::LibraryCall);
        assert_eq!(corpus.get(1).unwrap().0.opcode, Opcode::LibraryReturn);
    }

    #[test]
    fn last_real_opcode_skips_failure_marker() {
        let corpus = sample();
        assert_eq!(corpus.last_real_opcode(), Some(Opcode::LibraryReturn));
    }

    #[test]
    fn call_events_match_on_name() {
        let mut a = Event::new(Opcode::LibraryCall);
        a.name = b"png_read_info".to_vec();
        let mut b = a.clone();
        assert!(a.matches(&b));
        b.name = b"png_destroy".to_vec();
        assert!(!a.matches(&b));

        // returns carry no name and match on the opcode alone
        let r1 = Event::new(Opcode::LibraryReturn);
        let r2 = Event::new(Opcode::LibraryReturn);
        assert!(r1.matches(&r2));
        assert!(!r1.matches(&Event::new(Opcode::CallbackReturn)));
    }

    #[test]
    fn reply_ordering_invariant_holds_in_recorded_corpus() {
        let mut corpus = sample();
        corpus.strip_for_replay();
        for (event, replies) in corpus.entries() {
            if event.opcode.is_call() {
                assert_eq!(replies.last().unwrap().opcode, Opcode::ExecAck);
                assert_eq!(
                    replies
                        .iter()
                        .filter(|m| m.opcode == Opcode::ExecAck)
                        .count(),
                    1
                );
            }
            if event.opcode.is_return() {
                let closer = replies.last().unwrap().opcode;
                assert!(matches!(closer, Opcode::ReturnOrder | Opcode::Nop));
            }
        }
    }

    #[test]
    fn message_surgery() {
        let mut corpus = sample();
        corpus.strip_for_replay();
        assert_eq!(corpus.message_count(), 4);

        let shell = corpus.empty_shell();
        assert_eq!(shell.len(), corpus.len());
        assert_eq!(shell.message_count(), 0);

        let msg = Message::new(Opcode::WriteArgOrder, &[0, 35]);
        let grown = shell.with_message_front(1, msg.clone());
        assert_eq!(grown.get(1).unwrap().1[0], msg);

        let shrunk = corpus.without_message(1, 0);
        assert_eq!(shrunk.message_count(), 3);
        assert_eq!(shrunk.get(1).unwrap().1[0].opcode, Opcode::ReturnOrder);
        // the original is untouched
        assert_eq!(corpus.message_count(), 4);
    }

    #[test]
    fn serde_cbor_roundtrip() {
        let corpus = sample();
        let mut buf = Vec::new();
        ciborium::into_writer(&corpus, &mut buf).unwrap();
        let back: Corpus = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back.len(), corpus.len());
        assert_eq!(back.get(1).unwrap().0.name, corpus.get(1).unwrap().0.name);
    }
}
