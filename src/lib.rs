//! boxfuzz, a compartment-interface fuzzer: mutate the data crossing the
//! boundary between a shared library and its host application, and watch
//! which side falls over.

pub mod artifacts;
pub mod corpus;
pub mod error;
pub mod extract;
pub mod fuzzer;
pub mod maps;
pub mod mutator;
pub mod reproduce;
pub mod supervisor;
pub mod triage;
pub mod ui;
pub mod wire;
