// Incremental content generation: deterministic prompt composition under
// the token-budget rule, the chapter record lifecycle, and per-chapter
// single-flight coalescing.

pub mod generator;
pub mod inflight;
pub mod prompt;
pub mod record;

pub use generator::{ContentGenerator, GenerationOutcome, GenerationSpec};
pub use inflight::{await_flight, Flight, InFlightGenerations, SharedFailure, SharedOutcome};
pub use prompt::{compose, PromptInputs};
pub use record::{count_words, ChapterState, GenerationMode, GenerationRecord};
