// SPDX-License-Identifier: Apache-2.0 OR MIT
// Facility/severity logging for the IGMP proxy
//
// Every component logs through a cloneable `Logger` handle tagged with the
// `Facility` it belongs to. Records are filtered by a global minimum level
// and optional per-facility overrides, then handed to a `LogSink`.

mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;

pub use facility::Facility;
pub use logger::{LogRecord, LogSink, Logger, MemorySink, NullSink, StderrJsonSink};
pub use severity::Severity;
