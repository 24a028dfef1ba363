#![deny(clippy::all, clippy::pedantic)]
#![allow(
    // Acceptable for trait naming consistency (e.g., KvStore, ContextStore)
    clippy::module_name_repetitions,

    // Duration/millisecond conversions for deadlines and lease arithmetic
    clippy::cast_possible_truncation,

    // Gauge values are f64; queue depths and device counts convert from usize
    clippy::cast_precision_loss,

    // Error context via anyhow::Context already provides sufficient documentation
    clippy::missing_errors_doc,

    // Panic paths are defensive (e.g., mutex poisoning), not part of normal flow
    clippy::missing_panics_doc,

    // Technical identifiers (e.g., GPU, TTL, CAS) don't need markdown formatting
    clippy::doc_markdown,

    // Named format args reduce readability for long messages with many placeholders
    clippy::uninlined_format_args,

    // if-let-else patterns are clearer than map_or for error handling flows
    clippy::option_if_let_else,

    // Pass-by-value necessary for async trait methods (Arc, Config types)
    clippy::needless_pass_by_value,

    // Too noisy: many utility methods return useful values but aren't always used
    clippy::must_use_candidate,

    // Nested conditions improve readability when branches are semantically distinct
    clippy::collapsible_if
)]

pub(crate) mod api;
pub mod app;
pub mod bridge;
pub mod broker;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod gpu;
pub mod kv;
pub mod layout;
pub mod node;
pub mod nodes;
pub mod observability;
pub mod params;
pub mod scheduler;
pub mod util;
