// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Kernel ftrace support: parsing the human-readable event `format` files,
//! inferring a structured schema from them, and binding on-wire kernel
//! records to that schema through a translation table. The `traced-probes`
//! binary attaches to the service as the kernel-event producer.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod event_filter;
pub mod format_parser;
pub mod ftrace_procfs;
pub mod probes_producer;
pub mod schema;
pub mod translation_table;

pub use event_filter::EventFilter;
pub use format_parser::{FormatField, FormatParseError, FtraceEventFormat};
pub use ftrace_procfs::FtraceProcfs;
pub use probes_producer::ProbesProducer;
pub use schema::{SchemaField, SchemaFieldType, SchemaMessage};
pub use translation_table::{Event, GroupAndName, TranslationTable};
