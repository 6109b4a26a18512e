// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Parser for one ftrace event `format` file.
//!
//! The kernel exposes these as ASCII under
//! `events/<group>/<name>/format`:
//!
//! ```text
//! name: sched_switch
//! ID: 68
//! format:
//!     field:unsigned short common_type;   offset:0;   size:2; signed:0;
//!     field:char prev_comm[16];   offset:8;   size:16;    signed:1;
//!     ...
//! print fmt: "prev_comm=%s ...", ...
//! ```
//!
//! Everything from `print fmt:` onward is ignored, as are the fields whose
//! name carries the `common_` prefix (they belong to the page header, not
//! the event). A parse that produced no id, no name, or no fields is a
//! failure for that one event; the enclosing table build carries on.

use thiserror::Error;
use tracing::warn;

use crate::schema::field_name;

const COMMON_FIELD_PREFIX: &str = "common_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatField {
    /// Verbatim C declaration, e.g. `char prev_comm[16]`.
    pub type_and_name: String,
    pub offset: usize,
    pub size: usize,
    pub is_signed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtraceEventFormat {
    pub id: u32,
    pub name: String,
    pub fields: Vec<FormatField>,
}

#[derive(Debug, Error)]
pub enum FormatParseError {
    #[error("cannot parse line {line_number}: {line:?}")]
    MalformedLine { line_number: usize, line: String },
    #[error("no ID found")]
    MissingId,
    #[error("no name found")]
    MissingName,
    #[error("no fields found")]
    MissingFields,
}

/// Parses the contents of one `format` file.
pub fn parse_ftrace_event(input: &str) -> Result<FtraceEventFormat, FormatParseError> {
    let mut id: Option<u32> = None;
    let mut name: Option<String> = None;
    let mut fields = Vec::new();

    for (line_number, line) in input.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        if id.is_none() {
            if let Some(rest) = line.strip_prefix("ID:") {
                if let Ok(parsed) = rest.trim().parse() {
                    id = Some(parsed);
                    continue;
                }
            }
        }
        if name.is_none() {
            if let Some(rest) = line.strip_prefix("name:") {
                if let Some(token) = rest.split_whitespace().next() {
                    name = Some(token.to_string());
                    continue;
                }
            }
        }
        if line == "format:" {
            continue;
        }
        if let Some(field) = parse_field_line(line) {
            let is_common = field_name(&field.type_and_name)
                .is_some_and(|n| n.starts_with(COMMON_FIELD_PREFIX));
            if !is_common {
                fields.push(field);
            }
            continue;
        }
        if line.starts_with("print fmt:") {
            break;
        }
        warn!(line_number, line, "cannot parse format line");
        return Err(FormatParseError::MalformedLine {
            line_number,
            line: line.to_string(),
        });
    }

    let id = id.ok_or(FormatParseError::MissingId)?;
    let name = name.ok_or(FormatParseError::MissingName)?;
    if fields.is_empty() {
        return Err(FormatParseError::MissingFields);
    }
    Ok(FtraceEventFormat { id, name, fields })
}

/// One field record:
/// `\tfield:<type and name>;\toffset: <n>;\tsize: <n>;\tsigned: <0|1>;`
fn parse_field_line(line: &str) -> Option<FormatField> {
    let rest = line.trim_start();
    let rest = rest.strip_prefix("field:")?;
    let mut segments = rest.split(';');

    let type_and_name = segments.next()?.trim().to_string();
    if type_and_name.is_empty() {
        return None;
    }
    let offset = keyed_number(segments.next()?, "offset:")?;
    let size = keyed_number(segments.next()?, "size:")?;
    let signed = keyed_number(segments.next()?, "signed:")?;
    Some(FormatField {
        type_and_name,
        offset,
        size,
        is_signed: signed == 1,
    })
}

fn keyed_number(segment: &str, key: &str) -> Option<usize> {
    segment.trim().strip_prefix(key)?.trim().parse().ok()
}
