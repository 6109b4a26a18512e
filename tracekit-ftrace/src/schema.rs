// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! Maps parsed ftrace event descriptors to a structured schema: field-name
//! extraction out of the C declarations, field-type inference, and message
//! emission.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::format_parser::{FormatField, FtraceEventFormat};

fn is_c_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

/// Extracts the field name out of a C declaration, or `None` when there is
/// no well-formed identifier to extract. Never yields a partial token.
///
/// ```
/// use tracekit_ftrace::schema::field_name;
/// assert_eq!(Some("foo"), field_name("int foo"));
/// assert_eq!(Some("foo"), field_name("u8 foo[(int)sizeof(struct blah)]"));
/// assert_eq!(Some("foo"), field_name("char[] foo[16]"));
/// assert_eq!(None, field_name("something_went_wrong"));
/// assert_eq!(None, field_name(""));
/// ```
pub fn field_name(type_and_name: &str) -> Option<&str> {
    if type_and_name.is_empty() {
        return None;
    }
    // Trim an array suffix back to its opening bracket.
    let right = if type_and_name.ends_with(']') {
        type_and_name.rfind('[')?
    } else {
        type_and_name.len()
    };
    let left = type_and_name[..right].rfind(' ')? + 1;
    let name = &type_and_name[left..right];
    is_c_identifier(name).then_some(name)
}

/// `sched_switch` -> `SchedSwitch`.
pub fn to_camel_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut upper_case_next = true;
    for c in s.chars() {
        if c == '_' {
            upper_case_next = true;
            continue;
        }
        if upper_case_next {
            upper_case_next = false;
            result.extend(c.to_uppercase());
        } else {
            result.push(c);
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFieldType {
    String,
    Int32,
    Uint32,
    Int64,
    Uint64,
}

impl SchemaFieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaFieldType::String => "string",
            SchemaFieldType::Int32 => "int32",
            SchemaFieldType::Uint32 => "uint32",
            SchemaFieldType::Int64 => "int64",
            SchemaFieldType::Uint64 => "uint64",
        }
    }
}

impl fmt::Display for SchemaFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infers the schema type for one kernel field, or `None` when no rule
/// applies (the field is then dropped from the schema).
pub fn infer_field_type(field: &FormatField) -> Option<SchemaFieldType> {
    // Fixed length strings: "char foo[16]".
    static FIXED_C_STRING: LazyLock<Regex> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)] // literal pattern
        Regex::new(r"^char \w+\[\d+\]$").unwrap()
    });
    if FIXED_C_STRING.is_match(&field.type_and_name) {
        return Some(SchemaFieldType::String);
    }
    // Variable length strings: "char * foo".
    if field.type_and_name.contains("char *") {
        return Some(SchemaFieldType::String);
    }
    // Ints of various sizes.
    match (field.size, field.is_signed) {
        (0..=4, true) => Some(SchemaFieldType::Int32),
        (0..=4, false) => Some(SchemaFieldType::Uint32),
        (5..=8, true) => Some(SchemaFieldType::Int64),
        (5..=8, false) => Some(SchemaFieldType::Uint64),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub field_type: SchemaFieldType,
    pub name: String,
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMessage {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

/// Emits schema fields in source order, paired with the kernel field each
/// one binds to. Fields with no extractable name, a duplicate name, or no
/// inferable type are skipped; numbers are contiguous from 1 over the
/// emitted subset.
pub fn bound_fields(format: &FtraceEventFormat) -> Vec<(SchemaField, &FormatField)> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(format.fields.len());
    let mut number = 1;
    for field in &format.fields {
        let Some(name) = field_name(&field.type_and_name) else {
            continue;
        };
        if !seen.insert(name) {
            continue;
        }
        let Some(field_type) = infer_field_type(field) else {
            continue;
        };
        fields.push((
            SchemaField {
                field_type,
                name: name.to_string(),
                number,
            },
            field,
        ));
        number += 1;
    }
    fields
}

/// Builds the schema message for one event.
pub fn generate_message(format: &FtraceEventFormat) -> SchemaMessage {
    SchemaMessage {
        name: to_camel_case(&format.name) + "FtraceEvent",
        fields: bound_fields(format)
            .into_iter()
            .map(|(field, _)| field)
            .collect(),
    }
}

impl fmt::Display for SchemaMessage {
    /// Proto3 text rendering, for the generated-schema tooling.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "syntax = \"proto3\";")?;
        writeln!(f, "option optimize_for = LITE_RUNTIME;")?;
        writeln!(f)?;
        writeln!(f, "message {} {{", self.name)?;
        for field in &self.fields {
            writeln!(f, "  {} {} = {};", field.field_type, field.name, field.number)?;
        }
        writeln!(f, "}}")
    }
}
