// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! The binding between on-wire kernel records and the structured schema.
//!
//! Built by enumerating the tracefs event directory once at startup; each
//! event's translation entry maps kernel byte ranges to schema field ids.
//! Events the build did not see (modules loaded later, out-of-tree
//! tracepoints) can be materialized on demand through
//! [`TranslationTable::get_or_create_event`], which reads the kernel's
//! format file at that point and registers a generic entry.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::format_parser::{parse_ftrace_event, FtraceEventFormat};
use crate::ftrace_procfs::FtraceProcfs;
use crate::schema::{bound_fields, to_camel_case, SchemaFieldType};

/// Identifies one tracepoint, as `group/name`. Configs may also name an
/// event without its group, in which case the first event registered under
/// that name wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAndName {
    group: String,
    name: String,
}

impl GroupAndName {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> GroupAndName {
        GroupAndName {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for GroupAndName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// How the bytes of one kernel field are to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtraceFieldType {
    /// NUL-terminated or fixed-size character data.
    String,
    Number { size: u16, is_signed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationField {
    pub ftrace_offset: usize,
    pub ftrace_size: usize,
    pub ftrace_type: FtraceFieldType,
    pub schema_field_id: u32,
    pub schema_field_type: SchemaFieldType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub group: String,
    /// Schema message name, `CamelCase(name) + "FtraceEvent"`.
    pub schema_message_name: String,
    pub ftrace_event_id: u32,
    pub schema_message_id: u32,
    pub fields: Vec<TranslationField>,
}

pub struct TranslationTable {
    procfs: Arc<FtraceProcfs>,
    /// Dense by ftrace event id; `None` for unassigned ids.
    events: Vec<Option<Event>>,
    largest_id: usize,
    group_and_name_to_id: HashMap<GroupAndName, usize>,
    /// Values in registration order; the front entry answers bare-name
    /// lookups.
    name_to_ids: HashMap<String, Vec<usize>>,
    group_to_ids: HashMap<String, Vec<usize>>,
    last_schema_message_id: u32,
}

impl TranslationTable {
    /// Builds the table from every event currently advertised by the
    /// kernel. A format file that fails to parse skips that one event.
    pub fn create(procfs: Arc<FtraceProcfs>) -> io::Result<TranslationTable> {
        let mut table = TranslationTable {
            procfs: procfs.clone(),
            events: Vec::new(),
            largest_id: 0,
            group_and_name_to_id: HashMap::new(),
            name_to_ids: HashMap::new(),
            group_to_ids: HashMap::new(),
            last_schema_message_id: 0,
        };
        for group_and_name in procfs.enumerate_events()? {
            let contents = match procfs.read_event_format(&group_and_name) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!(event = %group_and_name, "cannot read format file: {e}");
                    continue;
                }
            };
            match parse_ftrace_event(&contents) {
                Ok(format) => {
                    table.insert_event(group_and_name.group().to_string(), format);
                }
                Err(e) => warn!(event = %group_and_name, "cannot parse format file: {e}"),
            }
        }
        Ok(table)
    }

    pub fn largest_id(&self) -> usize {
        self.largest_id
    }

    pub fn event_by_id(&self, ftrace_event_id: usize) -> Option<&Event> {
        if ftrace_event_id == 0 || ftrace_event_id > self.largest_id {
            return None;
        }
        self.events.get(ftrace_event_id)?.as_ref()
    }

    pub fn event(&self, group_and_name: &GroupAndName) -> Option<&Event> {
        let &id = self.group_and_name_to_id.get(group_and_name)?;
        self.events.get(id)?.as_ref()
    }

    /// Bare-name lookup: the first event registered under `name`.
    pub fn event_by_name(&self, name: &str) -> Option<&Event> {
        let &id = self.name_to_ids.get(name)?.first()?;
        self.events.get(id)?.as_ref()
    }

    pub fn events_by_group(&self, group: &str) -> Vec<&Event> {
        self.group_to_ids
            .get(group)
            .into_iter()
            .flatten()
            .filter_map(|&id| self.events.get(id)?.as_ref())
            .collect()
    }

    pub fn event_to_ftrace_id(&self, group_and_name: &GroupAndName) -> u32 {
        self.event(group_and_name)
            .map(|e| e.ftrace_event_id)
            .unwrap_or(0)
    }

    /// Looks up an event, reading its format file through the procfs and
    /// registering a generic entry if the table has never seen it.
    pub fn get_or_create_event(&mut self, group_and_name: &GroupAndName) -> Option<&Event> {
        if !self.group_and_name_to_id.contains_key(group_and_name) {
            let contents = match self.procfs.read_event_format(group_and_name) {
                Ok(contents) => contents,
                Err(e) => {
                    debug!(event = %group_and_name, "no format file for unknown event: {e}");
                    return None;
                }
            };
            match parse_ftrace_event(&contents) {
                Ok(format) => {
                    self.insert_event(group_and_name.group().to_string(), format);
                }
                Err(e) => {
                    warn!(event = %group_and_name, "cannot parse format file: {e}");
                    return None;
                }
            }
        }
        self.event(group_and_name)
    }

    fn insert_event(&mut self, group: String, format: FtraceEventFormat) {
        let group_and_name = GroupAndName::new(group.clone(), format.name.clone());
        if self.group_and_name_to_id.contains_key(&group_and_name) {
            debug!(event = %group_and_name, "duplicate event registration ignored");
            return;
        }

        self.last_schema_message_id += 1;
        let fields = bound_fields(&format)
            .into_iter()
            .map(|(schema_field, kernel_field)| TranslationField {
                ftrace_offset: kernel_field.offset,
                ftrace_size: kernel_field.size,
                ftrace_type: match schema_field.field_type {
                    SchemaFieldType::String => FtraceFieldType::String,
                    _ => FtraceFieldType::Number {
                        size: kernel_field.size as u16,
                        is_signed: kernel_field.is_signed,
                    },
                },
                schema_field_id: schema_field.number,
                schema_field_type: schema_field.field_type,
            })
            .collect();
        let event = Event {
            name: format.name.clone(),
            group: group.clone(),
            schema_message_name: to_camel_case(&format.name) + "FtraceEvent",
            ftrace_event_id: format.id,
            schema_message_id: self.last_schema_message_id,
            fields,
        };

        let id = format.id as usize;
        if id >= self.events.len() {
            self.events.resize(id + 1, None);
        }
        self.largest_id = self.largest_id.max(id);
        self.events[id] = Some(event);
        self.group_and_name_to_id.insert(group_and_name, id);
        self.name_to_ids.entry(format.name).or_default().push(id);
        self.group_to_ids.entry(group).or_default().push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_format(root: &std::path::Path, group: &str, name: &str, id: u32, body: &str) {
        let dir = root.join("events").join(group).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("format"),
            format!("name: {name}\nID: {id}\n{body}"),
        )
        .unwrap();
    }

    fn fake_procfs() -> (tempfile::TempDir, Arc<FtraceProcfs>) {
        let dir = tempfile::tempdir().unwrap();
        write_format(
            dir.path(),
            "sched",
            "sched_switch",
            68,
            "\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:1;\n\
             \tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;\n",
        );
        write_format(
            dir.path(),
            "sched",
            "sched_wakeup",
            70,
            "\tfield:pid_t pid;\toffset:8;\tsize:4;\tsigned:1;\n",
        );
        // A second group reusing an event name.
        write_format(
            dir.path(),
            "compat",
            "sched_wakeup",
            90,
            "\tfield:u64 ts;\toffset:8;\tsize:8;\tsigned:0;\n",
        );
        let procfs = Arc::new(FtraceProcfs::new(dir.path()));
        (dir, procfs)
    }

    #[test]
    fn builds_the_indexes() {
        let (_dir, procfs) = fake_procfs();
        let table = TranslationTable::create(procfs).unwrap();

        assert_eq!(90, table.largest_id());
        let event = table
            .event(&GroupAndName::new("sched", "sched_switch"))
            .unwrap();
        assert_eq!(68, event.ftrace_event_id);
        assert_eq!("SchedSwitchFtraceEvent", event.schema_message_name);
        assert_eq!(2, event.fields.len());
        assert_eq!(
            TranslationField {
                ftrace_offset: 8,
                ftrace_size: 16,
                ftrace_type: FtraceFieldType::String,
                schema_field_id: 1,
                schema_field_type: SchemaFieldType::String,
            },
            event.fields[0]
        );
        assert_eq!(
            TranslationField {
                ftrace_offset: 24,
                ftrace_size: 4,
                ftrace_type: FtraceFieldType::Number {
                    size: 4,
                    is_signed: true,
                },
                schema_field_id: 2,
                schema_field_type: SchemaFieldType::Int32,
            },
            event.fields[1]
        );

        assert_eq!(68, table.event_by_id(68).unwrap().ftrace_event_id);
        assert!(table.event_by_id(0).is_none());
        assert!(table.event_by_id(69).is_none());
        assert!(table.event_by_id(4096).is_none());

        assert_eq!(
            68,
            table.event_to_ftrace_id(&GroupAndName::new("sched", "sched_switch"))
        );
        assert_eq!(
            0,
            table.event_to_ftrace_id(&GroupAndName::new("sched", "no_such_event"))
        );

        assert_eq!(2, table.events_by_group("sched").len());
        assert_eq!(1, table.events_by_group("compat").len());
    }

    #[test]
    fn bare_name_lookup_is_first_registered_wins() {
        let (_dir, procfs) = fake_procfs();
        let table = TranslationTable::create(procfs).unwrap();
        // Enumeration is sorted, so compat/sched_wakeup registers first.
        let event = table.event_by_name("sched_wakeup").unwrap();
        assert_eq!("compat", event.group);
        assert_eq!(90, event.ftrace_event_id);
    }

    #[test]
    fn schema_message_ids_are_sequential() {
        let (_dir, procfs) = fake_procfs();
        let table = TranslationTable::create(procfs).unwrap();
        let mut ids: Vec<u32> = (1..=table.largest_id())
            .filter_map(|id| table.event_by_id(id))
            .map(|e| e.schema_message_id)
            .collect();
        ids.sort_unstable();
        assert_eq!(vec![1, 2, 3], ids);
    }

    #[test]
    fn unknown_events_are_created_on_demand() {
        let (dir, procfs) = fake_procfs();
        let mut table = TranslationTable::create(procfs).unwrap();

        let unknown = GroupAndName::new("ext4", "ext4_sync_file_enter");
        assert!(table.event(&unknown).is_none());
        // The module shows up after the table was built.
        write_format(
            dir.path(),
            "ext4",
            "ext4_sync_file_enter",
            512,
            "\tfield:int ret;\toffset:8;\tsize:4;\tsigned:1;\n",
        );
        let event = table.get_or_create_event(&unknown).unwrap();
        assert_eq!(512, event.ftrace_event_id);
        assert_eq!(4, event.schema_message_id);
        assert_eq!(512, table.largest_id());
        // And stays registered.
        assert!(table.event(&unknown).is_some());

        assert!(table
            .get_or_create_event(&GroupAndName::new("nope", "never"))
            .is_none());
    }
}
