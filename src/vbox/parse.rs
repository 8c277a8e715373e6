//! Decoders for the semi-structured text `VBoxManage` prints.
//!
//! The tool has no stable machine format. Detail queries
//! (`showvminfo --machinereadable`) print `key="value"` lines, list
//! queries print blank-line separated blocks of `Key:   value` lines, and
//! a few commands have their own line shapes. Every decoder here takes
//! already split lines and tolerates `\r` line endings and trailing blanks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

/// Flat `key -> value` mapping with quotes stripped from both sides.
pub type Info = BTreeMap<String, String>;

/// Strip one pair of matching outer quotes (`'` or `"`) after trimming.
pub fn dequote(text: &str) -> &str {
    let out = text.trim();
    let bytes = out.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return &out[1..out.len() - 1];
        }
    }
    out
}

/// Parse `key<sep>value` lines. Lines without the separator are skipped.
pub fn parse_key_values<S: AsRef<str>>(sep: char, lines: &[S]) -> Info {
    let mut result = Info::new();
    for line in lines {
        let line = line.as_ref().trim_end_matches('\r');
        if let Some((key, value)) = line.split_once(sep) {
            result.insert(dequote(key).to_string(), dequote(value).to_string());
        }
    }
    result
}

/// Parse blank-line separated blocks of `Key: value` lines, keyed by the
/// value of `key_field` in each block. Blocks missing that field are dropped.
pub fn parse_blocks<S: AsRef<str>>(key_field: &str, lines: &[S]) -> BTreeMap<String, Info> {
    let mut result = BTreeMap::new();
    let mut block: Vec<&str> = Vec::new();
    for line in lines {
        let line = line.as_ref().trim_end_matches('\r');
        if line.trim().is_empty() {
            flush_block(key_field, &mut block, &mut result);
        } else {
            block.push(line);
        }
    }
    flush_block(key_field, &mut block, &mut result);
    result
}

fn flush_block(key_field: &str, block: &mut Vec<&str>, result: &mut BTreeMap<String, Info>) {
    if block.is_empty() {
        return;
    }
    let info = parse_key_values(':', block.as_slice());
    block.clear();
    if let Some(key) = info.get(key_field) {
        result.insert(key.clone(), info);
    }
}

static VM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:"(.*?)"|'(.*?)')\s+\{(.*?)\}\s*$"#).expect("valid vm list regex")
});

/// Parse `list vms` output (`"name" {uuid}` lines) into `name -> uuid`.
pub fn parse_vm_list<S: AsRef<str>>(lines: &[S]) -> BTreeMap<String, String> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = VM_LINE.captures(line.as_ref().trim_end_matches('\r'))?;
            let name = caps.get(1).or_else(|| caps.get(2))?.as_str();
            Some((name.to_string(), caps[3].to_string()))
        })
        .collect()
}

/// One value reported by `guestproperty enumerate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProperty {
    pub value: String,
    pub timestamp: String,
    pub flags: Vec<String>,
}

static GUEST_PROPERTY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Name: (.*), value: (.*), timestamp: (.*), flags: (.*)$")
        .expect("valid guest property regex")
});

/// Parse `guestproperty enumerate` output into `property name -> value`.
pub fn parse_guest_properties<S: AsRef<str>>(lines: &[S]) -> BTreeMap<String, GuestProperty> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = GUEST_PROPERTY_LINE.captures(line.as_ref().trim_end_matches('\r'))?;
            let flags = caps[4]
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            Some((
                caps[1].to_string(),
                GuestProperty {
                    value: caps[2].to_string(),
                    timestamp: caps[3].to_string(),
                    flags,
                },
            ))
        })
        .collect()
}

/// Group indexed detail keys such as `storagecontrollername0` or `nic1`.
///
/// Keys of the form `<prefix><fragment><index>` (fragment without digits,
/// possibly empty) are collected into `index -> {fragment: value}`. An entry
/// that has a `name` fragment is also reachable under that name.
///
/// With `namekey`, only entries whose key equals their own `namekey` value
/// survive: index aliases go away, and so do stale or duplicated names.
pub fn group_by_prefix(info: &Info, prefix: &str, namekey: Option<&str>) -> BTreeMap<String, Info> {
    let mut by_index: BTreeMap<String, Info> = BTreeMap::new();
    for (key, value) in info {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let digits_at = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (fragment, index) = rest.split_at(digits_at);
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        by_index
            .entry(index.to_string())
            .or_default()
            .insert(fragment.to_string(), value.clone());
    }

    let mut result = by_index.clone();
    for entry in by_index.values() {
        if let Some(name) = entry.get("name") {
            result.insert(name.clone(), entry.clone());
        }
    }

    if let Some(namekey) = namekey {
        result.retain(|key, entry| entry.get(namekey).is_some_and(|n| n == key));
    }
    result
}

/// Extract sub-command names from the tool's usage text.
///
/// Commands follow a `Commands:` header. A line whose first four columns
/// are not blank starts a new command; the first word within the first 28
/// columns of that line is its name. Deeper indented lines continue the
/// previous command's synopsis.
pub fn parse_command_list<S: AsRef<str>>(lines: &[S]) -> BTreeSet<String> {
    let mut lines = lines
        .iter()
        .map(|l| l.as_ref().trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty());

    for line in lines.by_ref() {
        if line.starts_with("Commands:") {
            break;
        }
    }

    let mut result = BTreeSet::new();
    let mut count = 0usize;
    for line in lines {
        let head: String = line.chars().take(4).collect();
        if !head.trim().is_empty() {
            count = 0;
        }
        if count == 0 {
            let column: String = line.chars().take(28).collect();
            if let Some(word) = column.split_whitespace().next() {
                result.insert(word.to_string());
            }
        }
        count += 1;
    }
    result
}
