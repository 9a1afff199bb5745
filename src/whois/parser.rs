//! Freeform whois reply parsing.
//!
//! Registry replies are loosely structured `label: value` text. Blank
//! lines and `%`/`#` remark lines close the current group; continuation
//! lines (no colon) append to the last label seen; repeated labels within
//! a group accumulate. Groups are shallow-merged last-wins per key, except
//! "role" records (contact blocks), which are filed under their own role
//! name so they never clobber the network block's fields.

use std::collections::HashMap;

/// One parsed group: lowercased label -> accumulated values.
pub type Group = HashMap<String, Vec<String>>;

/// A fully parsed whois reply.
#[derive(Debug, Default)]
pub struct Reply {
    /// Merged non-role groups, last-group-wins per label.
    pub fields: Group,
    /// Role records keyed by their role name.
    pub roles: HashMap<String, Group>,
}

impl Reply {
    /// First value of `label` in the merged fields, if any.
    pub fn first(&self, label: &str) -> Option<&str> {
        self.fields
            .get(label)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of `label` in the merged fields.
    pub fn all(&self, label: &str) -> &[String] {
        self.fields.get(label).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Parse a raw reply into merged fields and role records.
pub fn parse_reply(raw: &str) -> Reply {
    let mut reply = Reply::default();
    let mut group = Group::new();
    let mut last_label: Option<String> = None;

    for line in raw.lines() {
        let trimmed = line.trim_end();

        // Remark markers and blank lines end the current group.
        if trimmed.trim().is_empty()
            || trimmed.starts_with('%')
            || trimmed.starts_with('#')
        {
            close_group(&mut reply, &mut group);
            last_label = None;
            continue;
        }

        if let Some((label, value)) = trimmed.split_once(':') {
            let label = label.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            group.entry(label.clone()).or_default().push(value);
            last_label = Some(label);
        } else if let Some(label) = &last_label {
            // Continuation line: append to the last value of the last label.
            if let Some(values) = group.get_mut(label)
                && let Some(last) = values.last_mut()
            {
                if !last.is_empty() {
                    last.push(' ');
                }
                last.push_str(trimmed.trim());
            }
        }
    }
    close_group(&mut reply, &mut group);

    reply
}

fn close_group(reply: &mut Reply, group: &mut Group) {
    if group.is_empty() {
        return;
    }
    let group = std::mem::take(group);

    // Contact blocks go under their role name; real registries return the
    // network block and the contact org as separate groups.
    if let Some(role) = group.get("role").and_then(|v| v.first()) {
        reply.roles.insert(role.to_ascii_lowercase(), group);
        return;
    }

    for (label, values) in group {
        reply.fields.insert(label, values);
    }
}

/// Scan a raw reply for a referral to another whois server.
///
/// Handles `whois:` (IANA), `refer:`, and `ReferralServer:` lines; URL
/// schemes like `whois://host:port` are stripped to `host:port`.
pub fn find_referral(raw: &str) -> Option<String> {
    for line in raw.lines() {
        let line = line.trim();
        let value = ["whois:", "refer:", "referralserver:"]
            .iter()
            .find_map(|prefix| strip_prefix_ci(line, prefix));
        if let Some(value) = value {
            let host = value
                .trim()
                .trim_start_matches("rwhois://")
                .trim_start_matches("whois://")
                .trim_end_matches('/');
            if !host.is_empty() {
                return Some(host.to_string());
            }
        }
    }
    None
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}
