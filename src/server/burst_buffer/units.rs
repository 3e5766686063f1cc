use nix::unistd::{Uid, User};

use crate::common::parser::p_i64;
use crate::UserId;

/// Parse a burst buffer size literal into GiB-denominated units.
///
/// A trailing `M` is rounded *up* to GiB, `G` (or no suffix) is taken as
/// GiB, `T` and `P` multiply by 1024 and 1024². The result is then rounded
/// up to the next multiple of `granularity`. A non-positive number yields 0.
pub fn parse_size(tok: &str, granularity: u32) -> u32 {
    let (rest, value) = match p_i64(tok.trim_start()) {
        Ok(parsed) => parsed,
        Err(_) => return 0,
    };
    if value <= 0 {
        return 0;
    }
    let mut size = value as u32;
    size = match rest.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('m') => (size + 1023) / 1024,
        Some('t') => size.saturating_mul(1024),
        Some('p') => size.saturating_mul(1024 * 1024),
        _ => size,
    };
    if granularity > 1 {
        size = ((size + granularity - 1) / granularity) * granularity;
    }
    size
}

/// Parse a GRES count. Unlike [`parse_size`], the `K`/`M`/`G` suffixes are
/// plain powers-of-1024 multipliers with no unit conversion.
pub fn parse_count(tok: &str) -> u32 {
    let (rest, value) = match p_i64(tok.trim_start()) {
        Ok(parsed) => parsed,
        Err(_) => return 0,
    };
    if value <= 0 {
        return 0;
    }
    let count = value as u32;
    match rest.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('k') => count.saturating_mul(1024),
        Some('m') => count.saturating_mul(1024 * 1024),
        Some('g') => count.saturating_mul(1024 * 1024 * 1024),
        _ => count,
    }
}

/// Translate a colon-delimited list of user names or numeric UIDs into a
/// UID array. Only the portion up to the first comma is consumed. Users
/// that cannot be resolved, and UID 0, are dropped with a log entry.
pub fn parse_users(buf: &str) -> Vec<UserId> {
    let list = buf.split(',').next().unwrap_or("");
    let mut users = Vec::new();
    for tok in list.split(':') {
        if tok.is_empty() {
            continue;
        }
        match uid_from_string(tok) {
            Some(uid) if uid != 0 => users.push(uid),
            _ => log::error!("ignoring invalid user: {}", tok),
        }
    }
    users
}

/// Inverse of [`parse_users`]: UIDs back to a colon-delimited string, using
/// user names where the UID resolves.
pub fn print_users(users: &[UserId]) -> String {
    users
        .iter()
        .map(|&uid| match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user.name,
            _ => uid.to_string(),
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn uid_from_string(tok: &str) -> Option<UserId> {
    if let Ok(uid) = tok.parse::<UserId>() {
        return Some(uid);
    }
    User::from_name(tok)
        .ok()
        .flatten()
        .map(|user| user.uid.as_raw())
}
