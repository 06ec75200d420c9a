//! Process-tree RSS sampling via /proc.

#[cfg(target_os = "linux")]
use std::collections::HashSet;

/// Resident set size of a single process, in bytes. 0 when unreadable.
#[cfg(target_os = "linux")]
pub fn process_rss_bytes(pid: u32) -> u64 {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|contents| parse_vmrss_bytes(&contents))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn process_rss_bytes(_pid: u32) -> u64 {
    0
}

/// RSS of a process and all of its descendants, in bytes.
#[cfg(target_os = "linux")]
pub fn process_tree_rss_bytes(pid: u32) -> u64 {
    let mut total = 0u64;
    let mut pending = vec![pid];
    let mut seen = HashSet::new();

    while let Some(current) = pending.pop() {
        if !seen.insert(current) {
            continue;
        }
        total = total.saturating_add(process_rss_bytes(current));
        pending.extend(child_pids(current));
    }
    total
}

#[cfg(not(target_os = "linux"))]
pub fn process_tree_rss_bytes(_pid: u32) -> u64 {
    0
}

/// RSS of the broker process itself, in bytes.
pub fn self_rss_bytes() -> u64 {
    process_rss_bytes(std::process::id())
}

#[cfg(target_os = "linux")]
fn child_pids(pid: u32) -> Vec<u32> {
    let mut children = Vec::new();
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return children;
    };
    for task in tasks.flatten() {
        let path = task.path().join("children");
        if let Ok(contents) = std::fs::read_to_string(&path) {
            children.extend(
                contents
                    .split_whitespace()
                    .filter_map(|value| value.parse::<u32>().ok()),
            );
        }
    }
    children
}

#[cfg(target_os = "linux")]
fn parse_vmrss_bytes(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb.saturating_mul(1024))
}
