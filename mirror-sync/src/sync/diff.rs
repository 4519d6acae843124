//! Line-level manifest diff.
//!
//! Comparing the `[Files]` sections of the previous and current manifest
//! tells which paths changed since the last run without touching the
//! filesystem. Both sides are sorted by path and merged.

use crate::manifest::normalize_path;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Path field of a `[Files]` line (everything after the third tab)
fn line_path(line: &str) -> Option<&str> {
    line.splitn(4, '\t').nth(3).map(normalize_path)
}

fn sort_by_path(lines: Vec<String>) -> Vec<(String, String)> {
    let mut keyed: Vec<(String, String)> = lines
        .into_iter()
        .filter_map(|line| line_path(&line).map(|p| p.to_string()).map(|p| (p, line)))
        .collect();
    keyed.sort();
    keyed
}

/// Paths whose manifest line was added, removed or changed
pub fn changed_paths(previous: Vec<String>, current: Vec<String>) -> BTreeSet<String> {
    let old = sort_by_path(previous);
    let new = sort_by_path(current);
    let mut changed = BTreeSet::new();

    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        let (old_path, old_line) = &old[i];
        let (new_path, new_line) = &new[j];
        match old_path.cmp(new_path) {
            Ordering::Less => {
                changed.insert(old_path.clone());
                i += 1;
            }
            Ordering::Greater => {
                changed.insert(new_path.clone());
                j += 1;
            }
            Ordering::Equal => {
                if old_line != new_line {
                    changed.insert(new_path.clone());
                }
                i += 1;
                j += 1;
            }
        }
    }
    changed.extend(old[i..].iter().map(|(p, _)| p.clone()));
    changed.extend(new[j..].iter().map(|(p, _)| p.clone()));

    changed
}
