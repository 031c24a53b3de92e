//! Lowest-free port allocation for container `PORT` defaulting.

use std::collections::HashSet;

/// Returns the lowest port strictly above `base` that is not in
/// `assigned`. Ports freed by destroyed containers are reused before
/// higher ones are handed out.
#[must_use]
pub fn unused_port(assigned: &HashSet<u16>, base: u16) -> u16 {
    let mut candidate = base.saturating_add(1);
    while assigned.contains(&candidate) {
        candidate += 1;
    }
    candidate
}
