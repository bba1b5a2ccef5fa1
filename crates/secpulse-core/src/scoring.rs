//! Composite security score.
//!
//! Every surface that displays a score (summary, dashboard, monthly report) calls [`score`].

use crate::{Severity, SeverityCounts};

pub const MAX_SCORE: u32 = 100;

/// Penalty points per event of the given severity. Informational events are free.
pub fn severity_weight(severity: Severity) -> u64 {
    match severity {
        Severity::Critical => 10,
        Severity::High => 5,
        Severity::Medium => 2,
        Severity::Low => 1,
        Severity::Informational => 0,
    }
}

pub fn weighted_penalty(counts: &SeverityCounts) -> u64 {
    Severity::ALL.iter().fold(0u64, |acc, severity| {
        acc.saturating_add(counts.get(*severity).saturating_mul(severity_weight(*severity)))
    })
}

/// `clamp(100 - (critical*10 + high*5 + medium*2 + low), 0, 100)`.
pub fn score(counts: &SeverityCounts) -> u32 {
    let penalty = weighted_penalty(counts);
    u64::from(MAX_SCORE).saturating_sub(penalty) as u32
}
