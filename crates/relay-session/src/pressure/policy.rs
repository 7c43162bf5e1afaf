//! Candidate selection for graduated cleanup.
//!
//! Each pool (connections, executions) is ranked into one priority list:
//! stale entries first, then idle, then live entries least recently active
//! first. Every level takes a prefix of that list, and higher levels never
//! take a shorter prefix, so cleanup is monotonic in the level. The most
//! recently active live entry of each user is never in the list.
//!
//! A user is active while they own at least one live entry. Users whose
//! entries have all gone idle get no protection: Moderate already reclaims
//! idle entries, and Force must never reclaim less than Moderate.

use std::collections::HashMap;

use relay_core::UserId;
use relay_settings::PressureSettings;
use tokio::time::Instant;

use super::level::PressureLevel;

/// How reclaimable an entry is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Tier {
    /// Finished or closed; holds resources for nothing.
    Stale,
    /// Open but inactive beyond the idle threshold.
    Idle,
    /// In active use.
    Live,
}

#[derive(Clone, Debug)]
pub(crate) struct Candidate<K> {
    pub key: K,
    pub owner: UserId,
    pub tier: Tier,
    pub last_active: Instant,
}

/// Keys to reclaim at `level`, in reclaim order.
pub(crate) fn select<K: Clone>(
    candidates: &[Candidate<K>],
    level: PressureLevel,
    settings: &PressureSettings,
) -> Vec<K> {
    let total = candidates.len();
    if total == 0 || level == PressureLevel::Normal {
        return Vec::new();
    }

    let protected = protected_indices(candidates);
    let mut ranked: Vec<&Candidate<K>> = candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| !protected.contains(i))
        .map(|(_, c)| c)
        .collect();
    ranked.sort_by_key(|c| (c.tier, c.last_active));

    let reclaimable = ranked.iter().filter(|c| c.tier != Tier::Live).count();
    let count = match level {
        PressureLevel::Normal => 0,
        PressureLevel::Conservative => {
            let stale = ranked.iter().filter(|c| c.tier == Tier::Stale).count();
            stale.min(cap(total, settings.conservative_max))
        }
        PressureLevel::Moderate => reclaimable.min(cap(total, settings.moderate_max)),
        PressureLevel::Aggressive => reclaimable
            .max(floor_fraction(total, settings.aggressive_min, true))
            .min(cap(total, settings.aggressive_max))
            .min(ranked.len()),
        PressureLevel::Force => ranked.len(),
    };

    ranked.into_iter().take(count).map(|c| c.key.clone()).collect()
}

/// `max(1, floor(total * fraction))`.
///
/// The floor of one overrides the band on small pools: a single-entry pool
/// is reclaimed completely at any level that selects it.
fn cap(total: usize, fraction: f64) -> usize {
    floor_fraction(total, fraction, false).max(1)
}

fn floor_fraction(total: usize, fraction: f64, round_up: bool) -> usize {
    let exact = total as f64 * fraction.clamp(0.0, 1.0);
    let rounded = if round_up { exact.ceil() } else { exact.floor() };
    (rounded as usize).min(total)
}

/// Per owner, the most recently active live candidate.
fn protected_indices<K>(candidates: &[Candidate<K>]) -> Vec<usize> {
    let mut newest: HashMap<&UserId, usize> = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        if c.tier != Tier::Live {
            continue;
        }
        let _ = newest
            .entry(&c.owner)
            .and_modify(|best| {
                if candidates[*best].last_active < c.last_active {
                    *best = i;
                }
            })
            .or_insert(i);
    }
    newest.into_values().collect()
}
