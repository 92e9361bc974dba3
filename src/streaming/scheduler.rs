//! Demand/producer reconciliation.
//!
//! [`plan`] compares the demanded chunk indices against the active producers
//! and decides which producers keep running, which go idle or are retired,
//! and which chunk indices need a fresh producer. It is a pure function; the
//! controller applies the resulting [`Plan`] under its state lock, so no two
//! reconciliations ever race on the same controller.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::producer::ProducerId;

/// Forward distance used both to merge nearby demand into one target and to
/// match a target to an existing producer.
pub const PROXIMITY_WINDOW: usize = 10;

/// Snapshot of one producer, as much as planning needs to see.
#[derive(Debug, Clone, Copy)]
pub struct ProducerView {
    pub id: ProducerId,
    /// Next chunk index this producer will emit.
    pub cursor: usize,
    /// When the producer last lost all matching demand, if it has.
    pub idle_since: Option<Instant>,
    /// Already being torn down; ignored for matching and never retired twice.
    pub retiring: bool,
}

/// Actions for the controller to apply.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Producers that regained matching demand; clear their idle marker.
    pub mark_active: Vec<ProducerId>,
    /// Producers that just lost all matching demand; stamp `idle_since`.
    pub mark_idle: Vec<ProducerId>,
    /// Producers idle past the grace period; kill and reap.
    pub retire: Vec<ProducerId>,
    /// Chunk indices that need a new producer, in increasing order.
    pub start: Vec<usize>,
}

/// Merge demanded indices into targets: an index within the proximity window
/// ahead of an already-accepted target rides along with it instead of
/// becoming a target of its own.
pub fn merge_targets(indices: &BTreeSet<usize>) -> Vec<usize> {
    let mut targets: Vec<usize> = Vec::new();

    for &index in indices {
        let covered = targets
            .iter()
            .any(|&t| index >= t && index < t + PROXIMITY_WINDOW);
        if !covered {
            targets.push(index);
        }
    }

    targets
}

/// Reconcile demand against the active producer set.
pub fn plan(
    demand: &BTreeSet<usize>,
    producers: &[ProducerView],
    now: Instant,
    idle_grace: Duration,
    max_producers: usize,
) -> Plan {
    let mut targets = merge_targets(demand);
    let mut plan = Plan::default();

    for producer in producers {
        if producer.retiring {
            continue;
        }

        let matched = targets
            .iter()
            .any(|&t| t >= producer.cursor && t < producer.cursor + PROXIMITY_WINDOW);

        if matched {
            // Every target this producer can reach is covered by it.
            targets.retain(|&t| {
                !(t >= producer.cursor && t < producer.cursor + PROXIMITY_WINDOW)
            });
            if producer.idle_since.is_some() {
                plan.mark_active.push(producer.id);
            }
        } else {
            match producer.idle_since {
                None => plan.mark_idle.push(producer.id),
                Some(since) if now.duration_since(since) > idle_grace => {
                    plan.retire.push(producer.id)
                }
                Some(_) => {}
            }
        }
    }

    // Records still occupy a slot until they are reaped; a retirement issued
    // above frees capacity only once the producer's task removes itself and
    // reconciliation runs again.
    let capacity = max_producers.saturating_sub(producers.len());
    plan.start = targets.into_iter().take(capacity).collect();

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demand(indices: &[usize]) -> BTreeSet<usize> {
        indices.iter().copied().collect()
    }

    fn producer(id: ProducerId, cursor: usize) -> ProducerView {
        ProducerView {
            id,
            cursor,
            idle_since: None,
            retiring: false,
        }
    }

    #[test]
    fn nearby_indices_merge_into_one_target() {
        assert_eq!(merge_targets(&demand(&[0, 3, 9])), [0]);
    }

    #[test]
    fn distant_indices_stay_separate() {
        assert_eq!(merge_targets(&demand(&[0, 19])), [0, 19]);
        assert_eq!(merge_targets(&demand(&[0, 10])), [0, 10]);
    }

    #[test]
    fn chained_clusters_merge_greedily() {
        // 12 rides with 4, 25 is past both windows.
        assert_eq!(merge_targets(&demand(&[4, 12, 25])), [4, 25]);
    }

    #[test]
    fn starts_one_producer_per_cluster() {
        let now = Instant::now();
        let p = plan(&demand(&[0, 3, 19]), &[], now, Duration::from_secs(5), 4);
        assert_eq!(p.start, [0, 19]);
        assert!(p.mark_idle.is_empty());
        assert!(p.retire.is_empty());
    }

    #[test]
    fn demand_near_existing_cursor_reuses_producer() {
        let now = Instant::now();
        let p = plan(
            &demand(&[3]),
            &[producer(0, 0)],
            now,
            Duration::from_secs(5),
            4,
        );
        assert!(p.start.is_empty());
        assert!(p.mark_idle.is_empty());
    }

    #[test]
    fn demand_behind_cursor_starts_fresh_producer() {
        // Transcoders cannot produce chunks behind their cursor.
        let now = Instant::now();
        let p = plan(
            &demand(&[2]),
            &[producer(0, 7)],
            now,
            Duration::from_secs(5),
            4,
        );
        assert_eq!(p.start, [2]);
        assert_eq!(p.mark_idle, [0]);
    }

    #[test]
    fn rematched_idle_producer_is_reactivated() {
        let now = Instant::now();
        let idle = ProducerView {
            idle_since: Some(now),
            ..producer(1, 5)
        };
        let p = plan(&demand(&[8]), &[idle], now, Duration::from_secs(5), 4);
        assert_eq!(p.mark_active, [1]);
        assert!(p.start.is_empty());
    }

    #[test]
    fn unmatched_producer_idles_then_retires() {
        let grace = Duration::from_secs(5);
        let now = Instant::now();

        let fresh = producer(0, 10);
        let p = plan(&demand(&[]), &[fresh], now, grace, 4);
        assert_eq!(p.mark_idle, [0]);
        assert!(p.retire.is_empty());

        let long_idle = ProducerView {
            idle_since: Some(now - Duration::from_secs(6)),
            ..fresh
        };
        let p = plan(&demand(&[]), &[long_idle], now, grace, 4);
        assert_eq!(p.retire, [0]);
        assert!(p.mark_idle.is_empty());
    }

    #[test]
    fn idle_within_grace_is_left_alone() {
        let now = Instant::now();
        let idling = ProducerView {
            idle_since: Some(now - Duration::from_secs(2)),
            ..producer(0, 10)
        };
        let p = plan(&demand(&[]), &[idling], now, Duration::from_secs(5), 4);
        assert!(p.retire.is_empty());
        assert!(p.mark_idle.is_empty());
    }

    #[test]
    fn retiring_producers_never_match() {
        let now = Instant::now();
        let dying = ProducerView {
            retiring: true,
            ..producer(0, 0)
        };
        let p = plan(&demand(&[3]), &[dying], now, Duration::from_secs(5), 4);
        // The dying producer covers index 3 but cannot serve it.
        assert_eq!(p.start, [3]);
    }

    #[test]
    fn producer_cap_defers_extra_starts() {
        let now = Instant::now();
        let p = plan(
            &demand(&[0, 20, 40]),
            &[producer(0, 100)],
            now,
            Duration::from_secs(5),
            2,
        );
        // One slot occupied, one free: lowest target starts first.
        assert_eq!(p.start, [0]);
    }

    #[test]
    fn three_viewers_near_and_far() {
        // 20-slot file: chunk 0 starts a producer, chunk 19 a second one,
        // chunk 3 merges into the first window.
        let now = Instant::now();
        let grace = Duration::from_secs(5);

        let p = plan(&demand(&[0]), &[], now, grace, 4);
        assert_eq!(p.start, [0]);

        let p = plan(&demand(&[0, 19]), &[producer(0, 0)], now, grace, 4);
        assert_eq!(p.start, [19]);

        let p = plan(
            &demand(&[0, 3, 19]),
            &[producer(0, 0), producer(1, 19)],
            now,
            grace,
            4,
        );
        assert!(p.start.is_empty());
    }
}
