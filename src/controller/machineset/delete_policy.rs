//! Scale-down victim selection
//!
//! Every candidate falls into one bucket; buckets are drained in priority
//! order and the policy only breaks ties inside a bucket.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::crd::{DeletePolicy, Machine, MachinePhase};

/// Deletion bucket, highest priority first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeletePriority {
    /// Already has a deletionTimestamp
    MustDelete,
    /// Carries a delete-machine annotation
    MarkedByAnnotation,
    /// Provider reported an error
    Unhealthy,
    /// No Node yet, or not Running
    NotYetRunning,
    Remaining,
}

pub fn classify(machine: &Machine) -> DeletePriority {
    if machine.is_deleting() {
        DeletePriority::MustDelete
    } else if machine.is_marked_for_deletion() {
        DeletePriority::MarkedByAnnotation
    } else if machine.has_error() {
        DeletePriority::Unhealthy
    } else if machine.node_ref().is_none() || machine.phase() != Some(MachinePhase::Running) {
        DeletePriority::NotYetRunning
    } else {
        DeletePriority::Remaining
    }
}

/// Creation time, with the zero time treated as absent.
fn created(machine: &Machine) -> Option<DateTime<Utc>> {
    machine.creation_time().filter(|t| t.timestamp() != 0)
}

/// Order two creation times; absent times always sort last.
fn by_age(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>, newest_first: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) if newest_first => b.cmp(&a),
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

/// Pick up to `count` Machines to delete, in deletion order.
///
/// Returns all candidates when `count` exceeds their number. For `Random`
/// the order inside a bucket comes from `rng`, so a seeded rng gives a
/// stable order.
pub fn select<'a, R: Rng + ?Sized>(
    policy: DeletePolicy,
    machines: &'a [Machine],
    count: usize,
    rng: &mut R,
) -> Vec<&'a Machine> {
    let mut ordered: Vec<&Machine> = machines.iter().collect();

    match policy {
        DeletePolicy::Random => {
            ordered.shuffle(rng);
            // stable sort keeps the shuffled order inside each bucket
            ordered.sort_by_key(|m| classify(m));
        }
        DeletePolicy::Newest | DeletePolicy::Oldest => {
            let newest_first = policy == DeletePolicy::Newest;
            ordered.sort_by(|a, b| {
                classify(a)
                    .cmp(&classify(b))
                    .then_with(|| by_age(created(a), created(b), newest_first))
                    .then_with(|| a.name_any().cmp(&b.name_any()))
            });
        }
    }

    ordered.truncate(count);
    ordered
}
