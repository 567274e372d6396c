//! Set differences over balancer entities.
//!
//! Entities carry their own equality predicate (composite port key, backend
//! identity), so these work on slices with an explicit `equals` instead of
//! hashing.

use crate::model::{BalancerPort, FILTER_WILDCARD, Filter, Instance};

/// Items of `target` with no equal item in `other`, in `target` order.
pub fn differences<T, F>(target: &[T], other: &[T], equals: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    target
        .iter()
        .filter(|item| !other.iter().any(|o| equals(item, o)))
        .cloned()
        .collect()
}

/// Ports of `target` missing from `other`, keyed by name and port pair.
pub fn port_differences<T: BalancerPort>(target: &[T], other: &[T]) -> Vec<T> {
    differences(target, other, |a, b| a.same_port(b))
}

/// Backends of `target` missing from `other`.
pub fn instance_differences(target: &[Instance], other: &[Instance]) -> Vec<Instance> {
    differences(target, other, Instance::same_backend)
}

/// Filter changes turning `current` into `desired`: additions first, then
/// removals. The wildcard address is never added or removed.
pub fn filter_changes(desired: &[String], current: &[String]) -> Vec<Filter> {
    let additions = differences(desired, current, |a, b| a == b)
        .into_iter()
        .filter(|ip| ip != FILTER_WILDCARD)
        .map(Filter::add);
    let removals = differences(current, desired, |a, b| a == b)
        .into_iter()
        .filter(|ip| ip != FILTER_WILDCARD)
        .map(Filter::remove);
    additions.chain(removals).collect()
}
