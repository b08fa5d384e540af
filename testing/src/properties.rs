//! Property-based testing strategies for correlation scenarios.

use correlator_core::{CorrelationId, Event, Message};
use proptest::prelude::*;

/// Group sizes worth exercising: trivial, small and large.
pub fn group_size() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1_usize), Just(2), Just(5), Just(100), 3_usize..20]
}

/// A correlation id made of lowercase words.
pub fn correlation_id() -> impl Strategy<Value = CorrelationId> {
    "[a-z]{3,8}-[0-9]{1,4}".prop_map(CorrelationId::from)
}

/// A random permutation of `0..size`, i.e. one arrival order.
pub fn arrival_order(size: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..size).collect::<Vec<_>>()).prop_shuffle()
}

/// A group size together with one arrival order for it.
pub fn group_arrivals() -> impl Strategy<Value = (usize, Vec<usize>)> {
    group_size().prop_flat_map(|size| (Just(size), arrival_order(size)))
}

/// The `size` members of one event group, each tagged with its sequence.
#[must_use]
pub fn group_events(id: &CorrelationId, size: usize) -> Vec<Event> {
    (0..size)
        .map(|sequence| {
            Event::new(Message::text(format!("part-{sequence}")))
                .with_correlation_id(id.clone())
                .with_correlation_group_size(size)
                .with_correlation_sequence(sequence)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn arrival_order_is_a_permutation((size, order) in group_arrivals()) {
            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..size).collect::<Vec<_>>());
        }

        #[test]
        fn group_events_share_the_id(id in correlation_id(), size in group_size()) {
            let events = group_events(&id, size);
            prop_assert_eq!(events.len(), size);
            prop_assert!(events.iter().all(|e| e.correlation_id() == Some(&id)));
        }
    }
}
