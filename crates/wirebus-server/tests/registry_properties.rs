//! Property-based tests for subscription matching and dispatch.
//!
//! These tests verify the matching rules for all filter and peer
//! combinations, not just hand-picked addresses.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
};

use proptest::prelude::*;
use wirebus_server::{Subscription, SubscriptionRegistry};

fn any_ip() -> impl Strategy<Value = IpAddr> {
    any::<[u8; 4]>().prop_map(|octets| IpAddr::V4(Ipv4Addr::from(octets)))
}

/// Addresses drawn from a four-host pool, so filters and peers collide
/// often enough to exercise the matching branches.
fn pool_ip() -> impl Strategy<Value = IpAddr> {
    (0u8..4).prop_map(|last| IpAddr::V4(Ipv4Addr::new(192, 168, 0, last)))
}

fn subscription_for(filter: Option<IpAddr>) -> Subscription {
    match filter {
        None => Subscription::any(),
        Some(ip) => Subscription::for_peer(ip),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: data matches on the wildcard or on filter equality
    #[test]
    fn prop_data_matching_is_wildcard_or_exact(
        filter in prop::option::of(any_ip()),
        peer in any_ip()
    ) {
        let subscription = subscription_for(filter);

        prop_assert_eq!(subscription.filter(), filter);
        prop_assert_eq!(
            subscription.matches_data(peer),
            filter.is_none() || filter == Some(peer)
        );
    }

    /// Property: disconnects match only on filter equality, never the wildcard
    #[test]
    fn prop_disconnect_matching_requires_exact_equality(
        filter in prop::option::of(any_ip()),
        peer in any_ip()
    ) {
        let subscription = subscription_for(filter);

        prop_assert_eq!(subscription.matches_disconnect(peer), filter == Some(peer));
    }

    /// Property: disconnect dispatch hits exactly the equal filters, in
    /// insertion order
    #[test]
    fn prop_disconnect_dispatch_preserves_insertion_order(
        filters in prop::collection::vec(prop::option::of(pool_ip()), 0..16),
        peer in pool_ip()
    ) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();

        for (idx, filter) in filters.iter().enumerate() {
            let log = Arc::clone(&order);
            registry.subscribe(subscription_for(*filter).on_disconnect(move |_, _| {
                log.lock().unwrap().push(idx);
            }));
        }

        registry.dispatch_disconnect(peer, "peer closed the connection");

        let expected: Vec<usize> = filters
            .iter()
            .enumerate()
            .filter(|(_, filter)| **filter == Some(peer))
            .map(|(idx, _)| idx)
            .collect();
        prop_assert_eq!(order.lock().unwrap().clone(), expected);
    }

    /// Property: every subscribe grows the registry by one, nothing shrinks it
    #[test]
    fn prop_registry_is_append_only(
        filters in prop::collection::vec(prop::option::of(pool_ip()), 0..32)
    ) {
        let mut registry = SubscriptionRegistry::new();

        for (idx, filter) in filters.iter().enumerate() {
            registry.subscribe(subscription_for(*filter));
            prop_assert_eq!(registry.len(), idx + 1);
        }

        prop_assert_eq!(registry.is_empty(), filters.is_empty());
    }
}
