// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use crate::request::ClientId;

/// Per-client virtual token counters.
///
/// Counters only grow. A client seen for the first time starts at the lowest
/// existing counter so it neither starves incumbents nor inherits a backlog of
/// priority it never earned. Entries are never removed; a client that goes
/// quiet and comes back keeps its counter.
#[derive(Debug, Clone, Default)]
pub struct VirtualCounterLedger {
    counters: BTreeMap<ClientId, f64>,
}

impl VirtualCounterLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `client` if it is new. Returns the client's counter.
    pub fn on_arrival(&mut self, client: ClientId) -> f64 {
        if let Some(counter) = self.counters.get(&client) {
            return *counter;
        }
        let initial = self.min().unwrap_or(0.0);
        self.counters.insert(client, initial);
        tracing::trace!(client_id = %client, counter = initial, "tracking new client");
        initial
    }

    /// Add `service_units` to the client's counter.
    ///
    /// Negative or non-finite charges are dropped so counters stay monotone.
    pub fn charge(&mut self, client: ClientId, service_units: f64) {
        if !service_units.is_finite() || service_units < 0.0 {
            tracing::warn!(
                client_id = %client,
                service_units,
                "ignoring invalid service charge"
            );
            return;
        }
        *self.counters.entry(client).or_insert(0.0) += service_units;
    }

    /// Counter of `client`, or 0.0 when the client is unknown.
    pub fn get(&self, client: ClientId) -> f64 {
        self.counters.get(&client).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.counters.contains_key(&client)
    }

    /// Lowest counter across all tracked clients.
    pub fn min(&self) -> Option<f64> {
        self.counters.values().copied().reduce(f64::min)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate counters in client order.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, f64)> + '_ {
        self.counters.iter().map(|(client, counter)| (*client, *counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_client_starts_at_zero() {
        let mut ledger = VirtualCounterLedger::new();
        assert_eq!(ledger.on_arrival(ClientId(3)), 0.0);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_new_client_starts_at_min() {
        let mut ledger = VirtualCounterLedger::new();
        ledger.on_arrival(ClientId(0));
        ledger.on_arrival(ClientId(1));
        ledger.charge(ClientId(0), 10.0);
        ledger.charge(ClientId(1), 4.0);

        assert_eq!(ledger.on_arrival(ClientId(2)), 4.0);
        assert_eq!(ledger.get(ClientId(2)), 4.0);
    }

    #[test]
    fn test_known_client_arrival_is_noop() {
        let mut ledger = VirtualCounterLedger::new();
        ledger.on_arrival(ClientId(0));
        ledger.charge(ClientId(0), 7.5);

        assert_eq!(ledger.on_arrival(ClientId(0)), 7.5);
        assert_eq!(ledger.get(ClientId(0)), 7.5);
    }

    #[test]
    fn test_charge_creates_unknown_client_at_zero() {
        let mut ledger = VirtualCounterLedger::new();
        ledger.on_arrival(ClientId(0));
        ledger.charge(ClientId(0), 100.0);

        ledger.charge(ClientId(9), 2.0);
        assert_eq!(ledger.get(ClientId(9)), 2.0);
    }

    #[test]
    fn test_invalid_charges_are_ignored() {
        let mut ledger = VirtualCounterLedger::new();
        ledger.charge(ClientId(0), 5.0);
        ledger.charge(ClientId(0), -1.0);
        ledger.charge(ClientId(0), f64::NAN);
        ledger.charge(ClientId(0), f64::INFINITY);

        assert_eq!(ledger.get(ClientId(0)), 5.0);
    }

    #[test]
    fn test_unknown_client_reads_zero() {
        let ledger = VirtualCounterLedger::new();
        assert_eq!(ledger.get(ClientId(42)), 0.0);
        assert!(ledger.min().is_none());
    }
}
