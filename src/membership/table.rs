// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Membership table and aggregation ledger
//!
//! The table maps each [`GroupMembershipKey`] to a shared entry holding its
//! [`StateMachine`]. Lock order is table -> entry; the table lock is never
//! taken while an entry lock is held. An entry whose machine drops back to
//! `NonMember` is marked retired under its own lock and then unlinked from
//! the table, so a caller that raced the removal sees the flag and retries
//! against a fresh entry.
//!
//! The ledger is a leaf lock that may be taken under an entry lock. It holds
//! the upstream reference counts per [`AggregationKey`] together with the
//! uplink that carried the aggregate's Join, the forwarding reference counts
//! per (device, port, group) and a per (device, group) source index used to
//! pick the upstream record on release. Each admitted key remembers the
//! aggregate it was counted under, so a release after a reconfiguration
//! still balances the counts it incremented.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::state_machine::{MemberState, StateMachine};
use super::{AggregationKey, AggregationMode, GroupMembershipKey};
use crate::protocols::GroupRecord;
use crate::{ConnectPoint, DeviceId, PortNumber};

/// One table slot
#[derive(Debug)]
pub struct MembershipEntry {
    retired: AtomicBool,
    machine: Mutex<StateMachine>,
}

impl MembershipEntry {
    fn new(key: GroupMembershipKey) -> Self {
        Self {
            retired: AtomicBool::new(false),
            machine: Mutex::new(StateMachine::new(key)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

/// Ledger outcome of a key becoming a member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Record to send upstream when the aggregate went 0 -> 1
    pub upstream: Option<GroupRecord>,
    /// Uplink the aggregate is signalled on
    pub uplink: Option<ConnectPoint>,
    /// Forwarding for (device, port, group) went 0 -> 1
    pub forwarding_add: bool,
}

/// Ledger outcome of a key leaving
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Release {
    /// Record to send upstream, on the uplink that carried the Join
    pub upstream: Option<GroupRecord>,
    pub uplink: Option<ConnectPoint>,
    /// Forwarding for (device, port, group) went 1 -> 0
    pub forwarding_remove: bool,
}

/// Upstream state of one aggregate
#[derive(Debug, Clone)]
struct Upstream {
    members: usize,
    uplink: Option<ConnectPoint>,
}

type ForwardingKey = (DeviceId, PortNumber, Ipv4Addr);
type SourceScope = (DeviceId, Ipv4Addr);

#[derive(Debug, Default)]
struct AggregationLedger {
    upstream: HashMap<AggregationKey, Upstream>,
    admitted: HashMap<GroupMembershipKey, AggregationKey>,
    forwarding: HashMap<ForwardingKey, usize>,
    sources: HashMap<SourceScope, HashMap<Option<Ipv4Addr>, usize>>,
}

fn increment<K: std::hash::Hash + Eq>(map: &mut HashMap<K, usize>, key: K) -> usize {
    let count = map.entry(key).or_insert(0);
    *count += 1;
    *count
}

/// Decrement, dropping the entry at zero. `None` if the key was unknown.
fn decrement<K: std::hash::Hash + Eq>(map: &mut HashMap<K, usize>, key: &K) -> Option<usize> {
    let count = map.get_mut(key)?;
    *count = count.saturating_sub(1);
    let remaining = *count;
    if remaining == 0 {
        map.remove(key);
    }
    Some(remaining)
}

impl AggregationLedger {
    fn admit(
        &mut self,
        key: &GroupMembershipKey,
        aggregate: &AggregationKey,
        uplink: Option<ConnectPoint>,
    ) -> Admission {
        if self.admitted.contains_key(key) {
            return Admission::default();
        }
        self.admitted.insert(key.clone(), aggregate.clone());

        let upstream = self
            .upstream
            .entry(aggregate.clone())
            .or_insert(Upstream { members: 0, uplink });
        upstream.members += 1;
        let first = upstream.members == 1;
        let uplink = upstream.uplink.clone();

        let forwarding_count =
            increment(&mut self.forwarding, (key.device.clone(), key.port, key.group));
        increment(
            self.sources
                .entry((key.device.clone(), key.group))
                .or_default(),
            key.source,
        );

        Admission {
            upstream: first.then(|| GroupRecord::join(key.group, key.source)),
            uplink,
            forwarding_add: forwarding_count == 1,
        }
    }

    fn release(&mut self, key: &GroupMembershipKey) -> Release {
        let Some(aggregate) = self.admitted.remove(key) else {
            return Release::default();
        };
        let (upstream_remaining, uplink) = match self.upstream.get_mut(&aggregate) {
            Some(upstream) => {
                upstream.members = upstream.members.saturating_sub(1);
                (upstream.members, upstream.uplink.clone())
            }
            None => (0, None),
        };
        if upstream_remaining == 0 {
            self.upstream.remove(&aggregate);
        }
        let forwarding_remaining =
            decrement(&mut self.forwarding, &(key.device.clone(), key.port, key.group));

        let scope = (key.device.clone(), key.group);
        if let Some(index) = self.sources.get_mut(&scope) {
            decrement(index, &key.source);
            if index.is_empty() {
                self.sources.remove(&scope);
            }
        }

        let upstream = if upstream_remaining > 0 {
            None
        } else {
            match aggregate {
                AggregationKey::Pod { .. } => Some(GroupRecord::leave(key.group)),
                AggregationKey::Subscriber(_) => self.release_record(key),
            }
        };

        Release {
            upstream,
            uplink,
            forwarding_remove: forwarding_remaining == Some(0),
        }
    }

    /// Upstream record for a subscriber key that just released, given what
    /// the rest of the device still holds for the group
    fn release_record(&self, key: &GroupMembershipKey) -> Option<GroupRecord> {
        let remaining = self.sources.get(&(key.device.clone(), key.group));
        let any_source = remaining.is_some_and(|index| index.contains_key(&None));
        if any_source {
            return None;
        }

        let mut others: Vec<Ipv4Addr> = remaining
            .map(|index| index.keys().flatten().copied().collect())
            .unwrap_or_default();
        others.sort();

        match key.source {
            Some(src) if others.contains(&src) => None,
            Some(src) if !others.is_empty() => Some(GroupRecord::block(key.group, src)),
            Some(_) => Some(GroupRecord::leave(key.group)),
            None if !others.is_empty() => Some(GroupRecord {
                sources: others,
                ..GroupRecord::leave(key.group)
            }),
            None => Some(GroupRecord::leave(key.group)),
        }
    }

    /// Reset, returning the forwarding entries that were installed
    fn clear(&mut self) -> Vec<ForwardingKey> {
        self.upstream.clear();
        self.admitted.clear();
        self.sources.clear();
        self.forwarding.drain().map(|(key, _)| key).collect()
    }
}

/// Key -> state machine table owned by the proxy
#[derive(Debug, Default)]
pub struct MembershipTable {
    entries: Mutex<HashMap<GroupMembershipKey, Arc<MembershipEntry>>>,
    ledger: Mutex<AggregationLedger>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<GroupMembershipKey, Arc<MembershipEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ledger(&self) -> MutexGuard<'_, AggregationLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomic insert-if-absent. A retired entry still linked in the table
    /// is replaced.
    pub fn lookup_or_create(&self, key: &GroupMembershipKey) -> Arc<MembershipEntry> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if !entry.is_retired() => Arc::clone(entry),
            _ => {
                let entry = Arc::new(MembershipEntry::new(key.clone()));
                entries.insert(key.clone(), Arc::clone(&entry));
                entry
            }
        }
    }

    pub fn get(&self, key: &GroupMembershipKey) -> Option<Arc<MembershipEntry>> {
        self.entries()
            .get(key)
            .filter(|entry| !entry.is_retired())
            .cloned()
    }

    pub fn contains(&self, key: &GroupMembershipKey) -> bool {
        self.get(key).is_some()
    }

    /// Run `f` on the machine for `key` under its entry lock.
    ///
    /// With `create` the entry is created if absent; without it `None` is
    /// returned for unknown keys. A machine left in `NonMember` after `f`
    /// is retired and unlinked.
    pub fn with_entry<R>(
        &self,
        key: &GroupMembershipKey,
        create: bool,
        mut f: impl FnMut(&mut StateMachine) -> R,
    ) -> Option<R> {
        loop {
            let entry = if create {
                self.lookup_or_create(key)
            } else {
                self.get(key)?
            };

            let mut machine = entry.lock();
            if entry.is_retired() {
                drop(machine);
                if create {
                    continue;
                }
                return None;
            }

            let result = f(&mut machine);
            let finished = !machine.is_member();
            if finished {
                entry.retire();
            }
            drop(machine);

            if finished {
                self.unlink(key, &entry);
            }
            return Some(result);
        }
    }

    fn unlink(&self, key: &GroupMembershipKey, entry: &Arc<MembershipEntry>) {
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(key);
        }
    }

    /// Retire and remove `key`. No-op if absent.
    pub fn remove(&self, key: &GroupMembershipKey) -> bool {
        let Some(entry) = self.get(key) else {
            return false;
        };
        {
            let _machine = entry.lock();
            entry.retire();
        }
        self.unlink(key, &entry);
        true
    }

    /// Active keys
    pub fn snapshot(&self) -> BTreeSet<GroupMembershipKey> {
        self.entries()
            .iter()
            .filter(|(_, entry)| !entry.is_retired())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Active keys with their current state, sorted by key
    pub fn states(&self) -> Vec<(GroupMembershipKey, MemberState)> {
        let entries: Vec<(GroupMembershipKey, Arc<MembershipEntry>)> = self
            .entries()
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        let mut states: Vec<_> = entries
            .into_iter()
            .filter_map(|(key, entry)| {
                let machine = entry.lock();
                (!entry.is_retired() && machine.is_member()).then(|| (key, machine.state()))
            })
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn keys_matching(
        &self,
        mut predicate: impl FnMut(&GroupMembershipKey) -> bool,
    ) -> Vec<GroupMembershipKey> {
        let mut keys: Vec<_> = self
            .entries()
            .iter()
            .filter(|(key, entry)| !entry.is_retired() && predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries()
            .values()
            .filter(|entry| !entry.is_retired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retire every entry and reset the ledger. Returns the (device, port,
    /// group) forwarding entries that were still counted.
    pub fn clear(&self) -> Vec<(DeviceId, PortNumber, Ipv4Addr)> {
        let drained: Vec<Arc<MembershipEntry>> =
            self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            let _machine = entry.lock();
            entry.retire();
        }
        let mut forwarding = self.ledger().clear();
        forwarding.sort();
        forwarding
    }

    /// Count `key` into the ledger under `aggregate`. Called once when the
    /// key becomes a member, under its entry lock. `uplink` is recorded
    /// only when the aggregate is new.
    pub fn admit(
        &self,
        key: &GroupMembershipKey,
        aggregate: &AggregationKey,
        uplink: Option<ConnectPoint>,
    ) -> Admission {
        self.ledger().admit(key, aggregate, uplink)
    }

    /// Count `key` out of the aggregate it was admitted under. Unknown keys
    /// are a no-op.
    pub fn release(&self, key: &GroupMembershipKey) -> Release {
        self.ledger().release(key)
    }

    /// Aggregate `key` was admitted under
    pub fn admitted_aggregate(&self, key: &GroupMembershipKey) -> Option<AggregationKey> {
        self.ledger().admitted.get(key).cloned()
    }

    /// Uplink carrying the upstream state of `key`'s aggregate
    pub fn upstream_uplink(&self, key: &GroupMembershipKey) -> Option<ConnectPoint> {
        let ledger = self.ledger();
        let aggregate = ledger.admitted.get(key)?;
        ledger.upstream.get(aggregate)?.uplink.clone()
    }

    pub fn upstream_refcount(&self, aggregate: &AggregationKey) -> usize {
        self.ledger()
            .upstream
            .get(aggregate)
            .map_or(0, |upstream| upstream.members)
    }

    pub fn forwarding_refcount(
        &self,
        device: &DeviceId,
        port: PortNumber,
        group: Ipv4Addr,
    ) -> usize {
        self.ledger()
            .forwarding
            .get(&(device.clone(), port, group))
            .copied()
            .unwrap_or(0)
    }

    /// Member keys of `group` on `device`
    pub fn group_member_count(&self, device: &DeviceId, group: Ipv4Addr) -> usize {
        self.ledger()
            .sources
            .get(&(device.clone(), group))
            .map_or(0, |index| index.values().sum())
    }

    /// Number of upstream aggregates currently joined
    pub fn upstream_group_count(&self) -> usize {
        self.ledger().upstream.len()
    }

    /// Aggregation key for `key` under `mode`
    pub fn aggregate_for(
        key: &GroupMembershipKey,
        mode: AggregationMode,
        aggregation_point: &str,
    ) -> AggregationKey {
        AggregationKey::for_key(key, mode, aggregation_point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipTimers;
    use crate::protocols::RecordType;
    use std::time::Instant;

    fn key(port: PortNumber, source: Option<&str>) -> GroupMembershipKey {
        GroupMembershipKey {
            device: DeviceId::from("of:0001"),
            port,
            vlan: 0,
            group: "239.1.1.1".parse().unwrap(),
            source: source.map(|s| s.parse().unwrap()),
        }
    }

    fn subscriber(k: &GroupMembershipKey) -> AggregationKey {
        AggregationKey::for_key(k, AggregationMode::PerSubscriber, "of:0001")
    }

    fn pod(k: &GroupMembershipKey) -> AggregationKey {
        AggregationKey::for_key(k, AggregationMode::PerPod, "pod-1")
    }

    #[test]
    fn test_lookup_or_create_is_idempotent() {
        let table = MembershipTable::new();
        let a = table.lookup_or_create(&key(1, None));
        let b = table.lookup_or_create(&key(1, None));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_with_entry_unlinks_non_member() {
        let table = MembershipTable::new();
        let k = key(1, None);
        let timers = MembershipTimers {
            fast_leave: true,
            ..Default::default()
        };
        let now = Instant::now();

        table.with_entry(&k, true, |sm| sm.on_join_report(now, &timers));
        assert_eq!(table.len(), 1);
        let old = table.get(&k).unwrap();

        table.with_entry(&k, false, |sm| sm.on_leave_report(now, &timers));
        assert!(table.is_empty());
        assert!(old.is_retired());
    }

    #[test]
    fn test_with_entry_without_create_ignores_unknown() {
        let table = MembershipTable::new();
        assert!(table.with_entry(&key(1, None), false, |_| ()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_retired_entry_is_replaced() {
        let table = MembershipTable::new();
        let k = key(1, None);
        let old = table.lookup_or_create(&k);
        old.retire();

        let fresh = table.lookup_or_create(&k);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(table.len(), 1);

        // Unlinking the stale entry must not drop its replacement
        table.unlink(&k, &old);
        assert!(table.contains(&k));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let table = MembershipTable::new();
        assert!(!table.remove(&key(9, None)));
    }

    #[test]
    fn test_upstream_join_only_on_first_pod_member() {
        let table = MembershipTable::new();
        let (a, b) = (key(1, None), key(2, None));

        let first = table.admit(&a, &pod(&a), None);
        assert_eq!(first.upstream.unwrap().record_type, RecordType::ChangeToExcludeMode);
        assert!(first.forwarding_add);

        let second = table.admit(&b, &pod(&b), None);
        assert!(second.upstream.is_none());
        assert!(second.forwarding_add);
        assert_eq!(table.upstream_refcount(&pod(&a)), 2);

        assert!(table.release(&a).upstream.is_none());
        let last = table.release(&b);
        assert_eq!(last.upstream, Some(GroupRecord::leave(a.group)));
        assert_eq!(table.upstream_group_count(), 0);
    }

    #[test]
    fn test_forwarding_refcount_per_port() {
        let table = MembershipTable::new();
        let (a, b) = (key(1, Some("10.0.0.1")), key(1, Some("10.0.0.2")));
        assert!(table.admit(&a, &subscriber(&a), None).forwarding_add);
        assert!(!table.admit(&b, &subscriber(&b), None).forwarding_add);
        assert_eq!(table.forwarding_refcount(&a.device, 1, a.group), 2);

        assert!(!table.release(&a).forwarding_remove);
        assert!(table.release(&b).forwarding_remove);
    }

    #[test]
    fn test_source_release_blocks_when_other_sources_remain() {
        let table = MembershipTable::new();
        let (a, b) = (key(1, Some("10.0.0.1")), key(1, Some("10.0.0.2")));
        table.admit(&a, &subscriber(&a), None);
        table.admit(&b, &subscriber(&b), None);

        let release = table.release(&a);
        assert_eq!(
            release.upstream,
            Some(GroupRecord::block(a.group, "10.0.0.1".parse().unwrap()))
        );

        let release = table.release(&b);
        assert_eq!(release.upstream, Some(GroupRecord::leave(b.group)));
    }

    #[test]
    fn test_release_silent_while_any_source_member_remains() {
        let table = MembershipTable::new();
        let (star, src) = (key(1, None), key(2, Some("10.0.0.1")));
        table.admit(&star, &subscriber(&star), None);
        table.admit(&src, &subscriber(&src), None);

        assert!(table.release(&src).upstream.is_none());
    }

    #[test]
    fn test_release_silent_while_same_source_held_elsewhere() {
        let table = MembershipTable::new();
        let (a, b) = (key(1, Some("10.0.0.1")), key(2, Some("10.0.0.1")));
        table.admit(&a, &subscriber(&a), None);
        table.admit(&b, &subscriber(&b), None);

        assert!(table.release(&a).upstream.is_none());
    }

    #[test]
    fn test_any_source_release_switches_to_include() {
        let table = MembershipTable::new();
        let (star, src) = (key(1, None), key(2, Some("10.0.0.1")));
        table.admit(&star, &subscriber(&star), None);
        table.admit(&src, &subscriber(&src), None);

        let record = table.release(&star).upstream.unwrap();
        assert_eq!(record.record_type, RecordType::ChangeToIncludeMode);
        assert_eq!(record.sources, vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let table = MembershipTable::new();
        let k = key(1, None);
        assert_eq!(table.release(&k), Release::default());
    }

    #[test]
    fn test_double_admit_counts_once() {
        let table = MembershipTable::new();
        let k = key(1, None);
        assert!(table.admit(&k, &subscriber(&k), None).forwarding_add);
        assert_eq!(table.admit(&k, &subscriber(&k), None), Admission::default());
        assert_eq!(table.upstream_refcount(&subscriber(&k)), 1);
    }

    #[test]
    fn test_release_uses_admitted_aggregate() {
        let table = MembershipTable::new();
        let k = key(1, None);
        table.admit(&k, &subscriber(&k), None);
        assert_eq!(table.admitted_aggregate(&k), Some(subscriber(&k)));

        // Whatever the aggregation config is now, the counts balance
        let release = table.release(&k);
        assert_eq!(release.upstream, Some(GroupRecord::leave(k.group)));
        assert!(release.forwarding_remove);
        assert_eq!(table.upstream_group_count(), 0);
        assert_eq!(table.forwarding_refcount(&k.device, 1, k.group), 0);
        assert_eq!(table.admitted_aggregate(&k), None);
    }

    #[test]
    fn test_aggregate_keeps_first_uplink() {
        let table = MembershipTable::new();
        let a = key(1, None);
        let mut b = key(1, None);
        b.device = DeviceId::from("of:0002");
        let uplink_a = ConnectPoint::new(a.device.clone(), 100);
        let uplink_b = ConnectPoint::new(b.device.clone(), 100);

        let first = table.admit(&a, &pod(&a), Some(uplink_a.clone()));
        assert_eq!(first.uplink, Some(uplink_a.clone()));
        let second = table.admit(&b, &pod(&b), Some(uplink_b));
        assert!(second.upstream.is_none());
        assert_eq!(table.upstream_uplink(&b), Some(uplink_a.clone()));

        assert!(table.release(&a).upstream.is_none());
        let last = table.release(&b);
        assert_eq!(last.upstream, Some(GroupRecord::leave(b.group)));
        assert_eq!(last.uplink, Some(uplink_a));
    }

    #[test]
    fn test_clear_resets_everything() {
        let table = MembershipTable::new();
        let k = key(1, None);
        let entry = table.lookup_or_create(&k);
        table.admit(&k, &subscriber(&k), None);
        assert_eq!(table.group_member_count(&k.device, k.group), 1);
        let forwarding = table.clear();
        assert_eq!(forwarding, vec![(k.device.clone(), 1, k.group)]);

        assert!(table.is_empty());
        assert!(entry.is_retired());
        assert_eq!(table.upstream_refcount(&subscriber(&k)), 0);
        assert_eq!(table.forwarding_refcount(&k.device, 1, k.group), 0);
    }

    #[test]
    fn test_states_and_snapshot() {
        let table = MembershipTable::new();
        let timers = MembershipTimers::default();
        let now = Instant::now();
        for port in [2, 1] {
            table.with_entry(&key(port, None), true, |sm| sm.on_join_report(now, &timers));
        }
        let states = table.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].0.port, 1);
        assert_eq!(states[0].1, MemberState::MemberIdle);
        assert_eq!(table.snapshot().len(), 2);
        assert_eq!(table.keys_matching(|k| k.port == 2).len(), 1);
    }
}
