// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-(device, port, vlan, group, source) membership state machine
//!
//! ```text
//! NonMember --join--> MemberIdle --upstream query--> MemberTimerRunning
//!                      |   ^   ^                         |
//!                      |   |   +---- response sent ------+
//!                    leave |
//!                      v   | report
//!                   DelayMember --last query timeout--> NonMember
//! MemberIdle / MemberTimerRunning --membership expiry--> NonMember
//! ```
//!
//! The machine is pure: transitions return a [`Step`] describing what the
//! controller has to do (signal upstream, query downstream, arm timers).
//! Every armed timer is stamped with a fresh generation; a firing whose
//! generation no longer matches the armed slot lost a race with a
//! transition and is skipped.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::GroupMembershipKey;
use crate::timer::{TimerRequest, TimerType};

pub const DEFAULT_GROUP_MEMBERSHIP_INTERVAL: Duration = Duration::from_secs(260);
pub const DEFAULT_LAST_MEMBER_QUERY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LAST_MEMBER_QUERY_COUNT: u8 = 2;

/// Timing policy applied to every state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipTimers {
    /// Membership lifetime without a refreshing report
    pub group_membership_interval: Duration,
    /// Spacing of last-member queries, also their max response time
    pub last_member_query_interval: Duration,
    /// Number of last-member queries before a leave is confirmed
    pub last_member_query_count: u8,
    /// Confirm leaves immediately, without a last-member query
    pub fast_leave: bool,
}

impl Default for MembershipTimers {
    fn default() -> Self {
        Self {
            group_membership_interval: DEFAULT_GROUP_MEMBERSHIP_INTERVAL,
            last_member_query_interval: DEFAULT_LAST_MEMBER_QUERY_INTERVAL,
            last_member_query_count: DEFAULT_LAST_MEMBER_QUERY_COUNT,
            fast_leave: false,
        }
    }
}

impl MembershipTimers {
    /// Length of the leave confirmation window
    pub fn last_member_query_time(&self) -> Duration {
        self.last_member_query_interval * self.last_member_query_count.max(1) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    /// No interest; the entry is about to be removed
    NonMember,
    /// Leave heard, last-member query outstanding
    DelayMember,
    /// Member with a deferred upstream query response pending
    MemberTimerRunning,
    /// Member, steady state
    MemberIdle,
}

impl MemberState {
    pub fn is_member(self) -> bool {
        !matches!(self, MemberState::NonMember)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Membership,
    LastMemberQuery,
    QueryResponse,
}

impl TimerKind {
    pub fn timer_type(self, key: &GroupMembershipKey) -> TimerType {
        match self {
            TimerKind::Membership => TimerType::MembershipExpiry(key.clone()),
            TimerKind::LastMemberQuery => TimerType::LastMemberQuery(key.clone()),
            TimerKind::QueryResponse => TimerType::QueryResponse(key.clone()),
        }
    }

    pub fn of(timer_type: &TimerType) -> Option<Self> {
        match timer_type {
            TimerType::MembershipExpiry(_) => Some(TimerKind::Membership),
            TimerType::LastMemberQuery(_) => Some(TimerKind::LastMemberQuery),
            TimerType::QueryResponse(_) => Some(TimerKind::QueryResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    due: Instant,
    generation: u64,
}

/// Outstanding last-member query for a key in `DelayMember`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingQuery {
    pub max_resp: Duration,
    /// Queries still to send after the current one
    pub remaining: u8,
    /// End of the confirmation window
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// No report during the last-member query window
    LeaveConfirmed,
    /// Leave accepted without a last-member query
    FastLeave,
    /// No refreshing report within the group membership interval
    MembershipExpired,
}

impl LeaveReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            LeaveReason::LeaveConfirmed => "leave-confirmed",
            LeaveReason::FastLeave => "fast-leave",
            LeaveReason::MembershipExpired => "membership-expired",
        }
    }
}

/// Work the controller must carry out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAction {
    /// NonMember -> member: admit into the aggregation ledger
    Joined,
    /// Duplicate join, timer refreshed
    Refreshed,
    /// A report arrived while a leave was pending
    LeaveCancelled,
    /// Send a group-specific query to the subscriber port
    QueryDownstream { max_resp: Duration },
    /// Member -> NonMember: release from the ledger and drop the entry
    Left(LeaveReason),
    /// Answer an upstream query with a current-state report
    ReportUpstream,
}

/// Why an event had no effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Skipped {
    NotMember,
    AlreadyLeaving,
    TimerRaceLost,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub actions: Vec<MemberAction>,
    pub timers: Vec<TimerRequest>,
    pub cancelled: Vec<TimerType>,
    pub skipped: Option<Skipped>,
}

impl Step {
    fn skipped(reason: Skipped) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Membership state for one key
#[derive(Debug, Clone)]
pub struct StateMachine {
    key: GroupMembershipKey,
    state: MemberState,
    generation: u64,
    report_count: u64,
    last_report: Option<Instant>,
    membership_timer: Option<Armed>,
    query_timer: Option<Armed>,
    response_timer: Option<Armed>,
    pending_query: Option<PendingQuery>,
}

impl StateMachine {
    pub fn new(key: GroupMembershipKey) -> Self {
        Self {
            key,
            state: MemberState::NonMember,
            generation: 0,
            report_count: 0,
            last_report: None,
            membership_timer: None,
            query_timer: None,
            response_timer: None,
            pending_query: None,
        }
    }

    pub fn key(&self) -> &GroupMembershipKey {
        &self.key
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn is_member(&self) -> bool {
        self.state.is_member()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports seen since the key became a member
    pub fn report_count(&self) -> u64 {
        self.report_count
    }

    pub fn last_report(&self) -> Option<Instant> {
        self.last_report
    }

    pub fn pending_query(&self) -> Option<&PendingQuery> {
        self.pending_query.as_ref()
    }

    pub fn membership_expires_at(&self) -> Option<Instant> {
        self.membership_timer.map(|a| a.due)
    }

    pub fn response_due_at(&self) -> Option<Instant> {
        self.response_timer.map(|a| a.due)
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<Armed> {
        match kind {
            TimerKind::Membership => &mut self.membership_timer,
            TimerKind::LastMemberQuery => &mut self.query_timer,
            TimerKind::QueryResponse => &mut self.response_timer,
        }
    }

    fn arm(&mut self, kind: TimerKind, due: Instant) -> TimerRequest {
        self.generation += 1;
        let generation = self.generation;
        *self.slot(kind) = Some(Armed { due, generation });
        TimerRequest::once(kind.timer_type(&self.key), due, generation)
    }

    fn disarm(&mut self, kind: TimerKind, step: &mut Step) {
        if self.slot(kind).take().is_some() {
            step.cancelled.push(kind.timer_type(&self.key));
        }
    }

    fn become_non_member(&mut self, reason: LeaveReason, step: &mut Step) {
        self.state = MemberState::NonMember;
        self.pending_query = None;
        self.report_count = 0;
        self.disarm(TimerKind::Membership, step);
        self.disarm(TimerKind::LastMemberQuery, step);
        self.disarm(TimerKind::QueryResponse, step);
        // Invalidate anything still in flight
        self.generation += 1;
        step.actions.push(MemberAction::Left(reason));
    }

    /// A membership report (join) for this key
    pub fn on_join_report(&mut self, now: Instant, timers: &MembershipTimers) -> Step {
        let mut step = Step::default();
        self.last_report = Some(now);
        self.report_count += 1;

        match self.state {
            MemberState::NonMember => {
                self.state = MemberState::MemberIdle;
                self.report_count = 1;
                step.actions.push(MemberAction::Joined);
            }
            MemberState::MemberIdle | MemberState::MemberTimerRunning => {
                step.actions.push(MemberAction::Refreshed);
            }
            MemberState::DelayMember => {
                self.pending_query = None;
                self.disarm(TimerKind::LastMemberQuery, &mut step);
                self.state = MemberState::MemberIdle;
                step.actions.push(MemberAction::Refreshed);
                step.actions.push(MemberAction::LeaveCancelled);
            }
        }

        let expiry = now + timers.group_membership_interval;
        step.timers.push(self.arm(TimerKind::Membership, expiry));
        step
    }

    /// A leave (v2 Leave Group, v3 TO_IN{} or BLOCK) for this key
    pub fn on_leave_report(&mut self, now: Instant, timers: &MembershipTimers) -> Step {
        match self.state {
            MemberState::NonMember => Step::skipped(Skipped::NotMember),
            MemberState::DelayMember => Step::skipped(Skipped::AlreadyLeaving),
            MemberState::MemberIdle | MemberState::MemberTimerRunning => {
                let mut step = Step::default();
                if timers.fast_leave {
                    self.become_non_member(LeaveReason::FastLeave, &mut step);
                    return step;
                }

                // Interest is in doubt, so a pending upstream answer is dropped
                self.disarm(TimerKind::QueryResponse, &mut step);
                self.state = MemberState::DelayMember;

                let interval = timers.last_member_query_interval;
                self.pending_query = Some(PendingQuery {
                    max_resp: interval,
                    remaining: timers.last_member_query_count.max(1) - 1,
                    expires_at: now + timers.last_member_query_time(),
                });
                step.actions.push(MemberAction::QueryDownstream { max_resp: interval });
                step.timers.push(self.arm(TimerKind::LastMemberQuery, now + interval));
                step
            }
        }
    }

    /// The last-member query timer fired
    pub fn on_query_timeout(
        &mut self,
        generation: u64,
        now: Instant,
        timers: &MembershipTimers,
    ) -> Step {
        if !self.accepts(TimerKind::LastMemberQuery, generation) {
            return Step::skipped(Skipped::TimerRaceLost);
        }
        self.query_timer = None;

        let mut step = Step::default();
        match self.pending_query {
            Some(ref mut pending) if pending.remaining > 0 => {
                pending.remaining -= 1;
                let max_resp = pending.max_resp;
                step.actions.push(MemberAction::QueryDownstream { max_resp });
                let next = now + timers.last_member_query_interval;
                step.timers.push(self.arm(TimerKind::LastMemberQuery, next));
            }
            _ => self.become_non_member(LeaveReason::LeaveConfirmed, &mut step),
        }
        step
    }

    /// The steady-state membership timer fired
    pub fn on_membership_timer_expiry(&mut self, generation: u64) -> Step {
        if !self.accepts(TimerKind::Membership, generation) {
            return Step::skipped(Skipped::TimerRaceLost);
        }
        let mut step = Step::default();
        self.become_non_member(LeaveReason::MembershipExpired, &mut step);
        step
    }

    /// An upstream query covers this key.
    ///
    /// `delay` is the chosen response delay; zero answers immediately. A
    /// response that is already pending keeps the earlier deadline.
    pub fn on_upstream_query(&mut self, delay: Duration, now: Instant) -> Step {
        let mut step = Step::default();
        match self.state {
            MemberState::NonMember | MemberState::DelayMember => {
                step.skipped = Some(Skipped::NotMember);
            }
            MemberState::MemberIdle if delay.is_zero() => {
                step.actions.push(MemberAction::ReportUpstream);
            }
            MemberState::MemberIdle => {
                self.state = MemberState::MemberTimerRunning;
                step.timers.push(self.arm(TimerKind::QueryResponse, now + delay));
            }
            MemberState::MemberTimerRunning => {
                let due = now + delay;
                let earlier = self.response_timer.map_or(true, |armed| due < armed.due);
                if delay.is_zero() {
                    self.state = MemberState::MemberIdle;
                    self.disarm(TimerKind::QueryResponse, &mut step);
                    step.actions.push(MemberAction::ReportUpstream);
                } else if earlier {
                    step.timers.push(self.arm(TimerKind::QueryResponse, due));
                }
            }
        }
        step
    }

    /// The deferred query-response timer fired
    pub fn on_response_timer(&mut self, generation: u64) -> Step {
        if !self.accepts(TimerKind::QueryResponse, generation) {
            return Step::skipped(Skipped::TimerRaceLost);
        }
        self.response_timer = None;
        let mut step = Step::default();
        if self.state == MemberState::MemberTimerRunning {
            self.state = MemberState::MemberIdle;
            step.actions.push(MemberAction::ReportUpstream);
        }
        step
    }

    /// Dispatch a timer firing to the matching transition
    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        generation: u64,
        now: Instant,
        timers: &MembershipTimers,
    ) -> Step {
        match kind {
            TimerKind::Membership => self.on_membership_timer_expiry(generation),
            TimerKind::LastMemberQuery => self.on_query_timeout(generation, now, timers),
            TimerKind::QueryResponse => self.on_response_timer(generation),
        }
    }

    /// Armed timers due at `now`, leave processing first
    pub fn due_timers(&self, now: Instant) -> Vec<(TimerKind, u64)> {
        [
            (TimerKind::LastMemberQuery, self.query_timer),
            (TimerKind::QueryResponse, self.response_timer),
            (TimerKind::Membership, self.membership_timer),
        ]
        .into_iter()
        .filter_map(|(kind, armed)| match armed {
            Some(a) if a.due <= now => Some((kind, a.generation)),
            _ => None,
        })
        .collect()
    }

    fn accepts(&self, kind: TimerKind, generation: u64) -> bool {
        let armed = match kind {
            TimerKind::Membership => self.membership_timer,
            TimerKind::LastMemberQuery => self.query_timer,
            TimerKind::QueryResponse => self.response_timer,
        };
        self.state.is_member() && armed.map(|a| a.generation) == Some(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceId;

    fn key() -> GroupMembershipKey {
        GroupMembershipKey {
            device: DeviceId::from("of:0001"),
            port: 1,
            vlan: 0,
            group: "239.1.1.1".parse().unwrap(),
            source: None,
        }
    }

    fn joined(now: Instant) -> StateMachine {
        let mut sm = StateMachine::new(key());
        sm.on_join_report(now, &MembershipTimers::default());
        sm
    }

    fn armed_generation(step: &Step) -> u64 {
        step.timers.last().map(|t| t.generation).unwrap()
    }

    #[test]
    fn test_first_join_becomes_member() {
        let now = Instant::now();
        let mut sm = StateMachine::new(key());
        let step = sm.on_join_report(now, &MembershipTimers::default());

        assert_eq!(sm.state(), MemberState::MemberIdle);
        assert_eq!(step.actions, vec![MemberAction::Joined]);
        assert_eq!(step.timers.len(), 1);
        assert_eq!(step.timers[0].timer_type, TimerType::MembershipExpiry(key()));
        assert_eq!(step.timers[0].fire_at, now + DEFAULT_GROUP_MEMBERSHIP_INTERVAL);
    }

    #[test]
    fn test_duplicate_join_only_refreshes() {
        let now = Instant::now();
        let mut sm = joined(now);
        let later = now + Duration::from_secs(30);
        let step = sm.on_join_report(later, &MembershipTimers::default());

        assert_eq!(step.actions, vec![MemberAction::Refreshed]);
        assert_eq!(sm.report_count(), 2);
        assert_eq!(
            sm.membership_expires_at(),
            Some(later + DEFAULT_GROUP_MEMBERSHIP_INTERVAL)
        );
    }

    #[test]
    fn test_leave_starts_last_member_query() {
        let now = Instant::now();
        let mut sm = joined(now);
        let step = sm.on_leave_report(now, &MembershipTimers::default());

        assert_eq!(sm.state(), MemberState::DelayMember);
        assert_eq!(
            step.actions,
            vec![MemberAction::QueryDownstream {
                max_resp: DEFAULT_LAST_MEMBER_QUERY_INTERVAL
            }]
        );
        let pending = sm.pending_query().unwrap();
        assert_eq!(pending.remaining, 1);
        assert_eq!(pending.expires_at, now + Duration::from_secs(2));
    }

    #[test]
    fn test_leave_confirmed_after_query_window() {
        let timers = MembershipTimers::default();
        let now = Instant::now();
        let mut sm = joined(now);
        let step = sm.on_leave_report(now, &timers);
        let gen1 = armed_generation(&step);

        // First timeout retransmits the query
        let t1 = now + Duration::from_secs(1);
        let step = sm.on_query_timeout(gen1, t1, &timers);
        assert!(matches!(step.actions[0], MemberAction::QueryDownstream { .. }));
        let gen2 = armed_generation(&step);

        // Second timeout confirms
        let step = sm.on_query_timeout(gen2, t1 + Duration::from_secs(1), &timers);
        assert_eq!(
            step.actions,
            vec![MemberAction::Left(LeaveReason::LeaveConfirmed)]
        );
        assert_eq!(sm.state(), MemberState::NonMember);
        assert!(step.cancelled.contains(&TimerType::MembershipExpiry(key())));
    }

    #[test]
    fn test_report_during_leave_window_cancels_leave() {
        let timers = MembershipTimers::default();
        let now = Instant::now();
        let mut sm = joined(now);
        let leave = sm.on_leave_report(now, &timers);
        let stale = armed_generation(&leave);

        let step = sm.on_join_report(now + Duration::from_millis(500), &timers);
        assert_eq!(
            step.actions,
            vec![MemberAction::Refreshed, MemberAction::LeaveCancelled]
        );
        assert_eq!(sm.state(), MemberState::MemberIdle);
        assert!(sm.pending_query().is_none());

        // The query timer that was already in flight is now stale
        let step = sm.on_query_timeout(stale, now + Duration::from_secs(1), &timers);
        assert_eq!(step.skipped, Some(Skipped::TimerRaceLost));
        assert!(sm.is_member());
    }

    #[test]
    fn test_fast_leave() {
        let timers = MembershipTimers {
            fast_leave: true,
            ..Default::default()
        };
        let now = Instant::now();
        let mut sm = joined(now);
        let step = sm.on_leave_report(now, &timers);
        assert_eq!(step.actions, vec![MemberAction::Left(LeaveReason::FastLeave)]);
        assert!(!sm.is_member());
    }

    #[test]
    fn test_leave_for_non_member_is_skipped() {
        let mut sm = StateMachine::new(key());
        let step = sm.on_leave_report(Instant::now(), &MembershipTimers::default());
        assert_eq!(step.skipped, Some(Skipped::NotMember));
    }

    #[test]
    fn test_repeated_leave_does_not_restart_window() {
        let timers = MembershipTimers::default();
        let now = Instant::now();
        let mut sm = joined(now);
        sm.on_leave_report(now, &timers);
        let step = sm.on_leave_report(now + Duration::from_millis(100), &timers);
        assert_eq!(step.skipped, Some(Skipped::AlreadyLeaving));
        assert_eq!(sm.pending_query().unwrap().expires_at, now + Duration::from_secs(2));
    }

    #[test]
    fn test_membership_expiry() {
        let now = Instant::now();
        let mut sm = StateMachine::new(key());
        let step = sm.on_join_report(now, &MembershipTimers::default());
        let gen = armed_generation(&step);

        let step = sm.on_membership_timer_expiry(gen);
        assert_eq!(
            step.actions,
            vec![MemberAction::Left(LeaveReason::MembershipExpired)]
        );
    }

    #[test]
    fn test_refreshed_membership_rejects_old_expiry() {
        let timers = MembershipTimers::default();
        let now = Instant::now();
        let mut sm = StateMachine::new(key());
        let first = sm.on_join_report(now, &timers);
        sm.on_join_report(now + Duration::from_secs(10), &timers);

        let step = sm.on_membership_timer_expiry(armed_generation(&first));
        assert_eq!(step.skipped, Some(Skipped::TimerRaceLost));
        assert!(sm.is_member());
    }

    #[test]
    fn test_immediate_query_response() {
        let now = Instant::now();
        let mut sm = joined(now);
        let step = sm.on_upstream_query(Duration::ZERO, now);
        assert_eq!(step.actions, vec![MemberAction::ReportUpstream]);
        assert_eq!(sm.state(), MemberState::MemberIdle);
    }

    #[test]
    fn test_deferred_query_response() {
        let now = Instant::now();
        let mut sm = joined(now);
        let step = sm.on_upstream_query(Duration::from_secs(3), now);
        assert!(step.actions.is_empty());
        assert_eq!(sm.state(), MemberState::MemberTimerRunning);
        let gen = armed_generation(&step);

        // A later query with a longer delay keeps the earlier deadline
        let step = sm.on_upstream_query(Duration::from_secs(8), now + Duration::from_secs(1));
        assert!(step.timers.is_empty());
        assert_eq!(sm.response_due_at(), Some(now + Duration::from_secs(3)));

        let step = sm.on_response_timer(gen);
        assert_eq!(step.actions, vec![MemberAction::ReportUpstream]);
        assert_eq!(sm.state(), MemberState::MemberIdle);
    }

    #[test]
    fn test_leave_drops_pending_response() {
        let timers = MembershipTimers::default();
        let now = Instant::now();
        let mut sm = joined(now);
        let query = sm.on_upstream_query(Duration::from_secs(3), now);
        let step = sm.on_leave_report(now, &timers);
        assert!(step.cancelled.contains(&TimerType::QueryResponse(key())));

        let step = sm.on_response_timer(armed_generation(&query));
        assert_eq!(step.skipped, Some(Skipped::TimerRaceLost));
    }

    #[test]
    fn test_due_timers() {
        let timers = MembershipTimers::default();
        let now = Instant::now();
        let mut sm = joined(now);
        assert!(sm.due_timers(now).is_empty());

        sm.on_leave_report(now, &timers);
        let due = sm.due_timers(now + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, TimerKind::LastMemberQuery);

        let due = sm.due_timers(now + DEFAULT_GROUP_MEMBERSHIP_INTERVAL);
        assert_eq!(due.len(), 2);
    }
}
