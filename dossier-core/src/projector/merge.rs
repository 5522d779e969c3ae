//! Field-level merge rules shared by every keyed collection of the projector
//!
//! Each field keeps the value carried by the "largest" event that set it,
//! where events compare by their [`Stamp`] and then by the value itself.
//! Taking a maximum is commutative and idempotent, so any arrival order of the
//! same events, with any number of duplicates, merges to the same record.
//! Absent fields never touch the stored value.
//!
//! Plan steps can run more than once. Each execution carries an epoch, and a
//! newer epoch outranks everything an older one said, including its status.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::events::{ActionUpdate, GoalUpdate, InsightUpdate, PlanStepUpdate, ReportSectionUpdate};
use crate::types::{LiveAction, LiveGoal, LiveInsight, LivePlanStep, LiveReportSection, LiveStatus};

/// Precedence of one event when two of them set the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Stamp {
    /// Execution epoch the event belongs to
    pub epoch: u64,
    /// Producer timestamp, when the event carried one
    pub at: Option<DateTime<Utc>>,
    /// Status rank the event carried, zero when it had none
    pub rank: u8,
}

impl Stamp {
    pub fn new(at: Option<DateTime<Utc>>, rank: Option<u8>) -> Self {
        Self {
            epoch: 0,
            at,
            rank: rank.map(|r| r + 1).unwrap_or(0),
        }
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }
}

/// Stamp of the value currently held by each field of one record
pub type FieldClocks = HashMap<&'static str, Stamp>;

/// Merge one optional field.
pub fn overlay<T: Ord>(
    field: &'static str,
    slot: &mut Option<T>,
    incoming: Option<T>,
    stamp: Stamp,
    clocks: &mut FieldClocks,
) {
    let Some(value) = incoming else {
        return;
    };
    let replace = match (slot.as_ref(), clocks.get(field)) {
        (Some(current), Some(clock)) => stamp > *clock || (stamp == *clock && value > *current),
        _ => true,
    };
    if replace {
        *slot = Some(value);
        clocks.insert(field, stamp);
    }
}

/// Keep the most advanced of two ranked values.
pub fn advance<T: Copy, R: Ord>(slot: &mut Option<T>, incoming: Option<T>, rank: impl Fn(&T) -> R) {
    if let Some(value) = incoming {
        match slot {
            Some(current) if rank(current) >= rank(&value) => {}
            _ => *slot = Some(value),
        }
    }
}

/// Keep the later of two timestamps.
pub fn latest(slot: &mut Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) {
    if incoming > *slot {
        *slot = incoming;
    }
}

/// Keep the earlier of two timestamps, ignoring missing ones.
pub fn earliest(slot: &mut Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) {
    if let Some(at) = incoming {
        if slot.map_or(true, |current| at < current) {
            *slot = Some(at);
        }
    }
}

/// A live entity that merges partial updates.
pub trait LiveRecord: Clone {
    type Key: Ord + Clone;
    type Patch;

    fn key(patch: &Self::Patch) -> Self::Key;
    fn create(key: &Self::Key) -> Self;
    fn patch_meta(patch: &Self::Patch) -> (Option<LiveStatus>, Option<DateTime<Utc>>);
    /// Merge the domain fields of the patch
    fn overlay(&mut self, patch: Self::Patch, stamp: Stamp, clocks: &mut FieldClocks);
    fn set_meta(&mut self, status: LiveStatus, updated_at: Option<DateTime<Utc>>);

    /// Execution epoch of the patch
    fn patch_epoch(_patch: &Self::Patch) -> u64 {
        0
    }

    /// Drop values that belong to an execution older than `epoch`.
    fn retire(&mut self, _epoch: u64, _clocks: &mut FieldClocks) {}
}

#[derive(Debug, Clone)]
struct Slot<T> {
    record: T,
    clocks: FieldClocks,
    status: Option<(u64, LiveStatus)>,
    updated_at: Option<DateTime<Utc>>,
}

/// Keyed collection with an append-only first-seen order.
#[derive(Debug, Clone)]
pub struct EntityStore<T: LiveRecord> {
    entries: BTreeMap<T::Key, Slot<T>>,
    order: Vec<T::Key>,
}

impl<T: LiveRecord> Default for EntityStore<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T: LiveRecord> EntityStore<T> {
    /// Upsert one patch.
    ///
    /// The status shown is the most advanced one received for the newest
    /// epoch, or `streaming` while no event has carried a status.
    pub fn apply(&mut self, patch: T::Patch) {
        let key = T::key(&patch);
        let (status, updated_at) = T::patch_meta(&patch);
        let epoch = T::patch_epoch(&patch);
        let stamp = Stamp::new(updated_at, status.map(|s| s.rank())).with_epoch(epoch);

        let order = &mut self.order;
        let slot = self.entries.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Slot {
                record: T::create(&key),
                clocks: FieldClocks::new(),
                status: None,
                updated_at: None,
            }
        });

        slot.record.overlay(patch, stamp, &mut slot.clocks);
        advance(&mut slot.status, status.map(|s| (epoch, s)), |(e, s)| (*e, s.rank()));
        latest(&mut slot.updated_at, updated_at);
        if let Some((current, _)) = slot.status {
            slot.record.retire(current, &mut slot.clocks);
        }
        slot.record.set_meta(
            slot.status.map(|(_, s)| s).unwrap_or_default(),
            slot.updated_at,
        );
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.entries.get(key).map(|slot| &slot.record)
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in first-seen order
    pub fn ordered(&self) -> Vec<T> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|slot| slot.record.clone())
            .collect()
    }

    /// Keys in first-seen order
    pub fn order(&self) -> &[T::Key] {
        &self.order
    }
}

// ============================================
// LiveRecord implementations
// ============================================

impl LiveRecord for LiveGoal {
    type Key = String;
    type Patch = GoalUpdate;

    fn key(patch: &GoalUpdate) -> String {
        patch.id.clone()
    }

    fn create(key: &String) -> Self {
        LiveGoal {
            id: key.clone(),
            ..Default::default()
        }
    }

    fn patch_meta(patch: &GoalUpdate) -> (Option<LiveStatus>, Option<DateTime<Utc>>) {
        (patch.status, patch.updated_at)
    }

    fn overlay(&mut self, patch: GoalUpdate, stamp: Stamp, clocks: &mut FieldClocks) {
        overlay("goal_text", &mut self.goal_text, patch.goal_text, stamp, clocks);
        overlay("rationale", &mut self.rationale, patch.rationale, stamp, clocks);
        overlay("error", &mut self.error, patch.error, stamp, clocks);
    }

    fn set_meta(&mut self, status: LiveStatus, updated_at: Option<DateTime<Utc>>) {
        self.status = status;
        self.updated_at = updated_at;
    }
}

impl LiveRecord for LivePlanStep {
    type Key = u32;
    type Patch = PlanStepUpdate;

    fn key(patch: &PlanStepUpdate) -> u32 {
        patch.step_id
    }

    fn create(key: &u32) -> Self {
        LivePlanStep {
            step_id: *key,
            ..Default::default()
        }
    }

    fn patch_meta(patch: &PlanStepUpdate) -> (Option<LiveStatus>, Option<DateTime<Utc>>) {
        (patch.status, patch.updated_at)
    }

    fn overlay(&mut self, patch: PlanStepUpdate, stamp: Stamp, clocks: &mut FieldClocks) {
        overlay("goal", &mut self.goal, patch.goal, stamp, clocks);
        overlay("required_data", &mut self.required_data, patch.required_data, stamp, clocks);
        overlay("chunk_strategy", &mut self.chunk_strategy, patch.chunk_strategy, stamp, clocks);
        overlay("error", &mut self.error, patch.error, stamp, clocks);
    }

    fn set_meta(&mut self, status: LiveStatus, updated_at: Option<DateTime<Utc>>) {
        self.status = status;
        self.updated_at = updated_at;
    }

    fn patch_epoch(patch: &PlanStepUpdate) -> u64 {
        patch.epoch
    }

    fn retire(&mut self, epoch: u64, clocks: &mut FieldClocks) {
        if clocks.get("error").is_some_and(|clock| clock.epoch < epoch) {
            self.error = None;
            clocks.remove("error");
        }
    }
}

impl LiveRecord for LiveInsight {
    type Key = String;
    type Patch = InsightUpdate;

    fn key(patch: &InsightUpdate) -> String {
        patch.id.clone()
    }

    fn create(key: &String) -> Self {
        LiveInsight {
            id: key.clone(),
            ..Default::default()
        }
    }

    fn patch_meta(patch: &InsightUpdate) -> (Option<LiveStatus>, Option<DateTime<Utc>>) {
        (patch.status, patch.updated_at)
    }

    fn overlay(&mut self, patch: InsightUpdate, stamp: Stamp, clocks: &mut FieldClocks) {
        overlay("step_id", &mut self.step_id, patch.step_id, stamp, clocks);
        overlay("content", &mut self.content, patch.content, stamp, clocks);
    }

    fn set_meta(&mut self, status: LiveStatus, updated_at: Option<DateTime<Utc>>) {
        self.status = status;
        self.updated_at = updated_at;
    }
}

impl LiveRecord for LiveAction {
    type Key = String;
    type Patch = ActionUpdate;

    fn key(patch: &ActionUpdate) -> String {
        patch.id.clone()
    }

    fn create(key: &String) -> Self {
        LiveAction {
            id: key.clone(),
            ..Default::default()
        }
    }

    fn patch_meta(patch: &ActionUpdate) -> (Option<LiveStatus>, Option<DateTime<Utc>>) {
        (patch.status, patch.updated_at)
    }

    fn overlay(&mut self, patch: ActionUpdate, stamp: Stamp, clocks: &mut FieldClocks) {
        overlay("label", &mut self.label, patch.label, stamp, clocks);
        overlay("detail", &mut self.detail, patch.detail, stamp, clocks);
    }

    fn set_meta(&mut self, status: LiveStatus, updated_at: Option<DateTime<Utc>>) {
        self.status = status;
        self.updated_at = updated_at;
    }
}

impl LiveRecord for LiveReportSection {
    type Key = String;
    type Patch = ReportSectionUpdate;

    fn key(patch: &ReportSectionUpdate) -> String {
        patch.id.clone()
    }

    fn create(key: &String) -> Self {
        LiveReportSection {
            id: key.clone(),
            ..Default::default()
        }
    }

    fn patch_meta(patch: &ReportSectionUpdate) -> (Option<LiveStatus>, Option<DateTime<Utc>>) {
        (patch.status, patch.updated_at)
    }

    fn overlay(&mut self, patch: ReportSectionUpdate, stamp: Stamp, clocks: &mut FieldClocks) {
        overlay("title", &mut self.title, patch.title, stamp, clocks);
        overlay("content", &mut self.content, patch.content, stamp, clocks);
    }

    fn set_meta(&mut self, status: LiveStatus, updated_at: Option<DateTime<Utc>>) {
        self.status = status;
        self.updated_at = updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal(id: &str) -> GoalUpdate {
        GoalUpdate {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_absent_status_keeps_previous() {
        let mut store = EntityStore::<LiveGoal>::default();
        store.apply(GoalUpdate {
            status: Some(LiveStatus::Streaming),
            ..goal("1")
        });
        store.apply(GoalUpdate {
            goal_text: Some("X".into()),
            ..goal("1")
        });

        let merged = store.get(&"1".to_string()).unwrap();
        assert_eq!(merged.status, LiveStatus::Streaming);
        assert_eq!(merged.goal_text.as_deref(), Some("X"));
    }

    #[test]
    fn test_status_never_regresses() {
        let mut store = EntityStore::<LiveGoal>::default();
        store.apply(GoalUpdate {
            status: Some(LiveStatus::Ready),
            ..goal("1")
        });
        store.apply(GoalUpdate {
            status: Some(LiveStatus::Pending),
            ..goal("1")
        });
        assert_eq!(store.get(&"1".to_string()).unwrap().status, LiveStatus::Ready);
    }

    #[test]
    fn test_first_status_can_be_pending() {
        let mut store = EntityStore::<LiveGoal>::default();
        store.apply(goal("1"));
        assert_eq!(store.get(&"1".to_string()).unwrap().status, LiveStatus::Streaming);
        store.apply(GoalUpdate {
            status: Some(LiveStatus::Pending),
            ..goal("1")
        });
        assert_eq!(store.get(&"1".to_string()).unwrap().status, LiveStatus::Pending);
    }

    #[test]
    fn test_conflicting_values_merge_in_any_order() {
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(5);
        let a = GoalUpdate {
            goal_text: Some("draft".into()),
            updated_at: Some(early),
            ..goal("1")
        };
        let b = GoalUpdate {
            goal_text: Some("final".into()),
            updated_at: Some(late),
            ..goal("1")
        };

        let mut forward = EntityStore::<LiveGoal>::default();
        forward.apply(a.clone());
        forward.apply(b.clone());
        let mut backward = EntityStore::<LiveGoal>::default();
        backward.apply(b);
        backward.apply(a);

        assert_eq!(forward.ordered(), backward.ordered());
        assert_eq!(
            forward.get(&"1".to_string()).unwrap().goal_text.as_deref(),
            Some("final")
        );
    }

    #[test]
    fn test_order_is_first_seen_without_duplicates() {
        let mut store = EntityStore::<LivePlanStep>::default();
        for id in [3, 1, 3, 2, 1] {
            store.apply(PlanStepUpdate {
                step_id: id,
                ..Default::default()
            });
        }
        assert_eq!(store.order(), &[3, 1, 2]);
    }

    #[test]
    fn test_earliest_and_latest() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let mut start = None;
        earliest(&mut start, Some(t1));
        earliest(&mut start, None);
        earliest(&mut start, Some(t0));
        assert_eq!(start, Some(t0));

        let mut end = None;
        latest(&mut end, Some(t1));
        latest(&mut end, Some(t0));
        assert_eq!(end, Some(t1));
    }

    fn step_update(status: LiveStatus, epoch: u64, error: Option<&str>) -> PlanStepUpdate {
        PlanStepUpdate {
            step_id: 1,
            status: Some(status),
            error: error.map(String::from),
            epoch,
            ..Default::default()
        }
    }

    #[test]
    fn test_newer_epoch_outranks_ready() {
        let first_run = [
            step_update(LiveStatus::Pending, 0, None),
            step_update(LiveStatus::Ready, 0, None),
        ];
        let rerun = [
            step_update(LiveStatus::Pending, 7, None),
            step_update(LiveStatus::Streaming, 7, None),
        ];

        let mut store = EntityStore::<LivePlanStep>::default();
        for update in first_run.iter().chain(rerun.iter()) {
            store.apply(update.clone());
        }
        assert_eq!(store.get(&1).unwrap().status, LiveStatus::Streaming);

        // Late duplicates of the first run change nothing
        for update in first_run.iter() {
            store.apply(update.clone());
        }
        assert_eq!(store.get(&1).unwrap().status, LiveStatus::Streaming);
    }

    #[test]
    fn test_rerun_ending_in_error_shows_error_in_any_order() {
        let events = vec![
            step_update(LiveStatus::Error, 0, Some("first failure")),
            step_update(LiveStatus::Pending, 3, None),
            step_update(LiveStatus::Ready, 3, None),
            step_update(LiveStatus::Pending, 9, None),
            step_update(LiveStatus::Streaming, 9, None),
            step_update(LiveStatus::Error, 9, Some("max_iterations_exhausted")),
        ];

        let mut forward = EntityStore::<LivePlanStep>::default();
        for update in events.iter() {
            forward.apply(update.clone());
        }
        let mut backward = EntityStore::<LivePlanStep>::default();
        for update in events.iter().rev() {
            backward.apply(update.clone());
        }

        let step = forward.get(&1).unwrap();
        assert_eq!(step.status, LiveStatus::Error);
        assert_eq!(step.error.as_deref(), Some("max_iterations_exhausted"));
        assert_eq!(forward.ordered(), backward.ordered());
    }

    #[test]
    fn test_error_of_older_epoch_is_cleared_by_rerun() {
        let mut store = EntityStore::<LivePlanStep>::default();
        store.apply(step_update(LiveStatus::Error, 0, Some("boom")));
        store.apply(step_update(LiveStatus::Ready, 4, None));
        let step = store.get(&1).unwrap();
        assert_eq!(step.status, LiveStatus::Ready);
        assert!(step.error.is_none());

        store.apply(step_update(LiveStatus::Error, 0, Some("boom")));
        assert!(store.get(&1).unwrap().error.is_none());
    }
}
