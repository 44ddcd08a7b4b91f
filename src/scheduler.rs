//! Fixed-capacity table of periodic and one-shot master queries.
//!
//! The table is re-entered through [`TimerTask::PeriodicWork`]. Each pass
//! executes the task it selected last time if that task is due, reclaims
//! cancelled slots, then arms the timer for the earliest remaining task.
//! Tasks may be added or cancelled while a query executes; the execution
//! only writes its follow-up back if the task revision it started from is
//! still current.
//!
//! ```
//! use rtu_poller_lib::platform::{Clock, TaskTimer, TimerTask};
//! use rtu_poller_lib::protocol::{FunctionCode, MasterQuery, QueryId};
//! use rtu_poller_lib::scheduler::QueryScheduler;
//! use rtu_poller_lib::settings::MemoryStorage;
//!
//! struct Frozen;
//! impl Clock for Frozen {
//!     fn now_hp(&self) -> u32 { 0 }
//!     fn now_coarse(&self) -> u32 { 0 }
//!     fn max_hp_delay_us(&self) -> u32 { 10_000_000 }
//! }
//! struct Ignore;
//! impl TaskTimer for Ignore {
//!     fn schedule(&self, _: TimerTask, _: u32, _: u32) {}
//!     fn cancel(&self, _: TimerTask) {}
//! }
//!
//! let scheduler = QueryScheduler::new(MemoryStorage::new());
//! scheduler.init(&Frozen, &Ignore).unwrap();
//! let id = QueryId::try_from(1).unwrap();
//! let query = MasterQuery::new(id, 17, FunctionCode::ReadHoldingRegisters, 0, 2).one_shot();
//! scheduler.add_task(query, &Frozen, &Ignore).unwrap();
//! assert_eq!(scheduler.earliest_due(&Frozen), Some(id));
//! ```
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace, warn};

use crate::error::{Error, SchedulerError, StorageError};
use crate::platform::{Clock, TaskTimer, TimerTask};
use crate::protocol::{MasterQuery, QueryId};
use crate::settings::{QueryStore, Storage, MAX_QUERY_RECORDS};
use crate::timestamp::Timestamp;

pub const MAX_TASKS: usize = 60;
/// Worst-case execution time announced for a periodic work pass.
pub const EXEC_TIME_US: u32 = 500;
pub const DEFAULT_INTER_QUERY_DELAY_MS: u32 = 400;

/// Something able to put a query on the bus.
pub trait QueryExecutor {
    fn execute<M: TaskTimer + ?Sized>(&self, query: &MasterQuery, timer: &M) -> Result<(), Error>;
}

#[derive(Debug, Clone)]
struct Task {
    query: MasterQuery,
    next_due: Timestamp,
    revision: u32,
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Empty,
    Live(Task),
    /// Cancelled, reclaimed by the next scan.
    Tombstone(Task),
}

impl Slot {
    fn id(&self) -> Option<QueryId> {
        match self {
            Slot::Empty => None,
            Slot::Live(task) | Slot::Tombstone(task) => Some(task.query.id),
        }
    }

    fn live(&self) -> Option<&Task> {
        match self {
            Slot::Live(task) => Some(task),
            _ => None,
        }
    }
}

struct Table<S> {
    slots: [Slot; MAX_TASKS],
    capacity: usize,
    /// Slot the timer was last armed for.
    next: Option<usize>,
    force_reschedule: bool,
    initialized: bool,
    revision: u32,
    inter_query_delay_ms: u32,
    store: QueryStore<S>,
}

impl<S> Table<S> {
    fn slots(&self) -> &[Slot] {
        &self.slots[..self.capacity]
    }

    fn position(&self, id: QueryId) -> Option<usize> {
        self.slots().iter().position(|slot| slot.id() == Some(id))
    }

    fn bump_revision(&mut self) -> u32 {
        self.revision = self.revision.wrapping_add(1);
        self.revision
    }

    fn request_pass<M: TaskTimer + ?Sized>(&mut self, timer: &M) {
        self.force_reschedule = true;
        timer.schedule(TimerTask::PeriodicWork, 0, EXEC_TIME_US);
    }

    /// Earliest live slot. Tombstones met on the way become empty.
    fn scan<C: Clock + ?Sized>(&mut self, clock: &C) -> Option<usize> {
        let mut best: Option<(usize, Timestamp)> = None;
        for index in 0..self.capacity {
            if let Slot::Tombstone(task) = &self.slots[index] {
                trace!("reclaiming slot {index} of query {}", task.query.id);
                self.slots[index] = Slot::Empty;
                continue;
            }
            if let Some(task) = self.slots[index].live() {
                if best.map_or(true, |(_, due)| task.next_due.is_before(&due, clock)) {
                    best = Some((index, task.next_due));
                }
            }
        }
        best.map(|(index, _)| index)
    }
}

/// The query table, shared between the timer context and the command side.
pub struct QueryScheduler<S> {
    table: Mutex<Table<S>>,
}

impl<S: Storage> QueryScheduler<S> {
    pub fn new(storage: S) -> Self {
        Self::with_capacity(storage, MAX_TASKS)
    }

    /// A table limited to `capacity` slots, at most [`MAX_TASKS`].
    pub fn with_capacity(storage: S, capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table {
                slots: std::array::from_fn(|_| Slot::Empty),
                capacity: capacity.min(MAX_TASKS),
                next: None,
                force_reschedule: false,
                initialized: false,
                revision: 0,
                inter_query_delay_ms: DEFAULT_INTER_QUERY_DELAY_MS,
                store: QueryStore::new(storage),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table<S>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Empties the table, marks it ready and re-adds every persisted query.
    ///
    /// Returns the number of restored queries. The table is usable even if
    /// reading the persisted queries fails.
    pub fn init<C, M>(&self, clock: &C, timer: &M) -> Result<usize, SchedulerError>
    where
        C: Clock + ?Sized,
        M: TaskTimer + ?Sized,
    {
        let queries = {
            let mut table = self.lock();
            table.slots = std::array::from_fn(|_| Slot::Empty);
            table.next = None;
            table.force_reschedule = false;
            table.initialized = true;
            table.store.load()?
        };
        let mut restored = 0;
        for query in queries {
            let id = query.id;
            match self.add_task(query, clock, timer) {
                Ok(()) => restored += 1,
                Err(err) => warn!("persisted query {id} not restored: {err}"),
            }
        }
        info!("query table initialized, {restored} persisted queries restored");
        Ok(restored)
    }

    pub fn set_inter_query_delay_ms(&self, delay_ms: u32) {
        self.lock().inter_query_delay_ms = delay_ms;
    }

    pub fn inter_query_delay_ms(&self) -> u32 {
        self.lock().inter_query_delay_ms
    }

    /// Inserts `query`, or replaces the task with the same id in place.
    ///
    /// The first execution is one interval from now; an interval of zero is
    /// due immediately. Queries that are not one-shot are persisted; a
    /// persistence failure is logged and does not prevent scheduling.
    pub fn add_task<C, M>(&self, query: MasterQuery, clock: &C, timer: &M) -> Result<(), SchedulerError>
    where
        C: Clock + ?Sized,
        M: TaskTimer + ?Sized,
    {
        let next_due = Timestamp::after_ms(clock, query.interval_ms());
        let mut guard = self.lock();
        let table = &mut *guard;
        if !table.initialized {
            return Err(SchedulerError::Uninitialized);
        }
        let id = query.id;
        let index = table
            .position(id)
            .or_else(|| table.slots().iter().position(|slot| matches!(slot, Slot::Empty)))
            .ok_or(SchedulerError::NoMoreTasks)?;

        if !query.is_one_shot() {
            if u8::try_from(query.count).is_err() {
                return Err(StorageError::CountTooLarge(query.count).into());
            }
            if let Err(err) = table.store.save(&query) {
                warn!("query {id} not persisted: {err}");
            }
        }

        let refresh = match table.next {
            None => true,
            Some(next) if next == index => true,
            Some(next) => table.slots[next]
                .live()
                .map_or(true, |current| next_due.is_before(&current.next_due, clock)),
        };
        let revision = table.bump_revision();
        table.slots[index] = Slot::Live(Task {
            query,
            next_due,
            revision,
        });
        info!("query {id} scheduled in slot {index}");
        if refresh {
            table.request_pass(timer);
        }
        Ok(())
    }

    /// Cancels the task with `id` and drops its persisted record.
    ///
    /// The slot is reclaimed by the next periodic work pass, which is
    /// requested immediately.
    pub fn cancel_task<M: TaskTimer + ?Sized>(&self, id: QueryId, timer: &M) -> Result<(), SchedulerError> {
        let mut guard = self.lock();
        let table = &mut *guard;
        if !table.initialized {
            return Err(SchedulerError::Uninitialized);
        }
        if let Err(err) = table.store.remove(id) {
            warn!("persisted query {id} not removed: {err}");
        }
        let index = table.position(id).ok_or(SchedulerError::UnknownTask(id))?;
        if let Slot::Live(task) = std::mem::take(&mut table.slots[index]) {
            table.slots[index] = Slot::Tombstone(task);
        }
        info!("query {id} cancelled");
        table.request_pass(timer);
        Ok(())
    }

    /// Cancels every task and erases all persisted queries.
    pub fn remove_all<M: TaskTimer + ?Sized>(&self, timer: &M) -> Result<(), SchedulerError> {
        let mut guard = self.lock();
        let table = &mut *guard;
        if !table.initialized {
            return Err(SchedulerError::Uninitialized);
        }
        for slot in table.slots.iter_mut() {
            if let Slot::Live(task) = std::mem::take(slot) {
                *slot = Slot::Tombstone(task);
            }
        }
        table.request_pass(timer);
        table.store.remove_all()?;
        info!("all queries removed");
        Ok(())
    }

    /// One pass of the periodic work task.
    pub fn periodic_work<E, C, M>(&self, executor: &E, clock: &C, timer: &M)
    where
        E: QueryExecutor + ?Sized,
        C: Clock + ?Sized,
        M: TaskTimer + ?Sized,
    {
        let due = {
            let table = self.lock();
            if table.force_reschedule {
                None
            } else {
                table.next.filter(|&index| {
                    table.slots[index]
                        .live()
                        .is_some_and(|task| task.next_due.delay_from_now_us(clock) == 0)
                })
            }
        };
        let executed = due.is_some_and(|index| self.run_slot(index, executor, clock, timer));

        let mut table = self.lock();
        table.force_reschedule = false;
        let next = table.scan(clock);
        table.next = next;
        let Some(task) = table.next.and_then(|index| table.slots[index].live()) else {
            trace!("query table idle");
            return;
        };
        let mut delay_ms = task.next_due.delay_from_now_us(clock).min(clock.max_hp_delay_us()) / 1000;
        if executed {
            delay_ms = delay_ms.max(table.inter_query_delay_ms);
        }
        trace!("next pass for query {} in {delay_ms} ms", task.query.id);
        timer.schedule(TimerTask::PeriodicWork, delay_ms, EXEC_TIME_US);
    }

    /// Id of the live task due first, ties going to the lowest slot.
    pub fn earliest_due<C: Clock + ?Sized>(&self, clock: &C) -> Option<QueryId> {
        let table = self.lock();
        let mut best: Option<&Task> = None;
        for task in table.slots().iter().filter_map(Slot::live) {
            if best.map_or(true, |current| task.next_due.is_before(&current.next_due, clock)) {
                best = Some(task);
            }
        }
        best.map(|task| task.query.id)
    }

    /// Executes the live task `id` right away, regardless of its due time.
    pub fn perform_query<E, C, M>(&self, id: QueryId, executor: &E, clock: &C, timer: &M) -> Result<(), SchedulerError>
    where
        E: QueryExecutor + ?Sized,
        C: Clock + ?Sized,
        M: TaskTimer + ?Sized,
    {
        let index = {
            let table = self.lock();
            table
                .slots()
                .iter()
                .position(|slot| slot.live().is_some_and(|task| task.query.id == id))
                .ok_or(SchedulerError::UnknownTask(id))?
        };
        self.run_slot(index, executor, clock, timer);
        Ok(())
    }

    /// Runs the task of `index` with the table unlocked, then applies its
    /// follow-up unless the task changed meanwhile.
    fn run_slot<E, C, M>(&self, index: usize, executor: &E, clock: &C, timer: &M) -> bool
    where
        E: QueryExecutor + ?Sized,
        C: Clock + ?Sized,
        M: TaskTimer + ?Sized,
    {
        let Some((query, revision)) = self.lock().slots[index]
            .live()
            .map(|task| (task.query.clone(), task.revision))
        else {
            return false;
        };

        debug!("executing query {}", query.id);
        if let Err(err) = executor.execute(&query, timer) {
            warn!("query {} not sent: {err}", query.id);
        }

        let mut table = self.lock();
        let current = table.slots[index]
            .live()
            .is_some_and(|task| task.revision == revision);
        if !current {
            debug!("query {} changed while executing", query.id);
        } else if query.is_one_shot() {
            table.slots[index] = Slot::Empty;
            debug!("one-shot query {} released", query.id);
        } else if let Slot::Live(task) = &mut table.slots[index] {
            task.next_due = Timestamp::after_ms(clock, query.interval_ms());
        }
        true
    }

    pub fn active_tasks(&self) -> usize {
        self.lock().slots().iter().filter(|slot| slot.live().is_some()).count()
    }

    /// Slots not yet reusable, cancelled ones included.
    pub fn occupied_slots(&self) -> usize {
        self.lock()
            .slots()
            .iter()
            .filter(|slot| !matches!(slot, Slot::Empty))
            .count()
    }

    pub fn contains(&self, id: QueryId) -> bool {
        self.lock()
            .slots()
            .iter()
            .any(|slot| slot.live().is_some_and(|task| task.query.id == id))
    }

    /// Live queries in slot order.
    pub fn queries(&self) -> heapless::Vec<MasterQuery, MAX_TASKS> {
        self.lock()
            .slots()
            .iter()
            .filter_map(Slot::live)
            .map(|task| task.query.clone())
            .collect()
    }

    pub fn stored_query(&self, id: QueryId) -> Result<Option<MasterQuery>, StorageError> {
        self.lock().store.get(id)
    }

    pub fn stored_ids(&self) -> heapless::Vec<QueryId, MAX_QUERY_RECORDS> {
        self.lock().store.ids().collect()
    }

    /// Runs `f` on the persistence collaborator, for the other records it holds.
    pub fn with_storage<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(self.lock().store.storage_mut())
    }

    pub fn into_storage(self) -> S {
        self.table
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .store
            .into_storage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FunctionCode;
    use crate::settings::MemoryStorage;
    use assert_matches::assert_matches;
    use std::cell::{Cell, RefCell};

    struct FakeClock {
        hp: Cell<u32>,
        coarse: Cell<u32>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                hp: Cell::new(0),
                coarse: Cell::new(0),
            }
        }

        fn advance_ms(&self, ms: u32) {
            self.hp.set(self.hp.get().wrapping_add(ms * 1000));
            self.coarse.set(self.coarse.get() + ms * 128 / 1000);
        }
    }

    impl Clock for FakeClock {
        fn now_hp(&self) -> u32 {
            self.hp.get()
        }
        fn now_coarse(&self) -> u32 {
            self.coarse.get()
        }
        fn max_hp_delay_us(&self) -> u32 {
            10_000_000
        }
    }

    #[derive(Default)]
    struct Timer {
        scheduled: RefCell<Vec<(TimerTask, u32)>>,
    }

    impl Timer {
        fn last(&self) -> Option<(TimerTask, u32)> {
            self.scheduled.borrow().last().copied()
        }
    }

    impl TaskTimer for Timer {
        fn schedule(&self, task: TimerTask, delay_ms: u32, _max_exec_time_us: u32) {
            self.scheduled.borrow_mut().push((task, delay_ms));
        }
        fn cancel(&self, _task: TimerTask) {}
    }

    #[derive(Default)]
    struct Recorder {
        executed: RefCell<Vec<QueryId>>,
    }

    impl QueryExecutor for Recorder {
        fn execute<M: TaskTimer + ?Sized>(&self, query: &MasterQuery, _timer: &M) -> Result<(), Error> {
            self.executed.borrow_mut().push(query.id);
            Ok(())
        }
    }

    fn id(value: u8) -> QueryId {
        QueryId::try_from(value).unwrap()
    }

    fn read(value: u8, interval: u16) -> MasterQuery {
        MasterQuery::new(id(value), 17, FunctionCode::ReadHoldingRegisters, 0, 2).with_interval(interval)
    }

    fn ready(capacity: usize, clock: &FakeClock, timer: &Timer) -> QueryScheduler<MemoryStorage> {
        let scheduler = QueryScheduler::with_capacity(MemoryStorage::new(), capacity);
        assert_eq!(scheduler.init(clock, timer).unwrap(), 0);
        scheduler
    }

    #[test]
    fn uninitialized_table_rejects_everything() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let scheduler = QueryScheduler::new(MemoryStorage::new());
        assert_matches!(
            scheduler.add_task(read(1, 5), &clock, &timer),
            Err(SchedulerError::Uninitialized)
        );
        assert_matches!(scheduler.cancel_task(id(1), &timer), Err(SchedulerError::Uninitialized));
        assert_matches!(scheduler.remove_all(&timer), Err(SchedulerError::Uninitialized));
    }

    #[test]
    fn one_shot_runs_once_and_frees_its_slot() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let recorder = Recorder::default();
        let scheduler = ready(4, &clock, &timer);

        scheduler.add_task(read(1, 0).one_shot(), &clock, &timer).unwrap();
        assert_eq!(timer.last(), Some((TimerTask::PeriodicWork, 0)));
        assert_eq!(scheduler.earliest_due(&clock), Some(id(1)));
        assert!(scheduler.stored_ids().is_empty());

        // forced pass only reschedules
        scheduler.periodic_work(&recorder, &clock, &timer);
        assert!(recorder.executed.borrow().is_empty());
        assert_eq!(timer.last(), Some((TimerTask::PeriodicWork, 0)));

        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(recorder.executed.borrow().as_slice(), &[id(1)]);
        assert_eq!(scheduler.active_tasks(), 0);
        assert_eq!(scheduler.occupied_slots(), 0);
    }

    #[test]
    fn performed_run_once_task_empties_its_slot() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let recorder = Recorder::default();
        let scheduler = ready(4, &clock, &timer);

        scheduler.add_task(read(1, 0), &clock, &timer).unwrap();
        assert_eq!(scheduler.earliest_due(&clock), Some(id(1)));
        assert_eq!(scheduler.active_tasks(), 1);
        let stored = scheduler.stored_ids();

        scheduler.perform_query(id(1), &recorder, &clock, &timer).unwrap();
        assert_eq!(recorder.executed.borrow().as_slice(), &[id(1)]);
        assert_eq!(scheduler.active_tasks(), 0);
        assert_eq!(scheduler.occupied_slots(), 0);
        assert!(!scheduler.contains(id(1)));
        assert_eq!(scheduler.earliest_due(&clock), None);
        assert_eq!(scheduler.stored_ids(), stored);

        // never selected again
        scheduler.periodic_work(&recorder, &clock, &timer);
        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(recorder.executed.borrow().len(), 1);
        assert_matches!(
            scheduler.perform_query(id(1), &recorder, &clock, &timer),
            Err(SchedulerError::UnknownTask(_))
        );
    }

    #[test]
    fn count_beyond_record_width_is_refused() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let scheduler = ready(4, &clock, &timer);
        let mut wide = read(1, 5);
        wide.count = 256;
        assert_matches!(
            scheduler.add_task(wide.clone(), &clock, &timer),
            Err(SchedulerError::Storage(StorageError::CountTooLarge(256)))
        );
        assert_eq!(scheduler.active_tasks(), 0);
        assert!(scheduler.stored_ids().is_empty());

        // run-once queries are never persisted
        scheduler.add_task(wide.one_shot(), &clock, &timer).unwrap();
        assert_eq!(scheduler.active_tasks(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let scheduler = ready(2, &clock, &timer);
        scheduler.add_task(read(1, 5), &clock, &timer).unwrap();
        scheduler.add_task(read(2, 5), &clock, &timer).unwrap();
        assert_matches!(
            scheduler.add_task(read(3, 5), &clock, &timer),
            Err(SchedulerError::NoMoreTasks)
        );
        // replacing in place needs no free slot
        scheduler.add_task(read(2, 9), &clock, &timer).unwrap();
        assert_eq!(scheduler.active_tasks(), 2);
    }

    #[test]
    fn earliest_due_orders_by_deadline() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let scheduler = ready(4, &clock, &timer);
        scheduler.add_task(read(1, 5), &clock, &timer).unwrap();
        scheduler.add_task(read(2, 2), &clock, &timer).unwrap();
        scheduler.add_task(read(3, 60), &clock, &timer).unwrap();
        assert_eq!(scheduler.earliest_due(&clock), Some(id(2)));

        scheduler.cancel_task(id(2), &timer).unwrap();
        assert_eq!(scheduler.earliest_due(&clock), Some(id(1)));
    }

    #[test]
    fn cancelled_slot_is_reclaimed_by_next_pass() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let recorder = Recorder::default();
        let scheduler = ready(4, &clock, &timer);
        scheduler.add_task(read(1, 5), &clock, &timer).unwrap();
        scheduler.add_task(read(2, 5), &clock, &timer).unwrap();
        assert_eq!(scheduler.stored_ids().as_slice(), &[id(1), id(2)]);

        scheduler.cancel_task(id(1), &timer).unwrap();
        assert!(!scheduler.contains(id(1)));
        assert_eq!(scheduler.occupied_slots(), 2);
        assert_eq!(scheduler.stored_ids().as_slice(), &[id(2)]);
        assert_matches!(
            scheduler.cancel_task(id(9), &timer),
            Err(SchedulerError::UnknownTask(missing)) if missing == id(9)
        );

        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(scheduler.occupied_slots(), 1);
        assert!(recorder.executed.borrow().is_empty());
    }

    #[test]
    fn periodic_task_is_rescheduled_after_running() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let recorder = Recorder::default();
        let scheduler = ready(4, &clock, &timer);
        scheduler.add_task(read(1, 2), &clock, &timer).unwrap();
        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(timer.last(), Some((TimerTask::PeriodicWork, 2000)));

        clock.advance_ms(2000);
        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(recorder.executed.borrow().len(), 1);
        assert_eq!(timer.last(), Some((TimerTask::PeriodicWork, 2000)));
        assert_eq!(scheduler.active_tasks(), 1);
    }

    #[test]
    fn wake_up_is_clamped_to_horizon_and_spaced_after_execution() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let recorder = Recorder::default();
        let scheduler = ready(4, &clock, &timer);
        scheduler.add_task(read(1, 30), &clock, &timer).unwrap();
        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(timer.last(), Some((TimerTask::PeriodicWork, 10_000)));

        scheduler.add_task(read(2, 0), &clock, &timer).unwrap();
        scheduler.add_task(read(3, 0), &clock, &timer).unwrap();
        scheduler.periodic_work(&recorder, &clock, &timer);
        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(recorder.executed.borrow().as_slice(), &[id(2)]);
        assert_eq!(
            timer.last(),
            Some((TimerTask::PeriodicWork, DEFAULT_INTER_QUERY_DELAY_MS))
        );
    }

    struct Reviser<'a> {
        scheduler: &'a QueryScheduler<MemoryStorage>,
        clock: &'a FakeClock,
        timer: &'a Timer,
    }

    impl QueryExecutor for Reviser<'_> {
        fn execute<M: TaskTimer + ?Sized>(&self, query: &MasterQuery, _timer: &M) -> Result<(), Error> {
            let replacement = read(query.id.get(), 60);
            self.scheduler
                .add_task(replacement, self.clock, self.timer)
                .map_err(|_| Error::NotMaster)
        }
    }

    #[test]
    fn change_during_execution_wins_over_follow_up() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let scheduler = ready(4, &clock, &timer);
        scheduler.add_task(read(1, 0).one_shot(), &clock, &timer).unwrap();
        let reviser = Reviser {
            scheduler: &scheduler,
            clock: &clock,
            timer: &timer,
        };

        scheduler.perform_query(id(1), &reviser, &clock, &timer).unwrap();
        // the one-shot release is discarded, the periodic replacement stays
        assert!(scheduler.contains(id(1)));
        assert!(!scheduler.queries()[0].is_one_shot());
    }

    #[test]
    fn persisted_queries_are_restored() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let scheduler = ready(4, &clock, &timer);
        scheduler.add_task(read(5, 10), &clock, &timer).unwrap();
        scheduler.add_task(read(6, 10).one_shot(), &clock, &timer).unwrap();
        let storage = scheduler.into_storage();

        let restored = QueryScheduler::new(storage);
        assert_eq!(restored.init(&clock, &timer).unwrap(), 1);
        assert!(restored.contains(id(5)));
        assert!(!restored.contains(id(6)));
        assert_eq!(restored.stored_query(id(5)).unwrap(), Some(read(5, 10)));
    }

    #[test]
    fn remove_all_clears_table_and_storage() {
        let (clock, timer) = (FakeClock::new(), Timer::default());
        let recorder = Recorder::default();
        let scheduler = ready(4, &clock, &timer);
        scheduler.add_task(read(1, 5), &clock, &timer).unwrap();
        scheduler.add_task(read(2, 5), &clock, &timer).unwrap();
        scheduler.remove_all(&timer).unwrap();
        assert_eq!(scheduler.active_tasks(), 0);
        assert!(scheduler.stored_ids().is_empty());

        scheduler.periodic_work(&recorder, &clock, &timer);
        assert_eq!(scheduler.occupied_slots(), 0);
    }
}
