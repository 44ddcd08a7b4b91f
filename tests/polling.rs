//! The scheduler driving a master handler over fake collaborators.
use assert_matches::assert_matches;
use rtu_poller_lib::{
    crc,
    handler::{CommState, Handler, HandlerConfig, Role},
    platform::{Clock, SerialTransport, TaskTimer, TimerTask},
    protocol::{FunctionCode, MasterQuery, QueryId, StationId},
    report::{StatusReport, Uplink},
    scheduler::QueryScheduler,
    settings::MemoryStorage,
    Error,
};
use std::cell::{Cell, RefCell};
use std::sync::Mutex;

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
    pending: RefCell<Vec<TimerTask>>,
}

impl Timer {
    fn is_pending(&self, task: TimerTask) -> bool {
        self.pending.borrow().contains(&task)
    }
}

impl TaskTimer for Timer {
    fn schedule(&self, task: TimerTask, _delay_ms: u32, _max_exec_time_us: u32) {
        let mut pending = self.pending.borrow_mut();
        if !pending.contains(&task) {
            pending.push(task);
        }
    }
    fn cancel(&self, task: TimerTask) {
        self.pending.borrow_mut().retain(|pending| *pending != task);
    }
}

#[derive(Default)]
struct Wire(Vec<Vec<u8>>);

impl SerialTransport for Wire {
    fn begin_transmit(&mut self) {}
    fn send(&mut self, frame: &[u8]) -> usize {
        self.0.push(frame.to_vec());
        frame.len()
    }
}

#[derive(Default)]
struct Reports(Vec<StatusReport>);

impl Uplink for Reports {
    fn send(&mut self, report: &StatusReport) {
        self.0.push(report.clone());
    }
}

fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc::checksum(body).to_be_bytes());
    frame
}

fn id(value: u8) -> QueryId {
    QueryId::try_from(value).unwrap()
}

struct Bench {
    clock: FakeClock,
    timer: Timer,
    handler: Mutex<Handler<Wire, Reports>>,
    scheduler: QueryScheduler<MemoryStorage>,
}

impl Bench {
    fn new() -> Self {
        let bench = Self {
            clock: FakeClock::new(),
            timer: Timer::default(),
            handler: Mutex::new(Handler::new(
                HandlerConfig::default(),
                Wire::default(),
                Reports::default(),
            )),
            scheduler: QueryScheduler::with_capacity(MemoryStorage::new(), 4),
        };
        bench.scheduler.init(&bench.clock, &bench.timer).unwrap();
        bench
    }

    fn add(&self, query: MasterQuery) {
        self.scheduler.add_task(query, &self.clock, &self.timer).unwrap();
    }

    fn pass(&self) {
        self.scheduler.periodic_work(&self.handler, &self.clock, &self.timer);
    }

    fn reply(&self, frame: &[u8]) {
        self.handler.lock().unwrap().on_receive(frame, &self.timer);
    }

    fn time_out(&self) {
        self.handler.lock().unwrap().on_reply_timeout(&self.timer);
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.handler.lock().unwrap().transport().0.clone()
    }

    fn reports(&self) -> Vec<StatusReport> {
        self.handler.lock().unwrap().uplink().0.clone()
    }
}

#[test]
fn scheduled_one_shot_read_round_trip() {
    let bench = Bench::new();
    bench.add(MasterQuery::new(id(1), 5, FunctionCode::ReadHoldingRegisters, 10, 3).one_shot());
    assert_eq!(bench.scheduler.earliest_due(&bench.clock), Some(id(1)));

    bench.pass();
    bench.pass();
    assert_eq!(bench.sent(), vec![with_crc(&[5, 3, 0, 10, 0, 3])]);
    assert_eq!(bench.scheduler.active_tasks(), 0);

    bench.reply(&with_crc(&[5, 3, 6, 0, 1, 0, 2, 0, 3]));
    let handler = bench.handler.lock().unwrap();
    assert_eq!(handler.state(), CommState::Idle);
    assert_eq!(&handler.registers()[..3], &[1, 2, 3]);
    let reports = &handler.uplink().0;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status(), 0);
    assert_eq!(reports[0].payload.as_slice(), &[1, 0, 2, 0, 3, 0]);
}

#[test]
fn silent_slave_times_out_once() {
    let bench = Bench::new();
    bench.add(MasterQuery::new(id(2), 9, FunctionCode::ReadInputRegisters, 0, 1).with_interval(1));
    bench.pass();
    bench.clock.advance_ms(1000);
    bench.pass();
    assert_eq!(bench.sent().len(), 1);
    assert!(bench.timer.is_pending(TimerTask::ReplyTimeout));

    bench.time_out();
    bench.time_out();
    {
        let handler = bench.handler.lock().unwrap();
        assert_eq!(handler.state(), CommState::Idle);
        assert_matches!(handler.last_error(), Some(Error::NoReply));
        assert_eq!(handler.statistics().errors, 1);
    }
    let reports = bench.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status(), -8);

    // the task stays scheduled and the handler accepts its next run
    bench.clock.advance_ms(1000);
    bench.pass();
    assert_eq!(bench.sent().len(), 2);
}

#[test]
fn unchanged_periodic_reads_are_reported_once() {
    let bench = Bench::new();
    bench.add(MasterQuery::new(id(3), 5, FunctionCode::ReadHoldingRegisters, 0, 1).with_interval(1));
    bench.pass();

    for value in [7, 7, 8] {
        bench.clock.advance_ms(1000);
        bench.pass();
        bench.reply(&with_crc(&[5, 3, 2, 0, value]));
    }
    assert_eq!(bench.sent().len(), 3);
    let statuses: Vec<_> = bench.reports().iter().map(|r| r.payload.to_vec()).collect();
    assert_eq!(statuses, vec![vec![7, 0], vec![8, 0]]);
}

#[test]
fn second_submission_while_waiting_is_refused() {
    let bench = Bench::new();
    let first = MasterQuery::new(id(4), 5, FunctionCode::ReadCoils, 0, 8).one_shot();
    let second = MasterQuery::new(id(5), 6, FunctionCode::ReadCoils, 0, 8).one_shot();
    let mut handler = bench.handler.lock().unwrap();
    handler.submit_query(&first, &bench.timer).unwrap();
    assert_matches!(handler.submit_query(&second, &bench.timer), Err(Error::AlreadyPolling));

    handler.on_reply_timeout(&bench.timer);
    assert!(handler.submit_query(&second, &bench.timer).is_ok());
}

#[test]
fn earliest_due_is_non_decreasing() {
    let bench = Bench::new();
    for (query, interval) in [(1, 40), (2, 3), (3, 15), (4, 7)] {
        bench.add(MasterQuery::new(id(query), 5, FunctionCode::ReadCoils, 0, 1).with_interval(interval));
    }
    let mut order = Vec::new();
    while let Some(next) = bench.scheduler.earliest_due(&bench.clock) {
        order.push(next);
        bench.scheduler.cancel_task(next, &bench.timer).unwrap();
    }
    assert_eq!(order, vec![id(2), id(4), id(3), id(1)]);
    assert_eq!(bench.scheduler.occupied_slots(), 4);
    bench.pass();
    assert_eq!(bench.scheduler.occupied_slots(), 0);
}

#[test]
fn master_and_slave_talk_over_a_loopback() {
    let timer = Timer::default();
    let mut master = Handler::new(HandlerConfig::default(), Wire::default(), Reports::default());
    let slave_config = HandlerConfig {
        role: Role::Slave(StationId::try_from(12).unwrap()),
        ..HandlerConfig::default()
    };
    let mut slave = Handler::new(slave_config, Wire::default(), Reports::default());
    slave.registers_mut()[..4].copy_from_slice(&[0x1111, 0x2222, 0x3333, 0x4444]);

    let query = MasterQuery::new(id(6), 12, FunctionCode::ReadHoldingRegisters, 1, 2).one_shot();
    master.submit_query(&query, &timer).unwrap();
    let request = master.transport().0[0].clone();

    slave.on_receive(&request, &timer);
    assert_matches!(slave.process_slave_frame(), Some(Ok(())));
    let answer = slave.transport().0[0].clone();

    master.on_receive(&answer, &timer);
    assert_eq!(&master.registers()[..2], &[0x2222, 0x3333]);
    assert_eq!(master.uplink().0[0].status(), 0);
}
