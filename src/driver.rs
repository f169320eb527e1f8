//! Frame driver: one compute dispatch followed by one draw per tick, with the
//! binding set chosen by the parity of the step counter.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    error::{LifeError, SubmissionError},
    sim::SimulationParameters,
};

/// Which state buffer a pass reads and which one it writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingSet {
    /// Position of this set in [`BINDING_SETS`], and of its GPU bind group.
    pub index: usize,
    pub read: usize,
    pub write: usize,
}

/// Set A reads state A and writes state B; set B does the reverse.
pub const BINDING_SETS: [BindingSet; 2] = [
    BindingSet {
        index: 0,
        read: 0,
        write: 1,
    },
    BindingSet {
        index: 1,
        read: 1,
        write: 0,
    },
];

/// Binding set for a given step.
pub fn binding_set(step: u64) -> &'static BindingSet {
    &BINDING_SETS[(step & 1) as usize]
}

/// Something that can record and submit the passes of one tick.
///
/// Implementations record into `Frame`; nothing is required to execute
/// before [`TickBackend::present`], which submits everything in the order it
/// was recorded.
pub trait TickBackend {
    type Frame;

    /// Prepare a frame for the next tick. `Ok(None)` skips the tick without
    /// touching any buffer.
    fn acquire_frame(&mut self) -> Result<Option<Self::Frame>, LifeError>;

    /// Record one simulation step reading `bindings.read` and writing `bindings.write`.
    fn dispatch(&mut self, frame: &mut Self::Frame, bindings: &BindingSet);

    /// Record drawing the grid from `bindings.read`.
    fn draw(&mut self, frame: &mut Self::Frame, bindings: &BindingSet);

    /// Submit the recorded work and present.
    fn present(&mut self, frame: Self::Frame) -> Result<(), LifeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Dispatching,
    /// A submission failed; the buffer pair can no longer be trusted.
    Halted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick ran; `step` is the counter after it.
    Presented { step: u64 },
    /// The backend had no frame to draw into; nothing was recorded.
    Skipped,
}

pub struct FrameDriver<B> {
    backend: B,
    step: u64,
    state: DriverState,
}

impl<B: TickBackend> FrameDriver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            step: 0,
            state: DriverState::Idle,
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Run one tick: dispatch with the set for `step`, bump `step`, draw with
    /// the set for the new `step`, then submit and present.
    pub fn tick(&mut self) -> Result<TickOutcome, LifeError> {
        if self.state == DriverState::Halted {
            return Err(SubmissionError::Halted.into());
        }

        let mut frame = match self.backend.acquire_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(TickOutcome::Skipped),
            Err(e) => return Err(self.halt(e)),
        };
        self.state = DriverState::Dispatching;

        self.backend.dispatch(&mut frame, binding_set(self.step));
        self.step += 1;
        self.backend.draw(&mut frame, binding_set(self.step));

        match self.backend.present(frame) {
            Ok(()) => {
                self.state = DriverState::Idle;
                Ok(TickOutcome::Presented { step: self.step })
            }
            Err(e) => Err(self.halt(e)),
        }
    }

    fn halt(&mut self, error: LifeError) -> LifeError {
        log::error!("halting frame driver at step {}: {error}", self.step);
        self.state = DriverState::Halted;
        error
    }
}

/// Shared flag that stops a [`Scheduler`]. Ticks already submitted still complete.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    Tick,
    /// Nothing to do for this long.
    Wait(Duration),
    Cancelled,
}

/// Fixed-interval tick schedule, polled with the current time from any clock.
#[derive(Debug)]
pub struct Scheduler {
    interval: Duration,
    next_tick: Option<Duration>,
    completed: u64,
    max_ticks: Option<u64>,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(interval: Duration, cancel: CancelToken) -> Self {
        Self {
            interval,
            next_tick: None,
            completed: 0,
            max_ticks: None,
            cancel,
        }
    }

    pub fn from_parameters(parameters: &SimulationParameters, cancel: CancelToken) -> Self {
        Self::new(parameters.tick_interval, cancel).with_max_ticks(parameters.max_ticks)
    }

    pub fn with_max_ticks(mut self, max_ticks: Option<u64>) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Ticks that ran to a present, as reported through [`Scheduler::record`].
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Report what a [`Schedule::Tick`] turned into. Only presented ticks
    /// count towards `max_ticks`; a skipped one is made up later.
    pub fn record(&mut self, outcome: TickOutcome) {
        if let TickOutcome::Presented { .. } = outcome {
            self.completed += 1;
        }
    }

    /// Decide what to do at `now`. The first tick is due one interval after
    /// the first poll. A late poll yields a single tick; missed ticks are
    /// dropped rather than replayed.
    pub fn poll(&mut self, now: Duration) -> Schedule {
        if self.cancel.is_cancelled() {
            return Schedule::Cancelled;
        }
        if self.max_ticks.is_some_and(|max| self.completed >= max) {
            self.cancel.cancel();
            return Schedule::Cancelled;
        }

        let Some(due) = self.next_tick else {
            self.next_tick = Some(now + self.interval);
            return Schedule::Wait(self.interval);
        };
        if now < due {
            return Schedule::Wait(due - now);
        }

        let mut next = due + self.interval;
        if next <= now {
            next = now + self.interval;
        }
        self.next_tick = Some(next);
        Schedule::Tick
    }
}

/// Drive `driver` from the calling thread until the scheduler is cancelled.
/// Returns the final step count.
#[cfg(not(target_arch = "wasm32"))]
pub fn run_blocking<B: TickBackend>(
    driver: &mut FrameDriver<B>,
    scheduler: &mut Scheduler,
    mut on_tick: impl FnMut(&FrameDriver<B>, TickOutcome),
) -> Result<u64, LifeError> {
    loop {
        match scheduler.poll(crate::util::monotonic_now()) {
            Schedule::Tick => {
                let outcome = driver.tick()?;
                scheduler.record(outcome);
                on_tick(driver, outcome);
            }
            Schedule::Wait(duration) => std::thread::sleep(duration),
            Schedule::Cancelled => return Ok(driver.step()),
        }
    }
}

/// What a redraw-driven event loop should do once its events are drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The scheduler's wait is over; request a redraw.
    Redraw,
    /// Sleep this long, then ask again.
    Sleep(Duration),
    /// Nothing armed.
    Idle,
}

/// Deadline for the next redraw while the [`Scheduler`] is waiting.
///
/// A redraw that does not tick presents nothing, so vsync cannot pace it.
/// Instead of redrawing again straight away, the loop arms this timer with
/// the scheduler's wait and sleeps until it expires.
#[derive(Clone, Copy, Debug, Default)]
pub struct RedrawTimer {
    wake_at: Option<Duration>,
}

impl RedrawTimer {
    pub fn arm(&mut self, now: Duration, wait: Duration) {
        self.wake_at = Some(now + wait);
    }

    pub fn disarm(&mut self) {
        self.wake_at = None;
    }

    pub fn poll(&mut self, now: Duration) -> Wake {
        match self.wake_at {
            None => Wake::Idle,
            Some(at) if now >= at => {
                self.wake_at = None;
                Wake::Redraw
            }
            Some(at) => Wake::Sleep(at - now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Dispatch { read: usize, write: usize },
        Draw { read: usize },
        Present,
    }

    /// Records every call and tracks which buffer holds the latest generation.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        latest: usize,
        skip_next: bool,
        fail_present_at: Option<usize>,
        presents: usize,
    }

    impl TickBackend for Recorder {
        type Frame = ();

        fn acquire_frame(&mut self) -> Result<Option<()>, LifeError> {
            if std::mem::take(&mut self.skip_next) {
                return Ok(None);
            }
            Ok(Some(()))
        }

        fn dispatch(&mut self, _: &mut (), bindings: &BindingSet) {
            assert_eq!(
                bindings.read, self.latest,
                "compute must read the latest generation"
            );
            self.latest = bindings.write;
            self.calls.push(Call::Dispatch {
                read: bindings.read,
                write: bindings.write,
            });
        }

        fn draw(&mut self, _: &mut (), bindings: &BindingSet) {
            self.calls.push(Call::Draw {
                read: bindings.read,
            });
        }

        fn present(&mut self, _: ()) -> Result<(), LifeError> {
            self.presents += 1;
            if self.fail_present_at == Some(self.presents) {
                return Err(SubmissionError::DeviceLost("test".into()).into());
            }
            self.calls.push(Call::Present);
            Ok(())
        }
    }

    #[test]
    fn binding_sets_never_alias() {
        for set in &BINDING_SETS {
            assert_ne!(set.read, set.write);
        }
        assert_eq!(BINDING_SETS[0].read, BINDING_SETS[1].write);
        assert_eq!(BINDING_SETS[0].write, BINDING_SETS[1].read);
        for step in 0..1000u64 {
            let set = binding_set(step);
            assert_eq!(set.index as u64, step % 2);
            assert_eq!(BINDING_SETS[set.index], *set);
        }
    }

    #[test]
    fn tick_sequence_alternates_parity() {
        let mut driver = FrameDriver::new(Recorder::default());
        for _ in 0..3 {
            driver.tick().expect("tick");
        }
        assert_eq!(driver.step(), 3);
        assert_eq!(
            driver.backend().calls,
            vec![
                Call::Dispatch { read: 0, write: 1 },
                Call::Draw { read: 1 },
                Call::Present,
                Call::Dispatch { read: 1, write: 0 },
                Call::Draw { read: 0 },
                Call::Present,
                Call::Dispatch { read: 0, write: 1 },
                Call::Draw { read: 1 },
                Call::Present,
            ]
        );
    }

    #[test]
    fn each_tick_reads_what_the_previous_one_wrote() {
        let mut driver = FrameDriver::new(Recorder::default());
        for _ in 0..257 {
            driver.tick().expect("tick");
        }
        let mut previous_write = None;
        for call in &driver.backend().calls {
            match *call {
                Call::Dispatch { read, write } => {
                    assert_ne!(read, write);
                    if let Some(prev) = previous_write {
                        assert_eq!(read, prev);
                    }
                    previous_write = Some(write);
                }
                Call::Draw { read } => assert_eq!(Some(read), previous_write),
                Call::Present => {}
            }
        }
    }

    #[test]
    fn skipped_tick_keeps_parity() {
        let mut driver = FrameDriver::new(Recorder::default());
        driver.tick().expect("tick");
        driver.backend_mut().skip_next = true;
        assert_eq!(driver.tick().expect("skip"), TickOutcome::Skipped);
        assert_eq!(driver.step(), 1);
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(
            driver.tick().expect("tick"),
            TickOutcome::Presented { step: 2 }
        );
    }

    #[test]
    fn failed_submission_halts_the_driver() {
        let mut driver = FrameDriver::new(Recorder {
            fail_present_at: Some(2),
            ..Default::default()
        });
        driver.tick().expect("first tick");
        assert!(matches!(
            driver.tick(),
            Err(LifeError::Submission(SubmissionError::DeviceLost(_)))
        ));
        assert_eq!(driver.state(), DriverState::Halted);
        assert!(matches!(
            driver.tick(),
            Err(LifeError::Submission(SubmissionError::Halted))
        ));
        assert_eq!(driver.backend().presents, 2);
    }

    #[test]
    fn scheduler_ticks_at_the_interval() {
        let ms = Duration::from_millis;
        let mut s = Scheduler::new(ms(100), CancelToken::new());
        assert_eq!(s.poll(ms(0)), Schedule::Wait(ms(100)));
        assert_eq!(s.poll(ms(40)), Schedule::Wait(ms(60)));
        assert_eq!(s.poll(ms(100)), Schedule::Tick);
        assert_eq!(s.poll(ms(150)), Schedule::Wait(ms(50)));
        assert_eq!(s.poll(ms(210)), Schedule::Tick);
        assert_eq!(s.poll(ms(290)), Schedule::Wait(ms(10)));
        assert_eq!(s.completed(), 0);
    }

    #[test]
    fn late_poll_does_not_burst() {
        let ms = Duration::from_millis;
        let mut s = Scheduler::new(ms(100), CancelToken::new());
        s.poll(ms(0));
        assert_eq!(s.poll(ms(1000)), Schedule::Tick);
        assert_eq!(s.poll(ms(1001)), Schedule::Wait(ms(99)));
    }

    #[test]
    fn cancellation_stops_the_schedule() {
        let ms = Duration::from_millis;
        let token = CancelToken::new();
        let mut s = Scheduler::new(ms(10), token.clone());
        s.poll(ms(0));
        assert_eq!(s.poll(ms(10)), Schedule::Tick);
        token.cancel();
        assert_eq!(s.poll(ms(20)), Schedule::Cancelled);
        assert_eq!(s.poll(ms(30)), Schedule::Cancelled);
    }

    #[test]
    fn max_ticks_cancels_the_token() {
        let ms = Duration::from_millis;
        let mut s = Scheduler::new(ms(0), CancelToken::new()).with_max_ticks(Some(2));
        let mut ticks = 0;
        for t in 0..10 {
            if s.poll(ms(t)) == Schedule::Tick {
                ticks += 1;
                s.record(TickOutcome::Presented { step: ticks });
            }
        }
        assert_eq!(ticks, 2);
        assert!(s.cancel_token().is_cancelled());
    }

    #[test]
    fn run_blocking_stops_after_max_ticks() {
        let mut driver = FrameDriver::new(Recorder::default());
        let mut scheduler =
            Scheduler::new(Duration::from_millis(1), CancelToken::new()).with_max_ticks(Some(5));
        let mut seen = Vec::new();
        let step = run_blocking(&mut driver, &mut scheduler, |_, outcome| seen.push(outcome))
            .expect("run");
        assert_eq!(step, 5);
        assert_eq!(seen.last(), Some(&TickOutcome::Presented { step: 5 }));
    }

    /// Skips every other frame acquisition.
    #[derive(Default)]
    struct Flaky {
        acquired: u64,
    }

    impl TickBackend for Flaky {
        type Frame = ();

        fn acquire_frame(&mut self) -> Result<Option<()>, LifeError> {
            self.acquired += 1;
            Ok((self.acquired % 2 == 0).then_some(()))
        }

        fn dispatch(&mut self, _: &mut (), _: &BindingSet) {}

        fn draw(&mut self, _: &mut (), _: &BindingSet) {}

        fn present(&mut self, _: ()) -> Result<(), LifeError> {
            Ok(())
        }
    }

    #[test]
    fn skipped_ticks_do_not_count_towards_max_ticks() {
        let mut driver = FrameDriver::new(Flaky::default());
        let mut scheduler =
            Scheduler::new(Duration::ZERO, CancelToken::new()).with_max_ticks(Some(6));
        let mut skipped = 0;
        let step = run_blocking(&mut driver, &mut scheduler, |_, outcome| {
            if outcome == TickOutcome::Skipped {
                skipped += 1;
            }
        })
        .expect("run");
        assert_eq!(step, 6);
        assert_eq!(skipped, 6);
        assert_eq!(scheduler.completed(), 6);
        assert_eq!(driver.backend().acquired, 12);
    }

    #[test]
    fn skipped_record_leaves_the_count() {
        let mut s = Scheduler::new(Duration::ZERO, CancelToken::new()).with_max_ticks(Some(1));
        s.record(TickOutcome::Skipped);
        assert_eq!(s.completed(), 0);
        s.poll(Duration::ZERO);
        assert_eq!(s.poll(Duration::ZERO), Schedule::Tick);
        s.record(TickOutcome::Presented { step: 1 });
        assert_eq!(s.poll(Duration::ZERO), Schedule::Cancelled);
    }

    #[test]
    fn redraw_timer_waits_out_the_schedule() {
        let ms = Duration::from_millis;
        let mut timer = RedrawTimer::default();
        assert_eq!(timer.poll(ms(0)), Wake::Idle);
        timer.arm(ms(10), ms(90));
        assert_eq!(timer.poll(ms(10)), Wake::Sleep(ms(90)));
        assert_eq!(timer.poll(ms(60)), Wake::Sleep(ms(40)));
        assert_eq!(timer.poll(ms(100)), Wake::Redraw);
        assert_eq!(timer.poll(ms(101)), Wake::Idle);
        timer.arm(ms(101), ms(5));
        timer.disarm();
        assert_eq!(timer.poll(ms(200)), Wake::Idle);
    }

    /// Replays the event loop in `lib.rs` against a fake clock: a redraw
    /// polls the scheduler, a wait arms the timer, and the loop only wakes
    /// when the timer fires.
    #[test]
    fn waiting_redraws_do_not_spin() {
        let ms = Duration::from_millis;
        let mut driver = FrameDriver::new(Recorder::default());
        let mut scheduler = Scheduler::new(ms(100), CancelToken::new());
        let mut timer = RedrawTimer::default();
        let mut now = ms(0);
        let mut redraws = 0;
        let mut redraw_requested = true;

        while now < ms(1000) {
            if std::mem::take(&mut redraw_requested) {
                redraws += 1;
                match scheduler.poll(now) {
                    Schedule::Tick => {
                        let outcome = driver.tick().expect("tick");
                        scheduler.record(outcome);
                        redraw_requested = true;
                        // Presenting waits for vsync
                        now += ms(16);
                    }
                    Schedule::Wait(wait) => timer.arm(now, wait),
                    Schedule::Cancelled => break,
                }
                continue;
            }
            match timer.poll(now) {
                Wake::Redraw => redraw_requested = true,
                Wake::Sleep(d) => now += d,
                Wake::Idle => break,
            }
        }

        assert_eq!(scheduler.completed(), 9);
        // One redraw per tick plus one that finds the tick not yet due.
        assert!(redraws <= 2 * 9 + 1, "{redraws} redraws");
    }
}
