use super::{Catalog, CopSource, ExerciseDefinition, Zone};
use crate::clock::{CancelToken, Cancelled, Clock};
use crate::hmd::{FeedbackSink, HmdMessage};
use crate::sensor_link::SockSide;

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing knobs of the engine. The defaults are the clinical protocol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Interval between zone evaluations
    pub poll: Duration,
    /// Time a foot may stay in zone 0 before balance is lost
    pub loss_threshold: Duration,
    /// Pause between a balance loss and the restart
    pub restart_pause: Duration,
    /// Extra wait before an intro
    pub intro_padding: Duration,
    /// Interval between preparation checks
    pub preparation_poll: Duration,
    /// Half-width of the square the feet must stay in before a set
    pub preparation_bound: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(500),
            loss_threshold: Duration::from_secs(4),
            restart_pause: Duration::from_secs(5),
            intro_padding: Duration::from_secs(2),
            preparation_poll: Duration::from_secs(1),
            preparation_bound: 2.0,
        }
    }
}

/// Zone reporting and the out-of-zone timer for one foot.
#[derive(Debug, Clone, Copy, Default)]
struct FootTracker {
    previous: Option<Zone>,
    out_since: Option<Instant>,
}

impl FootTracker {
    /// Whether `zone` should be reported; remembers it if so.
    fn report(&mut self, zone: Zone) -> bool {
        if zone.is_reportable() && self.previous != Some(zone) {
            self.previous = Some(zone);
            true
        } else {
            false
        }
    }

    /// Feed the loss timer. Returns true once the foot has been out too long.
    fn observe(&mut self, zone: Zone, now: Instant, threshold: Duration) -> bool {
        match zone {
            Zone::Green => {
                self.out_since = None;
                false
            }
            _ => {
                if zone == Zone::Outside && self.out_since.is_none() {
                    self.out_since = Some(now);
                }
                self.out_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= threshold)
            }
        }
    }
}

/// The live state of one exercise attempt.
#[derive(Debug, Clone)]
pub struct ExerciseRun {
    /// Index into the definition's phase sequence
    pub phase: usize,
    pub started: Instant,
    pub restarts: u32,
    left: FootTracker,
    right: FootTracker,
    warmed_up: bool,
    cycles: u32,
}

impl ExerciseRun {
    pub fn new(started: Instant) -> Self {
        Self {
            phase: 0,
            started,
            restarts: 0,
            left: FootTracker::default(),
            right: FootTracker::default(),
            warmed_up: false,
            cycles: 0,
        }
    }

    /// The last zone reported for `side`, `None` before any report.
    pub fn previous_zone(&self, side: SockSide) -> Option<Zone> {
        match side {
            SockSide::Left => self.left.previous,
            SockSide::Right => self.right.previous,
        }
    }

    fn foot_mut(&mut self, side: SockSide) -> &mut FootTracker {
        match side {
            SockSide::Left => &mut self.left,
            SockSide::Right => &mut self.right,
        }
    }

    fn restart(&mut self, now: Instant) {
        let restarts = self.restarts + 1;
        *self = ExerciseRun::new(now);
        self.restarts = restarts;
    }

    fn advance(&mut self, phases: usize) {
        self.phase = (self.phase + 1) % phases;
    }
}

/// Result of one exercise run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExerciseOutcome {
    pub repetition_id: u32,
    pub restarts: u32,
}

/// Tracks which repeat groups have been replayed during a program.
#[derive(Debug, Default)]
pub struct ProgramState {
    completed: BTreeSet<u32>,
}

impl ProgramState {
    /// Whether the exercise's repeat group has already run.
    pub fn is_completed(&self, repetition_id: u32) -> bool {
        self.completed.contains(&repetition_id)
    }

    /// The repeat group keyed by `repetition_id`, the first time only.
    pub fn take_repeat_group(&mut self, catalog: &Catalog, repetition_id: u32) -> Option<Vec<u32>> {
        let group = catalog.repeat_groups.get(&repetition_id)?;
        if self.completed.insert(repetition_id) {
            Some(group.clone())
        } else {
            None
        }
    }
}

enum PhaseEnd {
    Elapsed,
    Lost,
}

/// In the cross-talk drill, a report from `side` in `phase` blanks the
/// other foot for the rest of that poll.
fn blanks_opposite(phase: usize, side: SockSide) -> bool {
    matches!((phase, side), (2, SockSide::Left) | (1, SockSide::Right))
}

/// Runs exercises against live CoP and reports to a [`FeedbackSink`].
pub struct ExerciseEngine {
    catalog: Arc<Catalog>,
    cop: Arc<dyn CopSource>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl ExerciseEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        cop: Arc<dyn CopSource>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            cop,
            clock,
            settings,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn since(&self, then: Instant) -> Duration {
        self.clock.now().saturating_duration_since(then)
    }

    /// Run every exercise in catalog order, replaying repeat groups once.
    pub fn run_program(
        &self,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<Vec<ExerciseOutcome>, Cancelled> {
        let mut state = ProgramState::default();
        let mut outcomes = Vec::new();
        for def in &self.catalog.exercises {
            outcomes.extend(self.run_definition(def, &mut state, sink, cancel)?);
        }
        sink.status("All exercises completed!");
        Ok(outcomes)
    }

    /// Announce, introduce and run every set of `def`, then its repeat
    /// group if it has one that has not run yet.
    pub fn run_definition(
        &self,
        def: &ExerciseDefinition,
        state: &mut ProgramState,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<Vec<ExerciseOutcome>, Cancelled> {
        sink.send(&HmdMessage::config(def));
        self.clock.pause(def.lead_in(), cancel)?;

        if !state.is_completed(def.repetition_id) {
            if def.intro > 0 {
                sink.status(&format!("[Intro]: Waiting {} sec...", def.intro));
                self.clock.pause(
                    self.settings.intro_padding + Duration::from_secs(u64::from(def.intro)),
                    cancel,
                )?;
            }
            if def.demo > 0 {
                sink.status(&format!("[Demo]: Showing {} sec...", def.demo));
                self.clock
                    .pause(Duration::from_secs(u64::from(def.demo)), cancel)?;
            }
        }

        let mut outcomes = Vec::new();
        for set in 1..=def.sets.max(1) {
            self.check_preparation(def, sink, cancel)?;
            sink.status(&format!(
                "Starting set {} of exercise {}",
                set, def.repetition_id
            ));
            outcomes.push(self.run_exercise(def, sink, cancel)?);
        }

        if let Some(group) = state.take_repeat_group(&self.catalog, def.repetition_id) {
            sink.status(&format!("Repeating exercises: {:?}", group));
            for repeat in group.iter().filter_map(|id| self.catalog.get(*id)) {
                self.check_preparation(repeat, sink, cancel)?;
                sink.send(&HmdMessage::config(repeat));
                outcomes.push(self.run_exercise(repeat, sink, cancel)?);
            }
        }
        Ok(outcomes)
    }

    /// Wait until the used feet stay inside the preparation square for
    /// `preparation_cop` seconds without a break.
    pub fn check_preparation(
        &self,
        def: &ExerciseDefinition,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<(), Cancelled> {
        if def.preparation_cop == 0 {
            return Ok(());
        }
        sink.status(&format!(
            "[Preparation CoP]: Checking for {} sec (Active Leg: {})...",
            def.preparation_cop, def.legs_used
        ));
        let hold = Duration::from_secs(u64::from(def.preparation_cop));
        let bound = self.settings.preparation_bound;
        let mut steady_since = self.clock.now();
        loop {
            cancel.check()?;
            let ready = def.legs_used.feet().iter().all(|&side| {
                self.cop
                    .cop(side)
                    .is_some_and(|(x, y)| x.abs() <= bound && y.abs() <= bound)
            });
            if !ready {
                steady_since = self.clock.now();
            } else if self.since(steady_since) >= hold {
                sink.status(&format!(
                    "[Preparation CoP]: {} foot correctly positioned for the required time.",
                    def.legs_used
                ));
                return Ok(());
            }
            self.clock.pause(self.settings.preparation_poll, cancel)?;
        }
    }

    /// One attempt at `def` until its timing budget runs out, restarting
    /// on balance loss, followed by the release pause.
    pub fn run_exercise(
        &self,
        def: &ExerciseDefinition,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<ExerciseOutcome, Cancelled> {
        self.clock.pause(def.settle(), cancel)?;
        sink.status(&format!(
            "[Exercise]: {} started for {} seconds...",
            def.name, def.timing_cop
        ));

        let run = match def.cycling {
            Some(rule) => self.cycle(def, rule.repetitions, sink, cancel)?,
            None => self.standard(def, sink, cancel)?,
        };

        sink.status("[Exercise]: Put leg down");
        self.clock
            .pause(Duration::from_secs(u64::from(def.release)), cancel)?;
        Ok(ExerciseOutcome {
            repetition_id: def.repetition_id,
            restarts: run.restarts,
        })
    }

    fn standard(
        &self,
        def: &ExerciseDefinition,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<ExerciseRun, Cancelled> {
        let phases = def.zone_sequence.len();
        let mut run = ExerciseRun::new(self.clock.now());

        while self.since(run.started) < def.timing() {
            cancel.check()?;
            let phase = &def.zone_sequence[run.phase];
            debug!("[Phase {}]: {} sec", run.phase + 1, phase.duration);

            if !phase.check_cop {
                sink.status(&format!(
                    "[Phase {}]: No CoP check, waiting...",
                    run.phase + 1
                ));
                self.clock.pause(phase.duration(), cancel)?;
                run.advance(phases);
                continue;
            }

            match self.hold_phase(def, &mut run, sink, cancel)? {
                PhaseEnd::Lost => self.lose_balance(def, &mut run, sink, cancel)?,
                PhaseEnd::Elapsed => run.advance(phases),
            }
        }
        Ok(run)
    }

    fn cycle(
        &self,
        def: &ExerciseDefinition,
        repetitions: u32,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<ExerciseRun, Cancelled> {
        let mut run = ExerciseRun::new(self.clock.now());

        while self.since(run.started) < def.timing() {
            cancel.check()?;
            run.phase = if !run.warmed_up {
                0
            } else if run.cycles < repetitions {
                1 + (run.cycles % 2) as usize
            } else if let Some(last) = def.zone_sequence.get(3) {
                sink.status("[Phase 4]: No CoP check, waiting...");
                self.clock.pause(last.duration(), cancel)?;
                break;
            } else {
                break;
            };
            debug!(
                "[Phase {}]: {} sec",
                run.phase + 1,
                def.zone_sequence[run.phase].duration
            );

            match self.hold_phase(def, &mut run, sink, cancel)? {
                PhaseEnd::Lost => self.lose_balance(def, &mut run, sink, cancel)?,
                PhaseEnd::Elapsed if run.phase == 0 => run.warmed_up = true,
                PhaseEnd::Elapsed => run.cycles += 1,
            }
        }
        Ok(run)
    }

    fn hold_phase(
        &self,
        def: &ExerciseDefinition,
        run: &mut ExerciseRun,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<PhaseEnd, Cancelled> {
        let duration = def.zone_sequence[run.phase].duration();
        let phase_start = self.clock.now();
        while self.since(phase_start) < duration && self.since(run.started) < def.timing() {
            if self.poll(def, run, sink) {
                return Ok(PhaseEnd::Lost);
            }
            self.clock.pause(self.settings.poll, cancel)?;
        }
        Ok(PhaseEnd::Elapsed)
    }

    /// Classify each used foot once, report changes, and feed the loss
    /// timers. True when balance was lost.
    fn poll(&self, def: &ExerciseDefinition, run: &mut ExerciseRun, sink: &mut dyn FeedbackSink) -> bool {
        let phase = &def.zone_sequence[run.phase];
        let suppress = def.cycling.is_some_and(|rule| rule.suppress_cross_talk);
        let now = self.clock.now();

        let mut zones: Vec<(SockSide, Option<Zone>)> = def
            .legs_used
            .feet()
            .iter()
            .map(|&side| {
                let zone = match self.cop.cop(side) {
                    Some((x, y)) => phase.zones_for(side).classify(x, y),
                    None => Zone::Outside,
                };
                (side, Some(zone))
            })
            .collect();

        for i in 0..zones.len() {
            let (side, Some(zone)) = zones[i] else {
                continue;
            };
            if !run.foot_mut(side).report(zone) {
                continue;
            }
            sink.status(&format!("[Exercise]: {} Foot Changed to Zone {}", side, zone));
            sink.send(&HmdMessage::feedback(def.repetition_id, side, zone));
            if suppress && blanks_opposite(run.phase, side) {
                for other in zones.iter_mut().filter(|(s, _)| *s != side) {
                    other.1 = None;
                }
            }
        }

        let mut lost = false;
        for (side, zone) in zones {
            if let Some(zone) = zone {
                lost |= run
                    .foot_mut(side)
                    .observe(zone, now, self.settings.loss_threshold);
            }
        }
        lost
    }

    fn lose_balance(
        &self,
        def: &ExerciseDefinition,
        run: &mut ExerciseRun,
        sink: &mut dyn FeedbackSink,
        cancel: &CancelToken,
    ) -> Result<(), Cancelled> {
        sink.status("You lost balance, restarting exercise...");
        for &side in def.legs_used.feet() {
            let foot = run.foot_mut(side);
            if foot.previous != Some(Zone::Lost) {
                foot.previous = Some(Zone::Lost);
                sink.send(&HmdMessage::feedback(def.repetition_id, side, Zone::Lost));
            }
        }
        self.clock.pause(self.settings.restart_pause, cancel)?;
        run.restart(self.clock.now());
        sink.status("Restarting exercise...");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exercise::{CyclingRule, LegsUsed, Rect, Tolerance, ZonePhase};
    use crate::hmd::tests::RecordingSink;

    struct ScriptedCop<F> {
        clock: ManualClock,
        script: F,
    }

    impl<F> CopSource for ScriptedCop<F>
    where
        F: Fn(SockSide, Duration) -> (f64, f64) + Send + Sync,
    {
        fn cop(&self, side: SockSide) -> Option<(f64, f64)> {
            Some((self.script)(side, self.clock.elapsed()))
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn engine<F>(catalog: Catalog, settings: EngineSettings, script: F) -> (ExerciseEngine, ManualClock)
    where
        F: Fn(SockSide, Duration) -> (f64, f64) + Send + Sync + 'static,
    {
        let clock = ManualClock::new();
        let cop = ScriptedCop {
            clock: clock.clone(),
            script,
        };
        let engine = ExerciseEngine::new(
            Arc::new(catalog),
            Arc::new(cop),
            Arc::new(clock.clone()),
            settings,
        );
        (engine, clock)
    }

    fn fine_polling() -> EngineSettings {
        EngineSettings {
            poll: ms(100),
            ..EngineSettings::default()
        }
    }

    fn checked(duration: u32) -> ZonePhase {
        ZonePhase {
            duration,
            zones: Tolerance::new(
                Rect::new((-0.5, 0.5), (-0.7, 0.7)),
                Rect::new((-1.5, 1.5), (-4.0, 4.1)),
            ),
            check_cop: true,
            left_zones: None,
        }
    }

    fn drill(legs: LegsUsed, timing: u32, phases: Vec<ZonePhase>) -> ExerciseDefinition {
        ExerciseDefinition {
            repetition_id: 1,
            name: "Stance".into(),
            legs_used: legs,
            intro: 0,
            demo: 0,
            preparation_cop: 0,
            timing_cop: timing,
            release: 3,
            sets: 1,
            zone_sequence: phases,
            lead_in_ms: 0,
            settle_ms: 0,
            cycling: None,
        }
    }

    fn out_between(from: u64, to: u64) -> impl Fn(SockSide, Duration) -> (f64, f64) {
        move |_, t| {
            if t >= ms(from) && t < ms(to) {
                (3.0, 0.0)
            } else {
                (0.0, 0.0)
            }
        }
    }

    #[test]
    fn loss_timer_threshold() {
        let t0 = Instant::now();
        let threshold = Duration::from_secs(4);

        let mut foot = FootTracker::default();
        assert!(!foot.observe(Zone::Outside, t0, threshold));
        assert!(!foot.observe(Zone::Outside, t0 + ms(3900), threshold));
        assert!(foot.observe(Zone::Outside, t0 + ms(4100), threshold));

        let mut foot = FootTracker::default();
        foot.observe(Zone::Outside, t0, threshold);
        foot.observe(Zone::Green, t0 + ms(3900), threshold);
        assert!(!foot.observe(Zone::Outside, t0 + ms(4100), threshold));
    }

    #[test]
    fn red_zone_neither_starts_nor_clears_timer() {
        let t0 = Instant::now();
        let threshold = Duration::from_secs(4);
        let mut foot = FootTracker::default();
        assert!(!foot.observe(Zone::FrontLeft, t0, threshold));
        assert!(!foot.observe(Zone::FrontLeft, t0 + ms(5000), threshold));

        foot.observe(Zone::Outside, t0 + ms(5000), threshold);
        assert!(foot.observe(Zone::BackRight, t0 + ms(9000), threshold));
    }

    #[test]
    fn reports_only_changes_above_zero() {
        let mut foot = FootTracker::default();
        assert!(!foot.report(Zone::Outside));
        assert!(foot.report(Zone::Green));
        assert!(!foot.report(Zone::Green));
        assert!(!foot.report(Zone::Outside));
        assert!(foot.report(Zone::FrontRight));
        assert_eq!(foot.previous, Some(Zone::FrontRight));
    }

    #[test]
    fn out_of_zone_under_threshold_keeps_going() {
        let def = drill(LegsUsed::Right, 30, vec![checked(30)]);
        let (engine, clock) = engine(Catalog::builtin(), fine_polling(), out_between(1000, 4900));
        let mut sink = RecordingSink::default();

        let outcome = engine.run_exercise(&def, &mut sink, &CancelToken::new()).unwrap();
        assert_eq!(outcome.restarts, 0);
        assert_eq!(sink.feedback(), vec![(SockSide::Right, 1)]);
        assert_eq!(clock.elapsed(), Duration::from_secs(33));
    }

    #[test]
    fn out_of_zone_past_threshold_restarts() {
        let def = drill(LegsUsed::Right, 30, vec![checked(30)]);
        let (engine, clock) = engine(Catalog::builtin(), fine_polling(), out_between(1000, 5100));
        let mut sink = RecordingSink::default();

        let outcome = engine.run_exercise(&def, &mut sink, &CancelToken::new()).unwrap();
        assert_eq!(outcome.restarts, 1);
        // zone 1 is reported again because the restart forgets it
        assert_eq!(
            sink.feedback(),
            vec![(SockSide::Right, 1), (SockSide::Right, 7), (SockSide::Right, 1)]
        );
        // loss at 5 s, 5 s pause, full 30 s run, 3 s release
        assert_eq!(clock.elapsed(), Duration::from_secs(43));
        let statuses = sink.statuses.lock().unwrap();
        assert!(statuses.iter().any(|s| s == "You lost balance, restarting exercise..."));
    }

    #[test]
    fn unused_foot_is_ignored() {
        let def = drill(LegsUsed::Right, 10, vec![checked(10)]);
        let (engine, _) = engine(Catalog::builtin(), fine_polling(), |side, _| match side {
            SockSide::Left => (9.0, 9.0),
            SockSide::Right => (0.0, 0.0),
        });
        let mut sink = RecordingSink::default();

        let outcome = engine.run_exercise(&def, &mut sink, &CancelToken::new()).unwrap();
        assert_eq!(outcome.restarts, 0);
        assert_eq!(sink.feedback(), vec![(SockSide::Right, 1)]);
    }

    /// Both feet read centered, except the right sock is silent for a while.
    struct DroppedRight {
        clock: ManualClock,
        silent: (Duration, Duration),
    }

    impl CopSource for DroppedRight {
        fn cop(&self, side: SockSide) -> Option<(f64, f64)> {
            let t = self.clock.elapsed();
            let silent = side == SockSide::Right && t >= self.silent.0 && t < self.silent.1;
            (!silent).then_some((0.0, 0.0))
        }
    }

    #[test]
    fn missing_reading_counts_as_outside() {
        let def = drill(LegsUsed::Both, 30, vec![checked(30)]);
        let clock = ManualClock::new();
        let cop = DroppedRight {
            clock: clock.clone(),
            silent: (ms(1000), ms(5100)),
        };
        let engine = ExerciseEngine::new(
            Arc::new(Catalog::builtin()),
            Arc::new(cop),
            Arc::new(clock.clone()),
            fine_polling(),
        );
        let mut sink = RecordingSink::default();

        let outcome = engine.run_exercise(&def, &mut sink, &CancelToken::new()).unwrap();
        assert_eq!(outcome.restarts, 1);
        assert_eq!(
            sink.feedback(),
            vec![
                (SockSide::Left, 1),
                (SockSide::Right, 1),
                (SockSide::Left, 7),
                (SockSide::Right, 7),
                (SockSide::Left, 1),
                (SockSide::Right, 1),
            ]
        );
        assert_eq!(clock.elapsed(), Duration::from_secs(43));
    }

    #[test]
    fn unchecked_phase_cannot_lose_balance() {
        let mut airborne = checked(6);
        airborne.check_cop = false;
        let def = drill(LegsUsed::Both, 8, vec![checked(2), airborne]);
        let (engine, clock) = engine(Catalog::builtin(), fine_polling(), out_between(2000, 8000));
        let mut sink = RecordingSink::default();

        let outcome = engine.run_exercise(&def, &mut sink, &CancelToken::new()).unwrap();
        assert_eq!(outcome.restarts, 0);
        assert_eq!(clock.elapsed(), Duration::from_secs(11));
    }

    #[test]
    fn phases_wrap_until_budget() {
        let def = drill(LegsUsed::Left, 10, vec![checked(2), checked(1)]);
        let (engine, clock) = engine(Catalog::builtin(), fine_polling(), |_, _| (0.0, 0.0));
        let mut sink = RecordingSink::default();

        engine.run_exercise(&def, &mut sink, &CancelToken::new()).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(13));
    }

    fn cycling_drill(phases: usize, rule: CyclingRule) -> ExerciseDefinition {
        let mut sequence: Vec<ZonePhase> = (0..3).map(|_| checked(1)).collect();
        if phases == 4 {
            let mut last = checked(2);
            last.check_cop = false;
            sequence.push(last);
        }
        let mut def = drill(LegsUsed::Both, 100, sequence);
        def.release = 0;
        def.cycling = Some(rule);
        def
    }

    #[test]
    fn cycling_ends_with_unchecked_phase() {
        let rule = CyclingRule {
            repetitions: 4,
            suppress_cross_talk: false,
        };
        let (engine, clock) = engine(Catalog::builtin(), fine_polling(), |_, _| (0.0, 0.0));
        let mut sink = RecordingSink::default();

        engine
            .run_exercise(&cycling_drill(4, rule), &mut sink, &CancelToken::new())
            .unwrap();
        // warm-up, four alternations, final wait
        assert_eq!(clock.elapsed(), Duration::from_secs(1 + 4 + 2));
    }

    #[test]
    fn cycling_without_final_phase_ends_after_repetitions() {
        let rule = CyclingRule {
            repetitions: 4,
            suppress_cross_talk: false,
        };
        let (engine, clock) = engine(Catalog::builtin(), fine_polling(), |_, _| (0.0, 0.0));
        let mut sink = RecordingSink::default();

        engine
            .run_exercise(&cycling_drill(3, rule), &mut sink, &CancelToken::new())
            .unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn cross_talk_blanks_right_after_left_report_in_phase_two() {
        let rule = CyclingRule {
            repetitions: 2,
            suppress_cross_talk: true,
        };
        // both feet step into red for one poll at the start of phase 2
        let (engine, _) = engine(Catalog::builtin(), EngineSettings::default(), |side, t| {
            if t >= ms(2000) && t < ms(2500) {
                match side {
                    SockSide::Left => (-1.0, 1.0),
                    SockSide::Right => (1.0, 1.0),
                }
            } else {
                (0.0, 0.0)
            }
        });
        let mut sink = RecordingSink::default();

        engine
            .run_exercise(&cycling_drill(3, rule), &mut sink, &CancelToken::new())
            .unwrap();
        assert_eq!(
            sink.feedback(),
            vec![
                (SockSide::Left, 1),
                (SockSide::Right, 1),
                (SockSide::Left, 4),
                (SockSide::Left, 1),
            ]
        );
    }

    #[test]
    fn without_cross_talk_rule_both_feet_report() {
        let rule = CyclingRule {
            repetitions: 2,
            suppress_cross_talk: false,
        };
        let (engine, _) = engine(Catalog::builtin(), EngineSettings::default(), |side, t| {
            if t >= ms(2000) && t < ms(2500) {
                match side {
                    SockSide::Left => (-1.0, 1.0),
                    SockSide::Right => (1.0, 1.0),
                }
            } else {
                (0.0, 0.0)
            }
        });
        let mut sink = RecordingSink::default();

        engine
            .run_exercise(&cycling_drill(3, rule), &mut sink, &CancelToken::new())
            .unwrap();
        assert!(sink.feedback().contains(&(SockSide::Right, 3)));
    }

    #[test]
    fn preparation_waits_for_steady_feet() {
        let mut def = drill(LegsUsed::Both, 10, vec![checked(10)]);
        def.preparation_cop = 3;
        let (engine, clock) = engine(Catalog::builtin(), EngineSettings::default(), |side, t| {
            match side {
                SockSide::Right if t < ms(2000) => (2.5, 0.0),
                _ => (1.0, -2.0),
            }
        });
        let mut sink = RecordingSink::default();

        engine
            .check_preparation(&def, &mut sink, &CancelToken::new())
            .unwrap();
        // last unsteady poll at 1 s, held from there for 3 s
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn cancelled_preparation_stops() {
        let mut def = drill(LegsUsed::Both, 10, vec![checked(10)]);
        def.preparation_cop = 3;
        let (engine, _) = engine(Catalog::builtin(), EngineSettings::default(), |_, _| (9.0, 9.0));
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = engine.check_preparation(&def, &mut RecordingSink::default(), &cancel);
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn repeat_group_is_taken_once() {
        let catalog = Catalog::builtin();
        let mut state = ProgramState::default();
        assert!(!state.is_completed(2));
        assert_eq!(state.take_repeat_group(&catalog, 2), Some(vec![1, 2]));
        assert!(state.is_completed(2));
        assert_eq!(state.take_repeat_group(&catalog, 2), None);
        assert_eq!(state.take_repeat_group(&catalog, 3), None);
    }

    #[test]
    fn reaching_an_exercise_twice_replays_its_group_once() {
        let (engine, _) = engine(Catalog::builtin(), EngineSettings::default(), |_, _| (0.1, 0.1));
        let def = engine.catalog().get(2).unwrap().clone();
        let mut state = ProgramState::default();
        let mut sink = RecordingSink::default();
        let cancel = CancelToken::new();

        let ids = |outcomes: Vec<ExerciseOutcome>| -> Vec<u32> {
            outcomes.iter().map(|o| o.repetition_id).collect()
        };
        let first = engine.run_definition(&def, &mut state, &mut sink, &cancel).unwrap();
        assert_eq!(ids(first), vec![2, 1, 2]);
        let second = engine.run_definition(&def, &mut state, &mut sink, &cancel).unwrap();
        assert_eq!(ids(second), vec![2]);
    }

    #[test]
    fn program_runs_every_exercise_in_order() {
        // front-right of centre: green or a red quadrant in every phase
        let (engine, _) = engine(Catalog::builtin(), EngineSettings::default(), |_, _| (0.1, 0.1));
        let mut sink = RecordingSink::default();

        let outcomes = engine.run_program(&mut sink, &CancelToken::new()).unwrap();
        let ids: Vec<u32> = outcomes.iter().map(|o| o.repetition_id).collect();
        assert_eq!(
            ids,
            vec![1, 2, 1, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 8, 7, 8, 9, 9]
        );
        assert!(outcomes.iter().all(|o| o.restarts == 0));
        assert_eq!(sink.configs(), vec![1, 2, 1, 2, 3, 4, 5, 6, 7, 8, 7, 8, 9]);
        assert_eq!(
            sink.statuses.lock().unwrap().last().map(String::as_str),
            Some("All exercises completed!")
        );
    }

    #[test]
    fn cancellation_aborts_a_run() {
        let def = drill(LegsUsed::Right, 30, vec![checked(30)]);
        let (engine, _) = engine(Catalog::builtin(), EngineSettings::default(), |_, _| (0.0, 0.0));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            engine.run_exercise(&def, &mut RecordingSink::default(), &cancel),
            Err(Cancelled)
        );
    }
}
