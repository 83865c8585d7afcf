//! Beacon region monitoring
//!
//! Raw proximity samples from the platform are folded into a committed
//! per-beacon [`ProximityState`]. A new reading only commits after it has
//! held for the stability window, so a beacon hovering at the edge of range
//! does not flap between enter and exit.
//!
//! Commits are evaluated when a sample arrives and, when a tokio runtime is
//! available, by a per-beacon timer at the end of the window.
//!
//! Observers are called on the thread that delivered the sample (or the
//! timer's worker thread) and must not call back into the monitor.

use crate::config::RegionConfig;
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::types::{
    AuthorizationLevel, AuthorizationStatus, BeaconRegion, Location, Properties, Proximity,
    ProximityState,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Receives debounced region transitions
pub trait RegionObserver: Send + Sync {
    fn on_region_enter(&self, beacon: &BeaconRegion);
    fn on_region_exit(&self, beacon: &BeaconRegion);
}

/// The platform's location/bluetooth stack
pub trait LocationProvider: Send + Sync {
    /// Start delivering proximity samples for `region`
    fn start_monitoring(&self, region: &BeaconRegion) -> Result<()>;
    fn stop_monitoring(&self, region: &BeaconRegion);
    /// Prompt the user for `level`
    fn request_authorization(&self, level: AuthorizationLevel);
    /// Ask for a fresh location fix
    fn request_location(&self) -> Result<()>;
}

/// Provider for hosts without a location stack
#[derive(Debug, Default)]
pub struct NoopLocationProvider;

impl LocationProvider for NoopLocationProvider {
    fn start_monitoring(&self, _region: &BeaconRegion) -> Result<()> {
        Ok(())
    }

    fn stop_monitoring(&self, _region: &BeaconRegion) {}

    fn request_authorization(&self, _level: AuthorizationLevel) {}

    fn request_location(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionKind {
    Enter,
    Exit,
}

impl TransitionKind {
    fn as_str(self) -> &'static str {
        match self {
            TransitionKind::Enter => "enter",
            TransitionKind::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    beacon: BeaconRegion,
    kind: TransitionKind,
}

#[derive(Debug)]
struct Candidate {
    facing: ProximityState,
    since: Instant,
    samples: u32,
}

#[derive(Debug, Default)]
struct BeaconTrack {
    state: ProximityState,
    candidate: Option<Candidate>,
    timer: Option<JoinHandle<()>>,
}

impl BeaconTrack {
    fn clear_candidate(&mut self) {
        self.candidate = None;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Commit the candidate if it has held long enough
    fn try_commit(
        &mut self,
        beacon: BeaconRegion,
        now: Instant,
        window: Duration,
        min_samples: u32,
    ) -> Option<Transition> {
        let ready = match &self.candidate {
            Some(c) => c.samples >= min_samples && now.saturating_duration_since(c.since) >= window,
            None => false,
        };
        if !ready {
            return None;
        }

        let facing = self.candidate.as_ref().map(|c| c.facing)?;
        let previous = self.state;
        self.state = facing;
        self.clear_candidate();

        match (previous, facing) {
            (ProximityState::Inside, ProximityState::Inside) => None,
            (_, ProximityState::Inside) => Some(Transition {
                beacon,
                kind: TransitionKind::Enter,
            }),
            (ProximityState::Inside, ProximityState::Outside) => Some(Transition {
                beacon,
                kind: TransitionKind::Exit,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    regions: Vec<BeaconRegion>,
    beacons: HashMap<BeaconRegion, BeaconTrack>,
    authorization: AuthorizationStatus,
    location: Option<Location>,
}

impl MonitorState {
    fn is_monitored(&self, beacon: &BeaconRegion) -> bool {
        self.regions.iter().any(|region| region.matches(beacon))
    }

    fn clear_all(&mut self) {
        for track in self.beacons.values_mut() {
            track.clear_candidate();
        }
        self.beacons.clear();
    }
}

struct Shared {
    config: RegionConfig,
    provider: Arc<dyn LocationProvider>,
    observer: RwLock<Option<Weak<dyn RegionObserver>>>,
    queue: Option<Arc<EventQueue>>,
    state: Mutex<MonitorState>,
    /// Monitoring enabled. Held for reading while a transition is committed
    /// and emitted, so disabling waits for in-flight notifications.
    enabled: RwLock<bool>,
    runtime: Option<Handle>,
}

impl Shared {
    fn observe(
        self: &Arc<Self>,
        beacon: BeaconRegion,
        proximity: Proximity,
        now: Instant,
    ) -> Option<Transition> {
        let mut state = self.state.lock();
        if is_blocked(state.authorization) {
            tracing::trace!(beacon = %beacon, "Sample ignored, location not authorized");
            return None;
        }
        if !state.is_monitored(&beacon) {
            tracing::trace!(beacon = %beacon, "Sample for unmonitored beacon ignored");
            return None;
        }

        let facing = proximity.facing();
        let track = state.beacons.entry(beacon).or_default();
        if facing == track.state {
            track.clear_candidate();
            return None;
        }

        let continues = matches!(&track.candidate, Some(c) if c.facing == facing);
        if continues {
            if let Some(candidate) = track.candidate.as_mut() {
                candidate.samples += 1;
            }
        } else {
            track.clear_candidate();
            track.candidate = Some(Candidate {
                facing,
                since: now,
                samples: 1,
            });
            track.timer = self.schedule_timer(beacon);
        }

        track.try_commit(
            beacon,
            now,
            self.config.stable_window(),
            self.config.min_samples,
        )
    }

    fn schedule_timer(self: &Arc<Self>, beacon: BeaconRegion) -> Option<JoinHandle<()>> {
        let runtime = self.runtime.as_ref()?;
        let window = self.config.stable_window();
        let weak = Arc::downgrade(self);
        Some(runtime.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(shared) = weak.upgrade() {
                shared.evaluate(Some(beacon), Instant::now());
            }
        }))
    }

    /// Commit every candidate (or just `only`'s) that has held long enough
    fn evaluate(&self, only: Option<BeaconRegion>, now: Instant) {
        let enabled = self.enabled.read_recursive();
        if !*enabled {
            return;
        }

        let transitions: Vec<Transition> = {
            let mut state = self.state.lock();
            let window = self.config.stable_window();
            let min_samples = self.config.min_samples;
            state
                .beacons
                .iter_mut()
                .filter(|(beacon, _)| only.map_or(true, |b| b == **beacon))
                .filter_map(|(beacon, track)| track.try_commit(*beacon, now, window, min_samples))
                .collect()
        };

        for transition in transitions {
            self.emit(transition);
        }
    }

    fn emit(&self, transition: Transition) {
        tracing::info!(
            beacon = %transition.beacon,
            transition = transition.kind.as_str(),
            "Region transition"
        );

        let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            let beacon = transition.beacon;
            let notified = catch_unwind(AssertUnwindSafe(|| match transition.kind {
                TransitionKind::Enter => observer.on_region_enter(&beacon),
                TransitionKind::Exit => observer.on_region_exit(&beacon),
            }));
            if notified.is_err() {
                tracing::error!(beacon = %beacon, "Region observer panicked");
            }
        }

        if !self.config.emit_events {
            return;
        }
        if let Some(queue) = &self.queue {
            let beacon = transition.beacon;
            let properties = Properties::keyed([
                ("uuid", json!(beacon.uuid.to_string())),
                ("major", json!(beacon.major)),
                ("minor", json!(beacon.minor)),
                ("action", json!(transition.kind.as_str())),
            ]);
            if let Err(e) = queue.add_event(properties, &self.config.collection) {
                tracing::warn!(error = %e, "Could not enqueue region event");
            }
        }
    }
}

fn is_blocked(status: AuthorizationStatus) -> bool {
    matches!(
        status,
        AuthorizationStatus::Denied | AuthorizationStatus::Restricted
    )
}

/// Run a provider call, downgrading a panic to an error
fn guarded<T>(operation: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!(operation, "Location provider panicked");
        Err(Error::Authorization(format!(
            "location provider failed during {}",
            operation
        )))
    })
}

/// Converts proximity samples into debounced enter/exit notifications
pub struct RegionMonitor {
    shared: Arc<Shared>,
}

impl RegionMonitor {
    /// Create a monitor.
    ///
    /// `queue` receives enter/exit events when `config.emit_events` is set.
    /// Without a `runtime`, candidates commit only when a later sample
    /// arrives or [`RegionMonitor::evaluate_pending`] is called.
    pub fn new(
        config: RegionConfig,
        provider: Arc<dyn LocationProvider>,
        queue: Option<Arc<EventQueue>>,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                provider,
                observer: RwLock::new(None),
                queue,
                state: Mutex::new(MonitorState::default()),
                enabled: RwLock::new(true),
                runtime,
            }),
        }
    }

    /// Register the observer. Only a weak reference is kept.
    pub fn set_observer(&self, observer: Weak<dyn RegionObserver>) {
        *self.shared.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.shared.observer.write() = None;
    }

    /// Start monitoring `region`
    pub fn monitor_region(&self, region: BeaconRegion) -> Result<()> {
        let enabled = self.shared.enabled.read_recursive();
        {
            let mut state = self.shared.state.lock();
            if is_blocked(state.authorization) {
                return Err(Error::Authorization(format!(
                    "location access {:?}, cannot monitor {}",
                    state.authorization, region
                )));
            }
            if state.regions.contains(&region) {
                return Ok(());
            }
            state.regions.push(region);
        }
        tracing::info!(region = %region, enabled = *enabled, "Monitoring region");

        if *enabled {
            let provider = self.shared.provider.clone();
            guarded("start_monitoring", || provider.start_monitoring(&region))?;
        }
        Ok(())
    }

    /// Stop monitoring `region` and forget its beacons' state
    pub fn stop_monitoring_region(&self, region: &BeaconRegion) {
        let removed = {
            let mut state = self.shared.state.lock();
            let before = state.regions.len();
            state.regions.retain(|r| r != region);
            let removed = state.regions.len() != before;
            let stale: Vec<BeaconRegion> = state
                .beacons
                .keys()
                .filter(|beacon| region.matches(beacon))
                .copied()
                .collect();
            for beacon in stale {
                if let Some(mut track) = state.beacons.remove(&beacon) {
                    track.clear_candidate();
                }
            }
            removed
        };
        if removed {
            let provider = self.shared.provider.clone();
            let _ = guarded("stop_monitoring", || {
                provider.stop_monitoring(region);
                Ok(())
            });
        }
    }

    pub fn monitored_regions(&self) -> Vec<BeaconRegion> {
        self.shared.state.lock().regions.clone()
    }

    /// Platform callback: a proximity reading for a concrete beacon
    pub fn on_proximity_sample(&self, beacon: BeaconRegion, proximity: Proximity) {
        self.process_sample(beacon, proximity, Instant::now());
    }

    /// Feed a sample observed at `now`
    pub fn process_sample(&self, beacon: BeaconRegion, proximity: Proximity, now: Instant) {
        let enabled = self.shared.enabled.read_recursive();
        if !*enabled {
            tracing::trace!(beacon = %beacon, "Sample discarded, monitoring disabled");
            return;
        }
        if let Some(transition) = self.shared.observe(beacon, proximity, now) {
            self.shared.emit(transition);
        }
    }

    /// Commit candidates whose window has elapsed by `now`
    pub fn evaluate_pending(&self, now: Instant) {
        self.shared.evaluate(None, now);
    }

    /// Committed state of a concrete beacon
    pub fn state_of(&self, beacon: &BeaconRegion) -> ProximityState {
        self.shared
            .state
            .lock()
            .beacons
            .get(beacon)
            .map(|track| track.state)
            .unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        *self.shared.enabled.read()
    }

    /// Resume monitoring every registered region
    pub fn enable(&self) {
        let regions = {
            let mut enabled = self.shared.enabled.write();
            if *enabled {
                return;
            }
            *enabled = true;
            self.shared.state.lock().regions.clone()
        };
        tracing::info!(regions = regions.len(), "Region monitoring enabled");

        let provider = self.shared.provider.clone();
        for region in regions {
            if let Err(e) = guarded("start_monitoring", || provider.start_monitoring(&region)) {
                tracing::warn!(region = %region, error = %e, "Could not resume region monitoring");
            }
        }
    }

    /// Stop all monitoring before returning.
    ///
    /// Waits for notifications already being delivered, cancels pending
    /// timers and unsubscribes every region. Samples arriving afterwards
    /// are discarded.
    pub fn disable(&self) {
        let regions = {
            let mut enabled = self.shared.enabled.write();
            if !*enabled {
                return;
            }
            *enabled = false;
            let mut state = self.shared.state.lock();
            state.clear_all();
            state.regions.clone()
        };
        tracing::info!(regions = regions.len(), "Region monitoring disabled");

        let provider = self.shared.provider.clone();
        for region in regions {
            let _ = guarded("stop_monitoring", || {
                provider.stop_monitoring(&region);
                Ok(())
            });
        }
    }

    /// Forward an authorization request to the platform
    pub fn request_authorization(&self, level: AuthorizationLevel) -> Result<()> {
        let provider = self.shared.provider.clone();
        guarded("request_authorization", || {
            provider.request_authorization(level);
            Ok(())
        })
    }

    /// Platform callback: the authorization grant changed
    pub fn on_authorization_changed(&self, status: AuthorizationStatus) {
        let mut state = self.shared.state.lock();
        tracing::info!(from = ?state.authorization, to = ?status, "Location authorization changed");
        state.authorization = status;
        if is_blocked(status) {
            state.clear_all();
        }
    }

    pub fn authorization_status(&self) -> AuthorizationStatus {
        self.shared.state.lock().authorization
    }

    /// Platform callback: a new location fix
    pub fn on_location_update(&self, location: Location) {
        if !*self.shared.enabled.read_recursive() {
            return;
        }
        self.shared.state.lock().location = Some(location);
    }

    pub fn current_location(&self) -> Option<Location> {
        self.shared.state.lock().location
    }

    /// Ask the platform for a fresh location fix
    pub fn refresh_current_location(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::Config("geo location is disabled".to_string()));
        }
        let status = self.authorization_status();
        if is_blocked(status) {
            return Err(Error::Authorization(format!(
                "location access {:?}",
                status
            )));
        }
        let provider = self.shared.provider.clone();
        guarded("request_location", || provider.request_location())
    }
}

impl Drop for RegionMonitor {
    fn drop(&mut self) {
        self.shared.state.lock().clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::VisitorIdentityStore;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingObserver {
        enters: AtomicUsize,
        exits: AtomicUsize,
    }

    impl RegionObserver for CountingObserver {
        fn on_region_enter(&self, _beacon: &BeaconRegion) {
            self.enters.fetch_add(1, Ordering::SeqCst);
        }
        fn on_region_exit(&self, _beacon: &BeaconRegion) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Observer whose callbacks take a while, counting starts and ends
    #[derive(Default)]
    struct SlowObserver {
        started: AtomicUsize,
        completed: AtomicUsize,
    }

    impl SlowObserver {
        fn notify(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RegionObserver for SlowObserver {
        fn on_region_enter(&self, _beacon: &BeaconRegion) {
            self.notify();
        }
        fn on_region_exit(&self, _beacon: &BeaconRegion) {
            self.notify();
        }
    }

    #[derive(Default)]
    struct RecordingProvider {
        started: Mutex<Vec<BeaconRegion>>,
        stopped: Mutex<Vec<BeaconRegion>>,
        requested: Mutex<Vec<AuthorizationLevel>>,
    }

    impl LocationProvider for RecordingProvider {
        fn start_monitoring(&self, region: &BeaconRegion) -> Result<()> {
            self.started.lock().push(*region);
            Ok(())
        }
        fn stop_monitoring(&self, region: &BeaconRegion) {
            self.stopped.lock().push(*region);
        }
        fn request_authorization(&self, level: AuthorizationLevel) {
            self.requested.lock().push(level);
        }
        fn request_location(&self) -> Result<()> {
            Ok(())
        }
    }

    const WINDOW: Duration = Duration::from_millis(100);

    struct Fixture {
        monitor: RegionMonitor,
        observer: Arc<CountingObserver>,
        provider: Arc<RecordingProvider>,
        beacon: BeaconRegion,
        start: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_queue(None)
        }

        fn with_queue(queue: Option<Arc<EventQueue>>) -> Self {
            let config = RegionConfig {
                stable_window_ms: WINDOW.as_millis() as u64,
                ..Default::default()
            };
            let provider = Arc::new(RecordingProvider::default());
            let monitor = RegionMonitor::new(config, provider.clone(), queue, None);
            let observer = Arc::new(CountingObserver::default());
            let weak: Weak<dyn RegionObserver> = Arc::downgrade(&(observer.clone() as Arc<dyn RegionObserver>));
            monitor.set_observer(weak);

            let uuid = Uuid::new_v4();
            monitor.monitor_region(BeaconRegion::new(uuid)).unwrap();

            Self {
                monitor,
                observer,
                provider,
                beacon: BeaconRegion::beacon(uuid, 1, 7),
                start: Instant::now(),
            }
        }

        /// Feed samples spaced `step` apart, starting `offset` after start
        fn feed(&self, samples: &[Proximity], offset: Duration, step: Duration) -> Duration {
            let mut at = offset;
            for proximity in samples {
                self.monitor
                    .process_sample(self.beacon, *proximity, self.start + at);
                at += step;
            }
            at
        }

        fn settle_outside(&self) -> Duration {
            let at = self.feed(&[Proximity::Far], Duration::ZERO, WINDOW);
            self.monitor.evaluate_pending(self.start + at);
            assert_eq!(self.monitor.state_of(&self.beacon), ProximityState::Outside);
            at
        }

        fn enters(&self) -> usize {
            self.observer.enters.load(Ordering::SeqCst)
        }

        fn exits(&self) -> usize {
            self.observer.exits.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_unknown_to_outside_is_silent() {
        let f = Fixture::new();
        f.settle_outside();
        assert_eq!(f.enters(), 0);
        assert_eq!(f.exits(), 0);
    }

    #[test]
    fn test_enter_then_exit_fire_once_each() {
        let f = Fixture::new();
        let at = f.settle_outside();

        let held = WINDOW + Duration::from_millis(1);
        let at = f.feed(
            &[Proximity::Far, Proximity::Near, Proximity::Immediate],
            at,
            held,
        );
        f.monitor.evaluate_pending(f.start + at);
        assert_eq!(f.enters(), 1);
        assert_eq!(f.monitor.state_of(&f.beacon), ProximityState::Inside);

        let at = f.feed(
            &[Proximity::Immediate, Proximity::Near, Proximity::Far],
            at,
            held,
        );
        f.monitor.evaluate_pending(f.start + at + held);
        assert_eq!(f.enters(), 1);
        assert_eq!(f.exits(), 1);
        assert_eq!(f.monitor.state_of(&f.beacon), ProximityState::Outside);
    }

    #[test]
    fn test_stable_inside_does_not_refire() {
        let f = Fixture::new();
        let at = f.settle_outside();
        let at = f.feed(&[Proximity::Near; 6], at, WINDOW);
        f.monitor.evaluate_pending(f.start + at);
        assert_eq!(f.enters(), 1);
    }

    #[test]
    fn test_flapping_within_window_is_suppressed() {
        let f = Fixture::new();
        let at = f.settle_outside();

        let quick = WINDOW / 5;
        let at = f.feed(
            &[Proximity::Near, Proximity::Far, Proximity::Near, Proximity::Far],
            at,
            quick,
        );
        f.monitor.evaluate_pending(f.start + at + WINDOW * 2);

        assert_eq!(f.enters(), 0);
        assert_eq!(f.exits(), 0);
        assert_eq!(f.monitor.state_of(&f.beacon), ProximityState::Outside);
    }

    #[test]
    fn test_disable_stops_notifications_and_unsubscribes() {
        let f = Fixture::new();
        let at = f.settle_outside();
        f.feed(&[Proximity::Near], at, WINDOW);

        f.monitor.disable();
        assert!(!f.monitor.is_enabled());
        assert_eq!(f.provider.stopped.lock().len(), 1);

        // pending candidate was cancelled and new samples are discarded
        let later = f.feed(&[Proximity::Immediate; 4], at + WINDOW, WINDOW);
        f.monitor.evaluate_pending(f.start + later + WINDOW);
        assert_eq!(f.enters(), 0);
        assert_eq!(f.monitor.state_of(&f.beacon), ProximityState::Unknown);

        f.monitor.enable();
        assert_eq!(f.provider.started.lock().len(), 2);
    }

    #[test]
    fn test_disable_on_another_thread_fences_notifications() {
        let config = RegionConfig {
            stable_window_ms: 0,
            ..Default::default()
        };
        let monitor = RegionMonitor::new(config, Arc::new(RecordingProvider::default()), None, None);
        let observer = Arc::new(SlowObserver::default());
        let weak: Weak<dyn RegionObserver> =
            Arc::downgrade(&(observer.clone() as Arc<dyn RegionObserver>));
        monitor.set_observer(weak);
        let uuid = Uuid::new_v4();
        monitor.monitor_region(BeaconRegion::new(uuid)).unwrap();
        let beacon = BeaconRegion::beacon(uuid, 1, 7);
        let stop = AtomicBool::new(false);

        let (at_disable, after_pause) = std::thread::scope(|scope| {
            let sampler = scope.spawn(|| {
                let mut near = true;
                while !stop.load(Ordering::SeqCst) {
                    let proximity = if near { Proximity::Immediate } else { Proximity::Far };
                    monitor.on_proximity_sample(beacon, proximity);
                    near = !near;
                }
            });

            let deadline = Instant::now() + Duration::from_secs(5);
            while observer.started.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
                std::thread::yield_now();
            }
            monitor.disable();
            let at_disable = (
                observer.started.load(Ordering::SeqCst),
                observer.completed.load(Ordering::SeqCst),
            );
            std::thread::sleep(Duration::from_millis(50));
            let after_pause = observer.started.load(Ordering::SeqCst);

            stop.store(true, Ordering::SeqCst);
            sampler.join().unwrap();
            (at_disable, after_pause)
        });

        let (started, completed) = at_disable;
        assert!(started >= 2, "sampler never produced a transition");
        // nothing was mid-callback when disable returned, nothing started after
        assert_eq!(started, completed);
        assert_eq!(after_pause, started);
    }

    #[test]
    fn test_denied_authorization_blocks_samples() {
        let f = Fixture::new();
        f.monitor
            .on_authorization_changed(AuthorizationStatus::Denied);
        f.feed(&[Proximity::Near; 3], Duration::ZERO, WINDOW);
        assert_eq!(f.enters(), 0);
        assert!(matches!(
            f.monitor.refresh_current_location(),
            Err(Error::Authorization(_))
        ));
        assert!(matches!(
            f.monitor.monitor_region(BeaconRegion::new(Uuid::new_v4())),
            Err(Error::Authorization(_))
        ));
    }

    #[test]
    fn test_unmonitored_beacon_is_ignored() {
        let f = Fixture::new();
        let stranger = BeaconRegion::beacon(Uuid::new_v4(), 1, 1);
        for i in 0..4 {
            f.monitor
                .process_sample(stranger, Proximity::Immediate, f.start + WINDOW * i);
        }
        assert_eq!(f.enters(), 0);
        assert_eq!(f.monitor.state_of(&stranger), ProximityState::Unknown);
    }

    #[test]
    fn test_dropped_observer_is_not_called() {
        let f = Fixture::new();
        let at = f.settle_outside();
        let Fixture {
            monitor, observer, beacon, start, ..
        } = f;
        drop(observer);
        monitor.process_sample(beacon, Proximity::Near, start + at);
        monitor.process_sample(beacon, Proximity::Near, start + at + WINDOW);
        assert_eq!(monitor.state_of(&beacon), ProximityState::Inside);
    }

    #[test]
    fn test_transitions_enqueue_events() {
        let identity = Arc::new(VisitorIdentityStore::new(Arc::new(MemoryStore::new())));
        let queue = Arc::new(EventQueue::new(identity, 10));
        let f = Fixture::with_queue(Some(queue.clone()));
        let at = f.settle_outside();
        let at = f.feed(&[Proximity::Near, Proximity::Near], at, WINDOW);
        f.feed(&[Proximity::Far, Proximity::Far], at, WINDOW);

        let events = queue.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].collection_name, "beacon");
        match &events[0].properties {
            Properties::Keyed(pairs) => {
                assert_eq!(pairs[0].0, "uuid");
                assert_eq!(pairs[3], ("action".to_string(), json!("enter")));
            }
            other => panic!("unexpected properties {:?}", other),
        }
        match &events[1].properties {
            Properties::Keyed(pairs) => assert_eq!(pairs[3].1, json!("exit")),
            other => panic!("unexpected properties {:?}", other),
        }
    }

    #[test]
    fn test_authorization_request_is_forwarded() {
        let f = Fixture::new();
        f.monitor
            .request_authorization(AuthorizationLevel::WhenInUse)
            .unwrap();
        assert_eq!(
            *f.provider.requested.lock(),
            vec![AuthorizationLevel::WhenInUse]
        );
    }

    #[tokio::test]
    async fn test_timer_commits_single_sample_after_window() {
        let config = RegionConfig {
            stable_window_ms: 20,
            ..Default::default()
        };
        let monitor = RegionMonitor::new(
            config,
            Arc::new(NoopLocationProvider),
            None,
            Some(Handle::current()),
        );
        let observer = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn RegionObserver> = observer.clone();
        monitor.set_observer(Arc::downgrade(&as_dyn));
        let uuid = Uuid::new_v4();
        monitor.monitor_region(BeaconRegion::new(uuid)).unwrap();
        let beacon = BeaconRegion::beacon(uuid, 3, 4);

        monitor.on_proximity_sample(beacon, Proximity::Immediate);
        assert_eq!(observer.enters.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(observer.enters.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state_of(&beacon), ProximityState::Inside);
    }
}
