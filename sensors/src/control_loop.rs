//! Control loop task
//!
//! Owns every batch's [`TemperatureController`]. Runs one evaluation per tick
//! and serves override/status requests arriving over a channel, so controller
//! state is only ever touched from this task.

use crate::control::{
    Command, ControlCondition, ControlError, ControlEvent, ControlEventKind, ControlSettings, ControllerConfig,
    ControllerStatus, DeviceRole, TemperatureController,
};
use crate::hub::BroadcastHub;
use crate::linker::BatchLinker;
use crate::manager::PipelineManager;
use crate::recording::SessionRecorder;
use crate::store::ReadingStore;
use chrono::{DateTime, Duration, Utc};
use fermwatch_hal::actuator::{ControlSurface, SwitchState};
use fermwatch_hal::Clock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, MissedTickBehavior};

type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

/// Requests served by the control loop
#[derive(Debug)]
pub enum ControlRequest {
    SetOverride {
        batch_id: String,
        role: DeviceRole,
        state: SwitchState,
        duration: Duration,
        reply: Reply<ControllerStatus>,
    },
    /// `role: None` clears both overrides
    ClearOverride {
        batch_id: String,
        role: Option<DeviceRole>,
        reply: Reply<ControllerStatus>,
    },
    Status {
        batch_id: String,
        reply: Reply<ControllerStatus>,
    },
    List {
        reply: Reply<Vec<ControllerStatus>>,
    },
}

/// Cloneable client for the control loop
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ControlRequest) -> Result<T, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ControlError::LoopStopped)?;
        rx.await.map_err(|_| ControlError::LoopStopped)?
    }

    pub async fn set_override(
        &self,
        batch_id: &str,
        role: DeviceRole,
        state: SwitchState,
        duration: Duration,
    ) -> Result<ControllerStatus, ControlError> {
        let batch_id = batch_id.to_string();
        self.request(|reply| ControlRequest::SetOverride { batch_id, role, state, duration, reply })
            .await
    }

    pub async fn clear_override(&self, batch_id: &str, role: Option<DeviceRole>) -> Result<ControllerStatus, ControlError> {
        let batch_id = batch_id.to_string();
        self.request(|reply| ControlRequest::ClearOverride { batch_id, role, reply })
            .await
    }

    pub async fn status(&self, batch_id: &str) -> Result<ControllerStatus, ControlError> {
        let batch_id = batch_id.to_string();
        self.request(|reply| ControlRequest::Status { batch_id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<ControllerStatus>, ControlError> {
        self.request(|reply| ControlRequest::List { reply }).await
    }
}

pub struct ControlLoop {
    config: ControllerConfig,
    linker: Arc<BatchLinker>,
    store: Arc<ReadingStore>,
    surface: Arc<dyn ControlSurface>,
    clock: Arc<dyn Clock>,
    hub: Option<Arc<BroadcastHub>>,
    recorder: Option<Arc<Mutex<SessionRecorder>>>,
    manager: Option<Arc<PipelineManager>>,
    controllers: HashMap<String, TemperatureController>,
    requests: mpsc::Receiver<ControlRequest>,
}

impl ControlLoop {
    pub fn new(
        config: ControllerConfig,
        linker: Arc<BatchLinker>,
        store: Arc<ReadingStore>,
        surface: Arc<dyn ControlSurface>,
        clock: Arc<dyn Clock>,
    ) -> (Self, ControlHandle) {
        let (tx, requests) = mpsc::channel(32);
        let control_loop = Self {
            config,
            linker,
            store,
            surface,
            clock,
            hub: None,
            recorder: None,
            manager: None,
            controllers: HashMap::new(),
            requests,
        };
        (control_loop, ControlHandle { tx })
    }

    pub fn with_hub(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<Mutex<SessionRecorder>>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Evict idle fusion pipelines on every tick.
    pub fn with_manager(mut self, manager: Arc<PipelineManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn controller(&self, batch_id: &str) -> Option<&TemperatureController> {
        self.controllers.get(batch_id)
    }

    /// Run until shutdown. A tick that has started always finishes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(self.config.tick_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requests_open = true;

        tracing::info!(tick_secs = self.config.tick_secs, "Control loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => self.handle(request),
                    None => requests_open = false,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Control loop stopped");
    }

    /// One evaluation of every active batch.
    pub async fn tick(&mut self) {
        self.linker.refresh_if_due().await;
        let now = self.clock.now();
        let batches = self.linker.active_batches();
        let limit = std::time::Duration::from_secs(self.config.actuator_timeout_secs.max(1));
        let mut events = Vec::new();

        // controllers of departed batches switch off before they are dropped
        let active: HashSet<&str> = batches.iter().map(|b| b.id.as_str()).collect();
        let departed: Vec<String> = self
            .controllers
            .keys()
            .filter(|id| !active.contains(id.as_str()))
            .cloned()
            .collect();
        for batch_id in departed {
            let Some(controller) = self.controllers.get_mut(&batch_id) else { continue };
            events.extend(controller.deactivate(now));
            let decision = controller.release(now);
            events.extend(execute(self.surface.as_ref(), limit, controller, &decision.commands, None, now).await);
            if controller.is_idle() {
                self.controllers.remove(&batch_id);
                tracing::info!(batch_id = %batch_id, "Controller dropped");
            } else {
                tracing::debug!(batch_id = %batch_id, deferred = ?decision.deferred, "Waiting to switch off");
            }
        }

        for batch in &batches {
            let controller = self.controllers.entry(batch.id.clone()).or_insert_with(|| {
                tracing::info!(batch_id = %batch.id, "Controller activated");
                let controller = TemperatureController::new(&batch.id, self.config.clone(), now);
                events.push(controller.event(now, ControlEventKind::Activated));
                controller
            });
            events.extend(controller.reactivate(now));

            let settings = match ControlSettings::from_batch(batch, &self.config) {
                Ok(settings) => settings,
                Err(reason) => {
                    events.extend(controller.observe_condition(ControlCondition::Inactive(reason), now));
                    let decision = controller.release(now);
                    events.extend(execute(self.surface.as_ref(), limit, controller, &decision.commands, None, now).await);
                    continue;
                }
            };

            let reading = batch.device_id.as_deref().and_then(|d| self.store.latest(d));
            controller.observe_reading(reading.as_ref());
            let decision = controller.evaluate(&settings, reading.as_ref(), now);
            events.extend(controller.expire_overrides(&decision.expired, now));
            events.extend(controller.observe_condition(decision.condition.clone(), now));
            if !decision.deferred.is_empty() {
                tracing::debug!(batch_id = %batch.id, deferred = ?decision.deferred, "Switching deferred");
            }

            let temp_c = reading.as_ref().map(|r| r.temp_filtered_c);
            events.extend(execute(self.surface.as_ref(), limit, controller, &decision.commands, temp_c, now).await);
        }

        if let Some(manager) = &self.manager {
            for device_id in manager.evict_idle(now) {
                self.store.forget(&device_id);
            }
        }

        for event in &events {
            self.emit(event);
        }
    }

    fn emit(&self, event: &ControlEvent) {
        if let Some(hub) = &self.hub {
            hub.publish_event(event);
        }
        if let Some(recorder) = &self.recorder {
            let mut recorder = recorder.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = recorder.record_event(event) {
                tracing::warn!(error = %e, "Failed to record control event");
            }
        }
    }

    fn settings_for(&self, batch_id: &str) -> Result<ControlSettings, ControlError> {
        let batch = self
            .linker
            .batch(batch_id)
            .ok_or_else(|| ControlError::UnknownBatch(batch_id.to_string()))?;
        ControlSettings::from_batch(&batch, &self.config).map_err(|reason| ControlError::Inactive {
            batch_id: batch_id.to_string(),
            reason,
        })
    }

    fn status_of(&self, batch_id: &str) -> Result<ControllerStatus, ControlError> {
        let controller = self
            .controllers
            .get(batch_id)
            .ok_or_else(|| ControlError::UnknownBatch(batch_id.to_string()))?;
        Ok(controller.status(self.settings_for(batch_id).ok()))
    }

    fn handle(&mut self, request: ControlRequest) {
        let now = self.clock.now();
        match request {
            ControlRequest::SetOverride { batch_id, role, state, duration, reply } => {
                let result = self.settings_for(&batch_id).and_then(|settings| {
                    let controller = self
                        .controllers
                        .get_mut(&batch_id)
                        .ok_or_else(|| ControlError::UnknownBatch(batch_id.clone()))?;
                    controller.set_override(&settings, role, state, duration, now)
                });
                let result = result.and_then(|event| {
                    self.emit(&event);
                    self.status_of(&batch_id)
                });
                let _ = reply.send(result);
            }
            ControlRequest::ClearOverride { batch_id, role, reply } => {
                let roles = role.map_or(DeviceRole::ALL.to_vec(), |r| vec![r]);
                let events = match self.controllers.get_mut(&batch_id) {
                    Some(controller) => Ok(roles
                        .into_iter()
                        .filter_map(|r| controller.clear_override(r, now))
                        .collect::<Vec<_>>()),
                    None => Err(ControlError::UnknownBatch(batch_id.clone())),
                };
                let result = events.and_then(|events| {
                    for event in &events {
                        self.emit(event);
                    }
                    self.status_of(&batch_id)
                });
                let _ = reply.send(result);
            }
            ControlRequest::Status { batch_id, reply } => {
                let _ = reply.send(self.status_of(&batch_id));
            }
            ControlRequest::List { reply } => {
                let mut ids: Vec<&String> = self.controllers.keys().collect();
                ids.sort();
                let statuses = ids.into_iter().filter_map(|id| self.status_of(id).ok()).collect();
                let _ = reply.send(Ok(statuses));
            }
        }
    }
}

/// Send `commands` in order and commit the accepted ones. After a failed
/// switch-off, later switch-ons are skipped.
async fn execute(
    surface: &dyn ControlSurface,
    limit: std::time::Duration,
    controller: &mut TemperatureController,
    commands: &[Command],
    temp_c: Option<f64>,
    now: DateTime<Utc>,
) -> Vec<ControlEvent> {
    let mut events = Vec::new();
    let mut off_failed = false;
    for command in commands {
        if command.state.is_on() && off_failed {
            tracing::warn!(
                batch_id = %controller.batch_id(),
                entity = %command.entity,
                "Skipping switch-on after a failed switch-off"
            );
            continue;
        }
        let outcome = match timeout(limit, surface.set_state(&command.entity, command.state)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
        };
        match outcome {
            Ok(()) => events.push(controller.commit(command, now, temp_c)),
            Err(error) => {
                if !command.state.is_on() {
                    off_failed = true;
                }
                events.push(controller.record_failure(command, &error, now));
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::InactiveReason;
    use crate::linker::{BatchDirectory, BatchRecord, BatchStatus};
    use crate::{FusedReading, ReadingCondition};
    use chrono::TimeZone;
    use fermwatch_hal::actuator::MockSurface;
    use fermwatch_hal::{BoxFuture, ManualClock};

    /// Directory the tests can edit between ticks
    #[derive(Default)]
    struct EditableDirectory {
        batches: Mutex<Vec<BatchRecord>>,
    }

    impl EditableDirectory {
        fn edit(&self, f: impl FnOnce(&mut BatchRecord)) {
            let mut batches = self.batches.lock().unwrap();
            f(&mut batches[0]);
        }
    }

    impl BatchDirectory for EditableDirectory {
        fn load(&self) -> BoxFuture<'_, crate::Result<Vec<BatchRecord>>> {
            let batches = self.batches.lock().unwrap().clone();
            Box::pin(async move { Ok(batches) })
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap()
    }

    fn batch() -> BatchRecord {
        BatchRecord {
            id: "ipa-42".into(),
            status: BatchStatus::Fermenting,
            device_id: Some("tilt:red".into()),
            target_temp_c: Some(20.0),
            heater_entity: Some("switch.heater".into()),
            cooler_entity: Some("switch.cooler".into()),
            ..Default::default()
        }
    }

    fn reading(temp: f64, at: DateTime<Utc>) -> FusedReading {
        FusedReading {
            device_id: "tilt:red".into(),
            sg_filtered: 1.030,
            temp_filtered_c: temp,
            confidence: 0.8,
            anomaly: false,
            anomalies: vec![],
            predicted_completion: None,
            observed_at: at,
            condition: ReadingCondition::Nominal,
        }
    }

    struct Rig {
        clock: Arc<ManualClock>,
        store: Arc<ReadingStore>,
        surface: MockSurface,
        directory: Arc<EditableDirectory>,
        control: ControlLoop,
        handle: ControlHandle,
    }

    impl Rig {
        /// Advance the clock, publish a reading and run one tick.
        async fn tick_at(&mut self, after: Duration, temp: f64) {
            self.clock.advance(after);
            self.store.put_reading(reading(temp, self.clock.now()));
            self.control.tick().await;
        }

        /// Heater on after the startup floor, with the call log cleared.
        async fn heating(&mut self) {
            self.control.tick().await;
            self.tick_at(Duration::minutes(6), 18.0).await;
            assert!(self.control.controller("ipa-42").unwrap().state().heater_on);
            self.surface.clear();
        }
    }

    /// Replay switch calls and check heater and cooler never ran together.
    fn assert_exclusive(calls: &[(String, SwitchState)]) {
        let (mut heater, mut cooler) = (false, false);
        for (entity, state) in calls {
            match entity.as_str() {
                "switch.heater" => heater = state.is_on(),
                "switch.cooler" => cooler = state.is_on(),
                _ => {}
            }
            assert!(!(heater && cooler), "both on after {:?}", calls);
        }
    }

    fn rig() -> Rig {
        let clock = Arc::new(ManualClock::new(start()));
        let directory = Arc::new(EditableDirectory::default());
        directory.batches.lock().unwrap().push(batch());
        let linker = Arc::new(BatchLinker::new(directory.clone(), clock.clone(), Duration::minutes(1)));
        let store = Arc::new(ReadingStore::new());
        let surface = MockSurface::new();
        let (control, handle) = ControlLoop::new(
            ControllerConfig::default(),
            linker,
            store.clone(),
            Arc::new(surface.clone()),
            clock.clone(),
        );
        Rig { clock, store, surface, directory, control, handle }
    }

    #[tokio::test]
    async fn first_tick_activates_and_waits_out_the_floor() {
        let mut rig = rig();
        rig.store.put_reading(reading(18.0, start()));
        rig.control.tick().await;
        // only the startup switch-off
        assert_eq!(
            rig.surface.calls(),
            vec![
                ("switch.heater".to_string(), SwitchState::Off),
                ("switch.cooler".to_string(), SwitchState::Off),
            ]
        );
        assert!(rig.control.controller("ipa-42").is_some());
        rig.surface.clear();

        rig.clock.advance(Duration::minutes(6));
        rig.store.put_reading(reading(18.0, rig.clock.now()));
        rig.control.tick().await;
        assert_eq!(rig.surface.calls(), vec![("switch.heater".to_string(), SwitchState::On)]);
        assert!(rig.control.controller("ipa-42").unwrap().state().heater_on);
    }

    #[tokio::test]
    async fn failed_command_leaves_state_for_retry() {
        let mut rig = rig();
        rig.control.tick().await;
        rig.clock.advance(Duration::minutes(6));
        rig.store.put_reading(reading(18.0, rig.clock.now()));
        rig.surface.fail_entity("switch.heater");
        rig.control.tick().await;
        assert!(!rig.control.controller("ipa-42").unwrap().state().heater_on);

        rig.surface.heal_entity("switch.heater");
        rig.clock.advance(Duration::seconds(30));
        rig.store.put_reading(reading(18.0, rig.clock.now()));
        rig.control.tick().await;
        assert!(rig.control.controller("ipa-42").unwrap().state().heater_on);
    }

    #[tokio::test]
    async fn failed_switch_off_blocks_switch_on() {
        let mut rig = rig();
        rig.control.tick().await;
        rig.clock.advance(Duration::minutes(6));
        rig.store.put_reading(reading(18.0, rig.clock.now()));
        rig.control.tick().await;
        rig.surface.clear();

        rig.clock.advance(Duration::minutes(6));
        rig.store.put_reading(reading(22.0, rig.clock.now()));
        rig.surface.fail_entity("switch.heater");
        rig.control.tick().await;

        // the heater off failed and the cooler was never asked
        assert!(rig.surface.calls().is_empty());
        let state = rig.control.controller("ipa-42").unwrap().state().clone();
        assert!(state.heater_on);
        assert!(!state.cooler_on);
    }

    #[tokio::test]
    async fn overrides_go_through_the_request_channel() {
        let rig = rig();
        let Rig { clock, store, surface, directory, mut control, handle } = rig;
        control.tick().await;
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(control.run(shutdown));

        let status = handle
            .set_override("ipa-42", DeviceRole::Cooler, SwitchState::On, Duration::minutes(30))
            .await
            .unwrap();
        assert!(status.state.cooler_override.is_some());

        let err = handle
            .set_override("ipa-42", DeviceRole::Heater, SwitchState::On, Duration::minutes(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::OverrideConflict { .. }));

        assert!(matches!(
            handle.status("nope").await,
            Err(ControlError::UnknownBatch(_))
        ));

        let status = handle.clear_override("ipa-42", None).await.unwrap();
        assert!(status.state.cooler_override.is_none());
        assert_eq!(handle.list().await.unwrap().len(), 1);

        let _ = (clock, store, surface, directory);
        stop.send(true).unwrap();
        task.await.unwrap();
        assert!(matches!(handle.status("ipa-42").await, Err(ControlError::LoopStopped)));
    }

    #[tokio::test]
    async fn completed_batch_switches_off_and_drops_its_controller() {
        let mut rig = rig();
        rig.heating().await;

        rig.directory.edit(|b| b.status = BatchStatus::Completed);
        rig.tick_at(Duration::minutes(1), 18.0).await;
        // still inside the heater's floor
        assert!(rig.surface.calls().is_empty());
        assert!(rig.control.controller("ipa-42").unwrap().is_releasing());

        rig.tick_at(Duration::minutes(5), 18.0).await;
        assert_eq!(rig.surface.calls(), vec![("switch.heater".to_string(), SwitchState::Off)]);
        assert!(rig.control.controller("ipa-42").is_none());
    }

    #[tokio::test]
    async fn reactivated_batch_never_runs_both_actuators() {
        let mut rig = rig();
        rig.heating().await;

        // completed and back before the heater could be released
        rig.directory.edit(|b| b.status = BatchStatus::Completed);
        rig.tick_at(Duration::minutes(1), 18.0).await;
        rig.directory.edit(|b| b.status = BatchStatus::Fermenting);
        rig.tick_at(Duration::minutes(1), 22.0).await;
        assert!(!rig.control.controller("ipa-42").unwrap().is_releasing());

        for _ in 0..10 {
            rig.tick_at(Duration::minutes(1), 22.0).await;
        }
        let calls = rig.surface.calls();
        assert_exclusive(&calls);
        assert_eq!(
            calls,
            vec![
                ("switch.heater".to_string(), SwitchState::Off),
                ("switch.cooler".to_string(), SwitchState::On),
            ]
        );
    }

    #[tokio::test]
    async fn batch_back_after_its_controller_was_dropped_starts_from_off() {
        let mut rig = rig();
        rig.heating().await;

        rig.directory.edit(|b| b.status = BatchStatus::Completed);
        rig.tick_at(Duration::minutes(6), 18.0).await;
        assert!(rig.control.controller("ipa-42").is_none());

        rig.directory.edit(|b| b.status = BatchStatus::Fermenting);
        for _ in 0..8 {
            rig.tick_at(Duration::minutes(1), 22.0).await;
        }
        let calls = rig.surface.calls();
        assert_exclusive(&calls);
        assert_eq!(calls.last(), Some(&("switch.cooler".to_string(), SwitchState::On)));
    }

    #[tokio::test]
    async fn losing_the_target_switches_the_heater_off() {
        let mut rig = rig();
        rig.heating().await;

        rig.directory.edit(|b| b.target_temp_c = None);
        for _ in 0..10 {
            rig.tick_at(Duration::minutes(1), 30.0).await;
        }
        assert_eq!(rig.surface.calls(), vec![("switch.heater".to_string(), SwitchState::Off)]);
        let controller = rig.control.controller("ipa-42").unwrap();
        assert!(!controller.state().heater_on);
        assert_eq!(controller.condition(), &ControlCondition::Inactive(InactiveReason::NoTarget));
    }
}
