//! Hysteresis temperature controller
//!
//! One controller per active batch. Each tick the controller is asked for a
//! [`Decision`] by the pure [`TemperatureController::evaluate`]; the control
//! loop executes the commands and calls [`TemperatureController::commit`] for
//! every one that the actuator accepted. State therefore only reflects
//! switches that actually happened, and a failed command is retried on the
//! next tick.
//!
//! Safety rules enforced in `evaluate`:
//!
//! - heater and cooler are never on together; off commands come first and
//!   at most one on command is issued per tick
//! - an actuator is not switched again within `min_cycle_secs` of its last
//!   change (controller creation counts as a change)
//! - without a fresh, trusted reading the actuators hold their state
//! - a new controller does not know what the hardware is doing, so it
//!   switches every configured actuator off before anything may turn on
//! - a controller that stops controlling (batch inactive or gone) switches
//!   off what it left on, once the cycle floor allows

use crate::linker::BatchRecord;
use crate::FusedReading;
use chrono::{DateTime, Duration, Utc};
use fermwatch_hal::actuator::SwitchState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Controller tuning shared by all batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Evaluation period (seconds)
    pub tick_secs: u64,
    /// Half-width of the deadband around the target (°C)
    pub hysteresis_c: f64,
    /// Minimum time between two switches of one actuator (seconds)
    pub min_cycle_secs: u64,
    /// Readings older than this are not acted on (seconds)
    pub stale_after_secs: u64,
    /// Readings at or below this confidence are not acted on
    pub min_confidence: f64,
    /// Upper bound for one actuator call (seconds)
    pub actuator_timeout_secs: u64,
    /// Longest manual override accepted (minutes)
    pub max_override_minutes: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            hysteresis_c: 0.5,
            min_cycle_secs: 300,
            stale_after_secs: 900,
            min_confidence: 0.0,
            actuator_timeout_secs: 10,
            max_override_minutes: 24 * 60,
        }
    }
}

impl ControllerConfig {
    pub fn min_cycle(&self) -> Duration {
        Duration::seconds(self.min_cycle_secs as i64)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Which actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Heater,
    Cooler,
}

impl DeviceRole {
    pub const ALL: [DeviceRole; 2] = [DeviceRole::Heater, DeviceRole::Cooler];

    pub fn other(self) -> DeviceRole {
        match self {
            DeviceRole::Heater => DeviceRole::Cooler,
            DeviceRole::Cooler => DeviceRole::Heater,
        }
    }

    fn index(self) -> usize {
        match self {
            DeviceRole::Heater => 0,
            DeviceRole::Cooler => 1,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Heater => write!(f, "heater"),
            DeviceRole::Cooler => write!(f, "cooler"),
        }
    }
}

impl std::str::FromStr for DeviceRole {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heater" => Ok(DeviceRole::Heater),
            "cooler" => Ok(DeviceRole::Cooler),
            other => Err(ControlError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Heating,
    Cooling,
    Idle,
}

/// Manual override of one actuator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub device: DeviceRole,
    pub state: SwitchState,
    pub expires_at: DateTime<Utc>,
}

/// Why a batch's controller does nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    NoDevice,
    NoTarget,
    InvalidTarget,
    NoActuators,
}

impl fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InactiveReason::NoDevice => "no hydrometer linked",
            InactiveReason::NoTarget => "no target temperature",
            InactiveReason::InvalidTarget => "target temperature is not a number",
            InactiveReason::NoActuators => "no heater or cooler configured",
        };
        f.write_str(text)
    }
}

/// Health of the control input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", content = "reason", rename_all = "snake_case")]
pub enum ControlCondition {
    Ok,
    NoReading,
    Stale,
    Unreliable,
    Inactive(InactiveReason),
}

/// Per-batch control parameters resolved from the batch record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    pub target_c: f64,
    pub half_width: f64,
    pub heater_entity: Option<String>,
    pub cooler_entity: Option<String>,
}

impl ControlSettings {
    pub fn from_batch(batch: &BatchRecord, config: &ControllerConfig) -> Result<Self, InactiveReason> {
        if batch.device_id.is_none() {
            return Err(InactiveReason::NoDevice);
        }
        let target_c = batch.target_temp_c.ok_or(InactiveReason::NoTarget)?;
        let half_width = batch.hysteresis_c.unwrap_or(config.hysteresis_c);
        if !target_c.is_finite() || !half_width.is_finite() || half_width < 0.0 {
            return Err(InactiveReason::InvalidTarget);
        }
        if batch.heater_entity.is_none() && batch.cooler_entity.is_none() {
            return Err(InactiveReason::NoActuators);
        }
        Ok(Self {
            target_c,
            half_width,
            heater_entity: batch.heater_entity.clone(),
            cooler_entity: batch.cooler_entity.clone(),
        })
    }

    pub fn entity(&self, role: DeviceRole) -> Option<&str> {
        match role {
            DeviceRole::Heater => self.heater_entity.as_deref(),
            DeviceRole::Cooler => self.cooler_entity.as_deref(),
        }
    }
}

/// Committed actuator state of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    pub mode: Mode,
    pub heater_on: bool,
    pub cooler_on: bool,
    pub last_transition_at: DateTime<Utc>,
    pub heater_changed_at: DateTime<Utc>,
    pub cooler_changed_at: DateTime<Utc>,
    pub heater_override: Option<Override>,
    pub cooler_override: Option<Override>,
}

impl ControlState {
    /// Everything off; creation counts as a transition.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            mode: Mode::Idle,
            heater_on: false,
            cooler_on: false,
            last_transition_at: now,
            heater_changed_at: now,
            cooler_changed_at: now,
            heater_override: None,
            cooler_override: None,
        }
    }

    pub fn is_on(&self, role: DeviceRole) -> bool {
        match role {
            DeviceRole::Heater => self.heater_on,
            DeviceRole::Cooler => self.cooler_on,
        }
    }

    pub fn changed_at(&self, role: DeviceRole) -> DateTime<Utc> {
        match role {
            DeviceRole::Heater => self.heater_changed_at,
            DeviceRole::Cooler => self.cooler_changed_at,
        }
    }

    pub fn override_for(&self, role: DeviceRole) -> Option<&Override> {
        match role {
            DeviceRole::Heater => self.heater_override.as_ref(),
            DeviceRole::Cooler => self.cooler_override.as_ref(),
        }
    }

    /// Override still in force at `now`
    pub fn active_override(&self, role: DeviceRole, now: DateTime<Utc>) -> Option<&Override> {
        self.override_for(role).filter(|o| o.expires_at > now)
    }

    fn override_slot(&mut self, role: DeviceRole) -> &mut Option<Override> {
        match role {
            DeviceRole::Heater => &mut self.heater_override,
            DeviceRole::Cooler => &mut self.cooler_override,
        }
    }

    fn apply(&mut self, role: DeviceRole, on: bool, now: DateTime<Utc>) {
        match role {
            DeviceRole::Heater => {
                self.heater_on = on;
                self.heater_changed_at = now;
            }
            DeviceRole::Cooler => {
                self.cooler_on = on;
                self.cooler_changed_at = now;
            }
        }
        self.last_transition_at = now;
        self.mode = if self.heater_on {
            Mode::Heating
        } else if self.cooler_on {
            Mode::Cooling
        } else {
            Mode::Idle
        };
    }
}

/// Why a command was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandReason {
    Hysteresis,
    Override,
    /// Forced off because the other actuator is switching on
    Exclusion,
    /// Establishing a known state after the controller was created
    Reconcile,
    /// Switched off because the batch is no longer controlled
    Release,
}

/// One actuator call the control loop should make
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub role: DeviceRole,
    pub entity: String,
    pub state: SwitchState,
    pub reason: CommandReason,
}

/// Output of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Off commands first, at most one on command
    pub commands: Vec<Command>,
    /// Wanted to switch but held back (cycle floor or exclusion)
    pub deferred: Vec<DeviceRole>,
    /// Overrides that ran out and should be cleared
    pub expired: Vec<DeviceRole>,
    pub condition: ControlCondition,
}

/// Something that happened to a batch's controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub batch_id: String,
    pub at: DateTime<Utc>,
    pub kind: ControlEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEventKind {
    Activated,
    Deactivated,
    Switched {
        role: DeviceRole,
        entity: String,
        state: SwitchState,
        reason: CommandReason,
        temp_c: Option<f64>,
    },
    ActuatorFailed {
        role: DeviceRole,
        entity: String,
        state: SwitchState,
        error: String,
    },
    OverrideSet {
        role: DeviceRole,
        state: SwitchState,
        expires_at: DateTime<Utc>,
    },
    OverrideCleared {
        role: DeviceRole,
    },
    OverrideExpired {
        role: DeviceRole,
    },
    ConditionChanged {
        condition: ControlCondition,
    },
}

/// Snapshot served by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub batch_id: String,
    pub state: ControlState,
    pub condition: ControlCondition,
    pub settings: Option<ControlSettings>,
    pub last_temp_c: Option<f64>,
}

/// Control errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("No active controller for batch {0}")]
    UnknownBatch(String),

    #[error("Batch {batch_id} is inactive: {reason}")]
    Inactive { batch_id: String, reason: InactiveReason },

    #[error("No {0} configured for this batch")]
    NoEntity(DeviceRole),

    #[error("Cannot force {requested} on while the {other} is overridden on")]
    OverrideConflict { requested: DeviceRole, other: DeviceRole },

    #[error("Override duration must be between 1 and {max} minutes")]
    InvalidDuration { max: u64 },

    #[error("Unknown actuator role: {0}")]
    UnknownRole(String),

    #[error("Control loop is not running")]
    LoopStopped,
}

/// Hysteresis state machine for one batch
#[derive(Debug, Clone)]
pub struct TemperatureController {
    batch_id: String,
    config: ControllerConfig,
    state: ControlState,
    condition: ControlCondition,
    last_temp_c: Option<f64>,
    /// Roles whose physical state has not been confirmed by a command yet
    unconfirmed: [bool; 2],
    /// Entity each role was last switched through
    entities: [Option<String>; 2],
    releasing: bool,
}

impl TemperatureController {
    pub fn new(batch_id: &str, config: ControllerConfig, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            config,
            state: ControlState::new(now),
            condition: ControlCondition::NoReading,
            last_temp_c: None,
            unconfirmed: [true; 2],
            entities: [None, None],
            releasing: false,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn condition(&self) -> &ControlCondition {
        &self.condition
    }

    /// Both actuators are known to be off.
    pub fn is_idle(&self) -> bool {
        !self.state.heater_on && !self.state.cooler_on
    }

    pub fn is_releasing(&self) -> bool {
        self.releasing
    }

    fn entity_for<'a>(&'a self, settings: &'a ControlSettings, role: DeviceRole) -> Option<&'a str> {
        self.entities[role.index()].as_deref().or(settings.entity(role))
    }

    fn assess(&self, reading: Option<&FusedReading>, now: DateTime<Utc>) -> ControlCondition {
        let Some(reading) = reading else {
            return ControlCondition::NoReading;
        };
        if reading.confidence <= self.config.min_confidence || !reading.temp_filtered_c.is_finite() {
            ControlCondition::Unreliable
        } else if now - reading.observed_at > self.config.stale_after() {
            ControlCondition::Stale
        } else {
            ControlCondition::Ok
        }
    }

    fn floor_passed(&self, role: DeviceRole, now: DateTime<Utc>) -> bool {
        now - self.state.changed_at(role) >= self.config.min_cycle()
    }

    /// Decide what to switch at `now`. Does not change any state.
    pub fn evaluate(&self, settings: &ControlSettings, reading: Option<&FusedReading>, now: DateTime<Utc>) -> Decision {
        let state = &self.state;
        let expired: Vec<DeviceRole> = DeviceRole::ALL
            .into_iter()
            .filter(|role| state.override_for(*role).is_some_and(|o| o.expires_at <= now))
            .collect();
        let condition = self.assess(reading, now);

        let reconcile: Vec<Command> = DeviceRole::ALL
            .into_iter()
            .filter(|role| self.unconfirmed[role.index()])
            .filter_map(|role| {
                settings.entity(role).map(|entity| Command {
                    role,
                    entity: entity.to_string(),
                    state: SwitchState::Off,
                    reason: CommandReason::Reconcile,
                })
            })
            .collect();
        if !reconcile.is_empty() {
            return Decision { commands: reconcile, deferred: Vec::new(), expired, condition };
        }

        let mut want = [state.heater_on, state.cooler_on];
        let mut reason = [CommandReason::Hysteresis; 2];

        if let (ControlCondition::Ok, Some(reading)) = (&condition, reading) {
            let temp = reading.temp_filtered_c;
            if temp <= settings.target_c - settings.half_width {
                want = [true, false];
            } else if temp >= settings.target_c + settings.half_width {
                want = [false, true];
            }
        }

        for role in DeviceRole::ALL {
            if let Some(o) = state.active_override(role, now) {
                want[role.index()] = o.state.is_on();
                reason[role.index()] = CommandReason::Override;
            }
            if settings.entity(role).is_none() {
                want[role.index()] = false;
            }
        }

        if want[0] && want[1] {
            let overridden_on =
                |role: DeviceRole| state.active_override(role, now).is_some_and(|o| o.state.is_on());
            let keep = if overridden_on(DeviceRole::Heater) {
                DeviceRole::Heater
            } else if overridden_on(DeviceRole::Cooler) {
                DeviceRole::Cooler
            } else if state.cooler_on {
                DeviceRole::Cooler
            } else {
                DeviceRole::Heater
            };
            want[keep.other().index()] = false;
            reason[keep.other().index()] = CommandReason::Exclusion;
        }

        let mut commands = Vec::new();
        let mut deferred = Vec::new();
        let mut on_after = [state.heater_on, state.cooler_on];

        for role in DeviceRole::ALL {
            let i = role.index();
            if !(state.is_on(role) && !want[i]) {
                continue;
            }
            match self.entity_for(settings, role) {
                Some(entity) if self.floor_passed(role, now) => {
                    commands.push(Command {
                        role,
                        entity: entity.to_string(),
                        state: SwitchState::Off,
                        reason: reason[i],
                    });
                    on_after[i] = false;
                }
                _ => deferred.push(role),
            }
        }

        for role in DeviceRole::ALL {
            let i = role.index();
            if !(want[i] && !state.is_on(role)) {
                continue;
            }
            match settings.entity(role) {
                Some(entity) if self.floor_passed(role, now) && !on_after[role.other().index()] => {
                    commands.push(Command {
                        role,
                        entity: entity.to_string(),
                        state: SwitchState::On,
                        reason: reason[i],
                    });
                    on_after[i] = true;
                }
                _ => deferred.push(role),
            }
        }

        Decision { commands, deferred, expired, condition }
    }

    /// Off commands for every actuator still on, for a batch that is no
    /// longer controlled. Roles inside their cycle floor are deferred.
    pub fn release(&self, now: DateTime<Utc>) -> Decision {
        let mut commands = Vec::new();
        let mut deferred = Vec::new();
        for role in DeviceRole::ALL {
            if !self.state.is_on(role) {
                continue;
            }
            match self.entities[role.index()].as_deref() {
                Some(entity) if self.floor_passed(role, now) => commands.push(Command {
                    role,
                    entity: entity.to_string(),
                    state: SwitchState::Off,
                    reason: CommandReason::Release,
                }),
                _ => deferred.push(role),
            }
        }
        Decision {
            commands,
            deferred,
            expired: Vec::new(),
            condition: self.condition.clone(),
        }
    }

    /// Stop controlling; overrides are dropped. Returns an event the first time.
    pub fn deactivate(&mut self, now: DateTime<Utc>) -> Option<ControlEvent> {
        if self.releasing {
            return None;
        }
        self.releasing = true;
        self.state.heater_override = None;
        self.state.cooler_override = None;
        tracing::info!(batch_id = %self.batch_id, "Batch no longer active, releasing actuators");
        Some(self.event(now, ControlEventKind::Deactivated))
    }

    /// Resume control of a batch that came back before its controller was dropped.
    pub fn reactivate(&mut self, now: DateTime<Utc>) -> Option<ControlEvent> {
        if !self.releasing {
            return None;
        }
        self.releasing = false;
        tracing::info!(batch_id = %self.batch_id, "Controller reactivated");
        Some(self.event(now, ControlEventKind::Activated))
    }

    /// Record a command the actuator accepted.
    pub fn commit(&mut self, command: &Command, now: DateTime<Utc>, temp_c: Option<f64>) -> ControlEvent {
        let i = command.role.index();
        self.unconfirmed[i] = false;
        self.entities[i] = Some(command.entity.clone());
        self.state.apply(command.role, command.state.is_on(), now);
        tracing::info!(
            batch_id = %self.batch_id,
            entity = %command.entity,
            role = %command.role,
            state = %command.state,
            reason = ?command.reason,
            "Actuator switched"
        );
        self.event(
            now,
            ControlEventKind::Switched {
                role: command.role,
                entity: command.entity.clone(),
                state: command.state,
                reason: command.reason,
                temp_c,
            },
        )
    }

    /// Record a command the actuator rejected; state is unchanged.
    pub fn record_failure(&mut self, command: &Command, error: &str, now: DateTime<Utc>) -> ControlEvent {
        tracing::warn!(
            batch_id = %self.batch_id,
            entity = %command.entity,
            state = %command.state,
            error,
            "Actuator command failed"
        );
        self.event(
            now,
            ControlEventKind::ActuatorFailed {
                role: command.role,
                entity: command.entity.clone(),
                state: command.state,
                error: error.to_string(),
            },
        )
    }

    /// Remember the latest input temperature for status reports.
    pub fn observe_reading(&mut self, reading: Option<&FusedReading>) {
        if let Some(reading) = reading {
            self.last_temp_c = Some(reading.temp_filtered_c);
        }
    }

    /// Track the input condition; returns an event when it changed.
    pub fn observe_condition(&mut self, condition: ControlCondition, now: DateTime<Utc>) -> Option<ControlEvent> {
        if condition == self.condition {
            return None;
        }
        tracing::info!(batch_id = %self.batch_id, ?condition, "Control condition changed");
        self.condition = condition.clone();
        Some(self.event(now, ControlEventKind::ConditionChanged { condition }))
    }

    pub fn expire_overrides(&mut self, roles: &[DeviceRole], now: DateTime<Utc>) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        for role in roles {
            if self.state.override_slot(*role).take().is_some() {
                tracing::info!(batch_id = %self.batch_id, role = %role, "Override expired");
                events.push(self.event(now, ControlEventKind::OverrideExpired { role: *role }));
            }
        }
        events
    }

    /// Force `role` to `state` for `duration`.
    pub fn set_override(
        &mut self,
        settings: &ControlSettings,
        role: DeviceRole,
        state: SwitchState,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<ControlEvent, ControlError> {
        let max = self.config.max_override_minutes;
        if duration <= Duration::zero() || duration > Duration::minutes(max as i64) {
            return Err(ControlError::InvalidDuration { max });
        }
        if settings.entity(role).is_none() {
            return Err(ControlError::NoEntity(role));
        }
        let other = role.other();
        if state.is_on() && self.state.active_override(other, now).is_some_and(|o| o.state.is_on()) {
            return Err(ControlError::OverrideConflict { requested: role, other });
        }

        let expires_at = now + duration;
        *self.state.override_slot(role) = Some(Override { device: role, state, expires_at });
        tracing::info!(batch_id = %self.batch_id, role = %role, %state, %expires_at, "Override set");
        Ok(self.event(now, ControlEventKind::OverrideSet { role, state, expires_at }))
    }

    pub fn clear_override(&mut self, role: DeviceRole, now: DateTime<Utc>) -> Option<ControlEvent> {
        self.state.override_slot(role).take()?;
        tracing::info!(batch_id = %self.batch_id, role = %role, "Override cleared");
        Some(self.event(now, ControlEventKind::OverrideCleared { role }))
    }

    pub fn status(&self, settings: Option<ControlSettings>) -> ControllerStatus {
        ControllerStatus {
            batch_id: self.batch_id.clone(),
            state: self.state.clone(),
            condition: self.condition.clone(),
            settings,
            last_temp_c: self.last_temp_c,
        }
    }

    pub(crate) fn event(&self, at: DateTime<Utc>, kind: ControlEventKind) -> ControlEvent {
        ControlEvent {
            batch_id: self.batch_id.clone(),
            at,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReadingCondition;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 18, 0, 0).unwrap()
    }

    fn settings(heater: bool, cooler: bool) -> ControlSettings {
        ControlSettings {
            target_c: 20.0,
            half_width: 0.5,
            heater_entity: heater.then(|| "switch.heater".to_string()),
            cooler_entity: cooler.then(|| "switch.cooler".to_string()),
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

    /// New controller whose startup switch-off went through.
    fn controller(created: DateTime<Utc>) -> TemperatureController {
        let mut c = TemperatureController::new("b1", ControllerConfig::default(), created);
        for cmd in c.evaluate(&settings(true, true), None, created).commands {
            c.commit(&cmd, created, None);
        }
        c
    }

    /// Evaluate and commit everything, as if every actuator call succeeded.
    fn step(c: &mut TemperatureController, s: &ControlSettings, temp: f64, at: DateTime<Utc>) -> Vec<Command> {
        let r = reading(temp, at);
        let decision = c.evaluate(s, Some(&r), at);
        for cmd in &decision.commands {
            c.commit(cmd, at, Some(temp));
        }
        decision.commands
    }

    #[test]
    fn creation_counts_as_a_transition() {
        let s = settings(true, false);
        let mut c = controller(t0());
        let cmds = step(&mut c, &s, 19.3, t0() + Duration::minutes(1));
        assert!(cmds.is_empty());
        let cmds = step(&mut c, &s, 19.0, t0() + Duration::minutes(6));
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].state, SwitchState::On);
    }

    #[test]
    fn new_controller_switches_everything_off_first() {
        let s = settings(true, true);
        let mut c = TemperatureController::new("b1", ControllerConfig::default(), t0() - Duration::hours(1));
        let decision = c.evaluate(&s, Some(&reading(15.0, t0())), t0());
        let cmds: Vec<_> = decision.commands.iter().map(|c| (c.role, c.state, c.reason)).collect();
        assert_eq!(
            cmds,
            vec![
                (DeviceRole::Heater, SwitchState::Off, CommandReason::Reconcile),
                (DeviceRole::Cooler, SwitchState::Off, CommandReason::Reconcile),
            ]
        );

        // the cooler is still unknown, so nothing may turn on yet
        c.commit(&decision.commands[0], t0(), None);
        let decision = c.evaluate(&s, Some(&reading(15.0, t0())), t0());
        assert_eq!(decision.commands.len(), 1);
        assert_eq!(decision.commands[0].role, DeviceRole::Cooler);
        assert_eq!(decision.commands[0].reason, CommandReason::Reconcile);

        c.commit(&decision.commands[0], t0(), None);
        let later = t0() + Duration::minutes(6);
        let decision = c.evaluate(&s, Some(&reading(15.0, later)), later);
        assert_eq!(decision.commands.len(), 1);
        assert_eq!(decision.commands[0].state, SwitchState::On);
        assert_eq!(decision.commands[0].reason, CommandReason::Hysteresis);
    }

    #[test]
    fn release_switches_off_after_the_floor() {
        let s = settings(true, true);
        let mut c = controller(t0() - Duration::hours(1));
        step(&mut c, &s, 19.0, t0());
        assert!(c.state().heater_on);

        assert!(c.deactivate(t0()).is_some());
        assert!(c.deactivate(t0()).is_none());

        let soon = t0() + Duration::minutes(1);
        let decision = c.release(soon);
        assert!(decision.commands.is_empty());
        assert_eq!(decision.deferred, vec![DeviceRole::Heater]);

        let later = t0() + Duration::minutes(5);
        let decision = c.release(later);
        assert_eq!(decision.commands.len(), 1);
        assert_eq!(decision.commands[0].entity, "switch.heater");
        assert_eq!(decision.commands[0].state, SwitchState::Off);
        assert_eq!(decision.commands[0].reason, CommandReason::Release);
        c.commit(&decision.commands[0], later, None);
        assert!(c.is_idle());
    }

    #[test]
    fn removed_entity_is_still_switched_off() {
        let mut c = controller(t0() - Duration::hours(1));
        step(&mut c, &settings(true, true), 19.0, t0());

        let later = t0() + Duration::minutes(10);
        let decision = c.evaluate(&settings(false, true), Some(&reading(19.0, later)), later);
        assert_eq!(decision.commands.len(), 1);
        assert_eq!(decision.commands[0].entity, "switch.heater");
        assert_eq!(decision.commands[0].state, SwitchState::Off);
    }

    #[test]
    fn deadband_holds() {
        let s = settings(true, true);
        let mut c = controller(t0() - Duration::hours(1));
        for temp in [19.6, 20.0, 20.4] {
            assert!(step(&mut c, &s, temp, t0()).is_empty());
        }
        assert_eq!(c.state().mode, Mode::Idle);
    }

    #[test]
    fn switching_sides_turns_the_other_off_first() {
        let s = settings(true, true);
        let mut c = controller(t0() - Duration::hours(1));
        step(&mut c, &s, 19.0, t0());
        assert!(c.state().heater_on);

        let later = t0() + Duration::minutes(10);
        let decision = c.evaluate(&s, Some(&reading(20.8, later)), later);
        assert_eq!(decision.commands.len(), 2);
        assert_eq!(decision.commands[0].role, DeviceRole::Heater);
        assert_eq!(decision.commands[0].state, SwitchState::Off);
        assert_eq!(decision.commands[1].role, DeviceRole::Cooler);
        assert_eq!(decision.commands[1].state, SwitchState::On);
    }

    #[test]
    fn cooler_waits_while_heater_is_inside_its_floor() {
        let s = settings(true, true);
        let mut c = controller(t0() - Duration::hours(1));
        step(&mut c, &s, 19.0, t0());

        let soon = t0() + Duration::minutes(2);
        let decision = c.evaluate(&s, Some(&reading(21.0, soon)), soon);
        assert!(decision.commands.is_empty());
        assert_eq!(decision.deferred, vec![DeviceRole::Heater, DeviceRole::Cooler]);
    }

    #[test]
    fn unreliable_and_missing_readings_hold() {
        let s = settings(true, true);
        let c = controller(t0() - Duration::hours(1));

        let mut r = reading(15.0, t0());
        r.confidence = 0.0;
        let decision = c.evaluate(&s, Some(&r), t0());
        assert!(decision.commands.is_empty());
        assert_eq!(decision.condition, ControlCondition::Unreliable);

        let decision = c.evaluate(&s, None, t0());
        assert!(decision.commands.is_empty());
        assert_eq!(decision.condition, ControlCondition::NoReading);
    }

    #[test]
    fn override_forces_and_expires() {
        let s = settings(true, true);
        let mut c = controller(t0() - Duration::hours(1));
        c.set_override(&s, DeviceRole::Cooler, SwitchState::On, Duration::minutes(30), t0())
            .unwrap();

        // in band, but the override wins
        let cmds = step(&mut c, &s, 20.0, t0());
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].reason, CommandReason::Override);
        assert!(c.state().cooler_on);

        // cold now, but the heater may not run against the forced cooler
        let mid = t0() + Duration::minutes(15);
        assert!(step(&mut c, &s, 19.0, mid).is_empty());

        let after = t0() + Duration::minutes(31);
        let decision = c.evaluate(&s, Some(&reading(19.0, after)), after);
        assert_eq!(decision.expired, vec![DeviceRole::Cooler]);
        assert_eq!(decision.commands[0].state, SwitchState::Off);
        assert_eq!(decision.commands[0].role, DeviceRole::Cooler);
        assert_eq!(decision.commands[1].role, DeviceRole::Heater);
        let events = c.expire_overrides(&decision.expired, after);
        assert!(matches!(events[0].kind, ControlEventKind::OverrideExpired { role: DeviceRole::Cooler }));
    }

    #[test]
    fn conflicting_overrides_are_rejected() {
        let s = settings(true, true);
        let mut c = controller(t0());
        c.set_override(&s, DeviceRole::Heater, SwitchState::On, Duration::minutes(10), t0())
            .unwrap();
        let err = c
            .set_override(&s, DeviceRole::Cooler, SwitchState::On, Duration::minutes(10), t0())
            .unwrap_err();
        assert_eq!(
            err,
            ControlError::OverrideConflict { requested: DeviceRole::Cooler, other: DeviceRole::Heater }
        );
        // forcing the cooler off is fine
        assert!(c
            .set_override(&s, DeviceRole::Cooler, SwitchState::Off, Duration::minutes(10), t0())
            .is_ok());
    }

    #[test]
    fn override_needs_an_entity_and_a_sane_duration() {
        let s = settings(true, false);
        let mut c = controller(t0());
        assert_eq!(
            c.set_override(&s, DeviceRole::Cooler, SwitchState::On, Duration::minutes(10), t0()),
            Err(ControlError::NoEntity(DeviceRole::Cooler))
        );
        assert!(matches!(
            c.set_override(&s, DeviceRole::Heater, SwitchState::On, Duration::zero(), t0()),
            Err(ControlError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn condition_events_fire_on_change_only() {
        let mut c = controller(t0());
        assert!(c.observe_condition(ControlCondition::NoReading, t0()).is_none());
        assert!(c.observe_condition(ControlCondition::Ok, t0()).is_some());
        assert!(c.observe_condition(ControlCondition::Ok, t0()).is_none());
    }

    #[test]
    fn settings_resolve_from_batch() {
        let mut batch = BatchRecord {
            id: "b1".into(),
            device_id: Some("tilt:red".into()),
            target_temp_c: Some(19.0),
            heater_entity: Some("switch.heat".into()),
            ..Default::default()
        };
        let config = ControllerConfig::default();
        let s = ControlSettings::from_batch(&batch, &config).unwrap();
        assert_eq!(s.half_width, 0.5);
        assert_eq!(s.entity(DeviceRole::Cooler), None);

        batch.heater_entity = None;
        assert_eq!(ControlSettings::from_batch(&batch, &config), Err(InactiveReason::NoActuators));
        batch.target_temp_c = None;
        assert_eq!(ControlSettings::from_batch(&batch, &config), Err(InactiveReason::NoTarget));
    }
}
