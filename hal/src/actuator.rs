//! Control surfaces: where heater and cooler commands end up.

use crate::{BoxFuture, HalError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Desired switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn is_on(&self) -> bool {
        matches!(self, SwitchState::On)
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on { SwitchState::On } else { SwitchState::Off }
    }
}

impl std::fmt::Display for SwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_on() { "on" } else { "off" })
    }
}

/// A home-automation API that can flip switches.
///
/// Calls are best effort and at most once; the caller decides whether to
/// try again later.
pub trait ControlSurface: Send + Sync {
    fn set_state(&self, entity: &str, state: SwitchState) -> BoxFuture<'_, Result<(), HalError>>;
}

/// Home Assistant REST API
pub struct HomeAssistantSurface {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HomeAssistantSurface {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, HalError> {
        if base_url.trim().is_empty() {
            return Err(HalError::InvalidConfig("Home Assistant URL is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fermwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// `switch.fermenter_heater` -> `{base}/api/services/switch/turn_on`
    pub fn service_url(&self, entity: &str, state: SwitchState) -> Result<String, HalError> {
        let domain = entity
            .split_once('.')
            .map(|(domain, _)| domain)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| HalError::InvalidConfig(format!("entity id without domain: {}", entity)))?;
        let service = if state.is_on() { "turn_on" } else { "turn_off" };
        Ok(format!("{}/api/services/{}/{}", self.base_url, domain, service))
    }
}

impl ControlSurface for HomeAssistantSurface {
    fn set_state(&self, entity: &str, state: SwitchState) -> BoxFuture<'_, Result<(), HalError>> {
        let entity = entity.to_string();
        Box::pin(async move {
            let url = self.service_url(&entity, state)?;
            self.client
                .post(&url)
                .bearer_auth(&self.token)
                .json(&serde_json::json!({ "entity_id": entity }))
                .send()
                .await?
                .error_for_status()?;
            tracing::debug!(%entity, %state, "Home Assistant call succeeded");
            Ok(())
        })
    }
}

/// Logs commands instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunSurface;

impl ControlSurface for DryRunSurface {
    fn set_state(&self, entity: &str, state: SwitchState) -> BoxFuture<'_, Result<(), HalError>> {
        tracing::info!(%entity, %state, "[dry run] actuator command");
        Box::pin(async { Ok(()) })
    }
}

/// In-memory surface for tests and simulations.
///
/// Records every call; entities listed in `failing` answer with an error.
#[derive(Debug, Default, Clone)]
pub struct MockSurface {
    calls: Arc<Mutex<Vec<(String, SwitchState)>>>,
    failing: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl MockSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_entity(&self, entity: &str) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).push(entity.to_string());
    }

    pub fn heal_entity(&self, entity: &str) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).retain(|e| e != entity);
    }

    pub fn calls(&self) -> Vec<(String, SwitchState)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl ControlSurface for MockSurface {
    fn set_state(&self, entity: &str, state: SwitchState) -> BoxFuture<'_, Result<(), HalError>> {
        let entity = entity.to_string();
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failing = self
                .failing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .any(|e| *e == entity);
            if failing {
                return Err(HalError::CommunicationError(format!("{} unreachable", entity)));
            }
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).push((entity, state));
            Ok(())
        })
    }
}
