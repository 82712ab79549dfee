//! Credential manager and the self-check loop.
//!
//! One authoritative credential is held per provider. The manager is the sole
//! mutator; Server and Protocol stages only read. Material swaps are atomic —
//! readers clone an `Arc` snapshot, so a mid-request refresh applies from the
//! next read onward and no half-updated state is ever observable.
//!
//! The state machine per credential is
//! `valid → refreshing → (valid | invalid)`; an invalid credential returns to
//! valid only after operator action (replacing the credential file), which the
//! self-check loop picks up on its next cadence.
//!
//! [`CredentialManager::refresh_auth`] never blocks the caller: it flips the
//! state and defers the actual refresh to a spawned task.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{CredentialSpec, Provider};
use crate::error::PipelineError;
use crate::pipeline::{PipelineEvent, PipelineManager};

/// Refresh credentials this many seconds before their recorded expiry.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Cadence of the self-check loop.
const SELF_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Valid,
    Refreshing,
    Invalid,
}

/// Immutable snapshot of credential material. Swapped wholesale on refresh.
#[derive(Debug, Clone)]
pub struct CredentialMaterial {
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum CredentialEvent {
    Refreshed { credential_ref: String },
    Invalidated {
        credential_ref: String,
        provider: String,
        oauth_url: Option<String>,
    },
}

enum SlotSource {
    /// Re-readable credential file in the credentials directory.
    File(PathBuf),
    /// Key given inline in the config — nothing to re-read.
    Inline,
}

struct CredentialSlot {
    provider: String,
    source: SlotSource,
    material: RwLock<Arc<CredentialMaterial>>,
    state: RwLock<CredentialState>,
    oauth_url: Option<String>,
}

pub struct CredentialManager {
    slots: DashMap<String, CredentialSlot>,
    events: broadcast::Sender<CredentialEvent>,
    probe_client: reqwest::Client,
}

impl CredentialManager {
    /// Seed one slot per provider from the routing table. Reference slots read
    /// their file now; a file the config compiler saw but that no longer
    /// parses is a startup error.
    pub fn from_providers(
        credentials_dir: &Path,
        providers: &[Provider],
    ) -> anyhow::Result<Arc<Self>> {
        let manager = Self {
            slots: DashMap::new(),
            events: broadcast::channel(32).0,
            probe_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build probe client"),
        };

        for provider in providers {
            let reference = provider.credential_ref();
            if manager.slots.contains_key(&reference) {
                continue; // providers may share a credential ref
            }
            let (source, file) = match &provider.credential {
                CredentialSpec::Inline { api_key } => (
                    SlotSource::Inline,
                    CredentialFile { api_key: Some(api_key.clone()), ..Default::default() },
                ),
                CredentialSpec::Reference(name) => {
                    let path = credentials_dir.join(format!("{name}.json"));
                    let file = read_credential_file(&path)?;
                    (SlotSource::File(path), file)
                }
            };
            let material = file.material()?;
            manager.slots.insert(
                reference,
                CredentialSlot {
                    provider: provider.name.clone(),
                    source,
                    material: RwLock::new(Arc::new(material)),
                    state: RwLock::new(CredentialState::Valid),
                    oauth_url: file.oauth_url,
                },
            );
        }

        info!(credentials = manager.slots.len(), "credential manager seeded");
        Ok(Arc::new(manager))
    }

    pub fn refs(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.key().clone()).collect()
    }

    pub fn state(&self, reference: &str) -> Option<CredentialState> {
        self.slots
            .get(reference)
            .map(|slot| *slot.state.read().expect("state lock poisoned"))
    }

    /// Current token for the `Authorization` header. Readers get a stable
    /// snapshot; a concurrent refresh affects only later reads.
    pub fn bearer(&self, reference: &str) -> Option<String> {
        self.slots
            .get(reference)
            .map(|slot| slot.material.read().expect("material lock poisoned").token.clone())
    }

    /// Whether the credential is expired or inside the refresh margin.
    pub fn check_expiry(&self, reference: &str) -> bool {
        let Some(slot) = self.slots.get(reference) else { return false };
        let material = slot.material.read().expect("material lock poisoned");
        match material.expires_at {
            Some(expires_at) => Utc::now() + chrono::Duration::seconds(EXPIRY_MARGIN_SECS) >= expires_at,
            None => false,
        }
    }

    /// Schedule a refresh and return immediately.
    ///
    /// Returns `true` when a refresh is now pending (or already was); `false`
    /// for an unknown ref. The actual work runs on a spawned task, so the
    /// caller is never exposed to I/O latency.
    pub fn refresh_auth(self: &Arc<Self>, reference: &str) -> bool {
        let Some(slot) = self.slots.get(reference) else { return false };
        {
            let mut state = slot.state.write().expect("state lock poisoned");
            if *state == CredentialState::Refreshing {
                return true; // already scheduled
            }
            *state = CredentialState::Refreshing;
        }
        drop(slot);

        let manager = Arc::clone(self);
        let reference = reference.to_string();
        tokio::spawn(async move { manager.perform_refresh(&reference).await });
        true
    }

    async fn perform_refresh(&self, reference: &str) {
        let outcome = self.reload_material(reference).await;
        let Some(slot) = self.slots.get(reference) else { return };

        match outcome {
            Ok(material) => {
                info!(
                    credential_ref = reference,
                    expires_at = ?material.expires_at,
                    refreshable = material.refresh_token.is_some(),
                    "credential refreshed"
                );
                *slot.material.write().expect("material lock poisoned") = Arc::new(material);
                *slot.state.write().expect("state lock poisoned") = CredentialState::Valid;
                let _ = self.events.send(CredentialEvent::Refreshed {
                    credential_ref: reference.to_string(),
                });
            }
            Err(reason) => {
                *slot.state.write().expect("state lock poisoned") = CredentialState::Invalid;
                error!(credential_ref = reference, %reason, "credential refresh failed");
                let _ = self.events.send(CredentialEvent::Invalidated {
                    credential_ref: reference.to_string(),
                    provider: slot.provider.clone(),
                    oauth_url: slot.oauth_url.clone(),
                });
            }
        }
    }

    /// Re-read the backing store for a credential. Inline keys have no
    /// backing store and cannot be refreshed.
    async fn reload_material(&self, reference: &str) -> Result<CredentialMaterial, anyhow::Error> {
        let path = {
            let slot = self
                .slots
                .get(reference)
                .ok_or_else(|| anyhow::anyhow!("unknown credential `{reference}`"))?;
            match &slot.source {
                SlotSource::Inline => {
                    anyhow::bail!("inline credential cannot be refreshed — update the config")
                }
                SlotSource::File(path) => path.clone(),
            }
        };

        let file = tokio::task::spawn_blocking(move || read_credential_file(&path))
            .await
            .map_err(|e| anyhow::anyhow!("refresh task panicked: {e}"))??;
        let material = file.material()?;
        if let Some(expires_at) = material.expires_at {
            anyhow::ensure!(
                expires_at > Utc::now(),
                "credential file is already expired (expires_at {expires_at})"
            );
        }
        Ok(material)
    }

    /// Probe the provider with a cheap authenticated call.
    pub async fn validate_with_api(&self, reference: &str, base_url: &str) -> bool {
        let Some(token) = self.bearer(reference) else { return false };
        let url = format!("{}/models", base_url.trim_end_matches('/'));
        match self
            .probe_client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(credential_ref = reference, error = %e, "credential probe failed");
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.events.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn test_fixture(entries: &[(&str, &str)]) -> Arc<Self> {
        let manager = Self {
            slots: DashMap::new(),
            events: broadcast::channel(32).0,
            probe_client: reqwest::Client::new(),
        };
        for (reference, token) in entries {
            manager.slots.insert(
                reference.to_string(),
                CredentialSlot {
                    provider: reference.to_string(),
                    source: SlotSource::Inline,
                    material: RwLock::new(Arc::new(CredentialMaterial {
                        token: token.to_string(),
                        refresh_token: None,
                        expires_at: None,
                    })),
                    state: RwLock::new(CredentialState::Valid),
                    oauth_url: None,
                },
            );
        }
        Arc::new(manager)
    }
}

// ---------------------------------------------------------------------------
// Credential files
// ---------------------------------------------------------------------------

/// Per-ref JSON document: `{access_token, refresh_token?, expires_at?}` for
/// OAuth-style material, `{api_key}` for static keys.
#[derive(Debug, Default, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<Value>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    oauth_url: Option<String>,
}

impl CredentialFile {
    fn material(&self) -> anyhow::Result<CredentialMaterial> {
        let token = self
            .access_token
            .clone()
            .or_else(|| self.api_key.clone())
            .ok_or_else(|| anyhow::anyhow!("credential file has neither access_token nor api_key"))?;
        Ok(CredentialMaterial {
            token,
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at.as_ref().map(parse_expiry).transpose()?,
        })
    }
}

fn read_credential_file(path: &Path) -> anyhow::Result<CredentialFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

/// `expires_at` may be an RFC 3339 string, epoch seconds, or epoch millis.
fn parse_expiry(value: &Value) -> anyhow::Result<DateTime<Utc>> {
    match value {
        Value::String(s) => Ok(DateTime::parse_from_rfc3339(s)
            .map_err(|e| anyhow::anyhow!("invalid expires_at `{s}`: {e}"))?
            .with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("invalid expires_at number"))?;
            // Heuristic: values past the year 2603 in seconds are millis.
            let timestamp = if n > 20_000_000_000 { n / 1000 } else { n };
            Utc.timestamp_opt(timestamp, 0)
                .single()
                .ok_or_else(|| anyhow::anyhow!("expires_at out of range"))
        }
        other => anyhow::bail!("invalid expires_at: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Self-check
// ---------------------------------------------------------------------------

/// Background loop keeping credentials live and pipelines honest.
///
/// Holds the pipeline manager (never the other way round): credential events
/// flow one way, from the manager's broadcast channel into quarantine/resume
/// calls.
pub struct SelfCheck {
    credentials: Arc<CredentialManager>,
    pipelines: Arc<PipelineManager>,
    interval: Duration,
}

impl SelfCheck {
    pub fn new(credentials: Arc<CredentialManager>, pipelines: Arc<PipelineManager>) -> Self {
        Self { credentials, pipelines, interval: SELF_CHECK_INTERVAL }
    }

    #[cfg(test)]
    pub(crate) fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut credential_events = self.credentials.subscribe();
        let mut pipeline_events = self.pipelines.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = credential_events.recv() => match event {
                    Ok(CredentialEvent::Invalidated { credential_ref, provider, oauth_url }) => {
                        let err = PipelineError::AuthRecreateRequired {
                            credential_ref: credential_ref.clone(),
                            provider,
                            oauth_url,
                        };
                        error!(kind = err.kind(), error = %err, "operator action required");
                        self.pipelines
                            .quarantine_dependents(&credential_ref, "credential invalid");
                    }
                    Ok(CredentialEvent::Refreshed { credential_ref }) => {
                        self.pipelines.resume_dependents(&credential_ref);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "self-check lagged behind credential events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                // Audit trail for quarantine transitions, wherever they come from.
                event = pipeline_events.recv() => match event {
                    Ok(PipelineEvent::Quarantined { pipeline_id, reason }) => {
                        info!(%pipeline_id, %reason, "self-check observed quarantine");
                    }
                    Ok(PipelineEvent::Resumed { pipeline_id }) => {
                        info!(%pipeline_id, "self-check observed resume");
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    for reference in self.credentials.refs() {
                        let state = self.credentials.state(&reference);
                        let near_expiry = self.credentials.check_expiry(&reference);
                        // Invalid slots are retried too: the operator may have
                        // replaced the file since the last pass.
                        if near_expiry || state == Some(CredentialState::Invalid) {
                            self.credentials.refresh_auth(&reference);
                        }
                    }
                    self.probe_quarantined_pipelines().await;
                }
            }
        }
    }

    /// Safety net for missed events: a quarantined pipeline whose credential
    /// is valid again gets probed against the provider and resumed on
    /// success.
    async fn probe_quarantined_pipelines(&self) {
        for pipeline_id in self.pipelines.pipeline_ids() {
            let Some(pipeline) = self.pipelines.pipeline(&pipeline_id) else { continue };
            if !matches!(pipeline.status(), crate::pipeline::PipelineStatus::Quarantined { .. }) {
                continue;
            }
            let config = pipeline.config();
            if self.credentials.state(&config.credential_ref) != Some(CredentialState::Valid) {
                continue;
            }
            if self
                .credentials
                .validate_with_api(&config.credential_ref, &config.endpoint)
                .await
            {
                self.pipelines.resume(&pipeline_id);
            }
        }
    }
}
