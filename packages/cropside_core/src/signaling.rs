//! Signaling coordinator: network-quality classification, adaptive media
//! settings, and relay of peer connection-negotiation payloads.
//!
//! The coordinator never interprets SDP or candidate contents; payloads are
//! opaque. Its job is membership validation, the per-pair negotiation state
//! machine, and driving the Degraded/fallback path when a pair cannot reach
//! Connected in time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::models::SessionEvent;
use crate::registry::{Outbox, SessionRegistry};

// =============================================================================
// Quality classification
// =============================================================================

// Load-bearing thresholds: tests assert these literal boundaries, and clients
// mirror them. Do not re-tune.
pub const POOR_BANDWIDTH_BPS: u64 = 500_000;
pub const MEDIUM_BANDWIDTH_BPS: u64 = 1_000_000;
pub const POOR_LATENCY_MS: u64 = 200;
pub const MEDIUM_LATENCY_MS: u64 = 100;
pub const POOR_PACKET_LOSS: f64 = 0.05;
pub const MEDIUM_PACKET_LOSS: f64 = 0.02;

/// One network measurement, supplied per negotiation. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkQuality {
    pub bandwidth_bps: u64,
    pub latency_ms: u64,
    /// Fraction of packets lost, 0.0..=1.0.
    pub packet_loss: f64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Poor,
    Medium,
    Good,
}

/// Video tier selected for a classified connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

/// Adaptive media settings derived from a quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSettings {
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub video_quality: QualityTier,
}

/// Full adaptation verdict returned to the peer that supplied the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProfile {
    pub level: QualityLevel,
    pub settings: MediaSettings,
    pub advisories: Vec<String>,
}

/// Deterministic thresholding, Poor checked first so borderline samples
/// resolve unambiguously: failing any Poor condition is Poor regardless of
/// the other metrics.
pub fn classify(quality: &NetworkQuality) -> QualityLevel {
    if quality.bandwidth_bps < POOR_BANDWIDTH_BPS
        || quality.latency_ms > POOR_LATENCY_MS
        || quality.packet_loss > POOR_PACKET_LOSS
    {
        QualityLevel::Poor
    } else if quality.bandwidth_bps < MEDIUM_BANDWIDTH_BPS
        || quality.latency_ms > MEDIUM_LATENCY_MS
        || quality.packet_loss > MEDIUM_PACKET_LOSS
    {
        QualityLevel::Medium
    } else {
        QualityLevel::Good
    }
}

pub fn media_settings_for(level: QualityLevel) -> MediaSettings {
    match level {
        // Audio survives every tier; video is the first thing to go.
        QualityLevel::Poor => MediaSettings {
            video_enabled: false,
            audio_enabled: true,
            video_quality: QualityTier::Low,
        },
        QualityLevel::Medium => MediaSettings {
            video_enabled: true,
            audio_enabled: true,
            video_quality: QualityTier::Medium,
        },
        QualityLevel::Good => MediaSettings {
            video_enabled: true,
            audio_enabled: true,
            video_quality: QualityTier::High,
        },
    }
}

/// Human-readable advisories for the sampled conditions. Never empty:
/// when nothing triggers, a single all-clear message is returned.
pub fn advisories(quality: &NetworkQuality) -> Vec<String> {
    let mut out = Vec::new();
    if quality.bandwidth_bps < POOR_BANDWIDTH_BPS {
        out.push(
            "bandwidth is below 500 kbps; switching to audio-only will improve reliability"
                .to_string(),
        );
    }
    if quality.latency_ms > POOR_LATENCY_MS {
        out.push("latency is above 200 ms; expect delayed audio and video".to_string());
    }
    if quality.packet_loss > POOR_PACKET_LOSS {
        out.push("connection is unstable (packet loss above 5%); media may stutter".to_string());
    }
    if out.is_empty() {
        out.push("network conditions are good".to_string());
    }
    out
}

/// Classify a sample and bundle settings plus advisories.
pub fn assess(quality: &NetworkQuality) -> MediaProfile {
    let level = classify(quality);
    MediaProfile {
        level,
        settings: media_settings_for(level),
        advisories: advisories(quality),
    }
}

// =============================================================================
// Negotiation state machine & relay
// =============================================================================

/// Opaque connection-negotiation payload. The coordinator forwards these
/// verbatim; host/srflx/relay candidates all pass undiscriminated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    AnswerReceived,
    Connected,
    /// Nominal peer-to-peer media is not viable; fallback options apply.
    Degraded,
}

/// Always-available downgrade paths when a pair cannot reach Connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackOption {
    AudioOnly,
    TextOnly,
    /// Retry through the configured TURN relay.
    TurnRetry,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// How long each negotiation step may take before the pair degrades.
    pub negotiation_timeout: Duration,
    /// TURN relay URL; enables the `turn-retry` fallback when set.
    pub turn_server_url: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(10),
            turn_server_url: None,
        }
    }
}

/// Interval for pruning negotiation records of no-longer-active sessions.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub offers_relayed: AtomicU64,
    pub answers_relayed: AtomicU64,
    pub candidates_relayed: AtomicU64,
    pub connections_established: AtomicU64,
    pub negotiation_timeouts: AtomicU64,
    pub degraded_transitions: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            offers_relayed: self.offers_relayed.load(Ordering::Relaxed),
            answers_relayed: self.answers_relayed.load(Ordering::Relaxed),
            candidates_relayed: self.candidates_relayed.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            negotiation_timeouts: self.negotiation_timeouts.load(Ordering::Relaxed),
            degraded_transitions: self.degraded_transitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub offers_relayed: u64,
    pub answers_relayed: u64,
    pub candidates_relayed: u64,
    pub connections_established: u64,
    pub negotiation_timeouts: u64,
    pub degraded_transitions: u64,
}

/// Directed peer pair: the initiator sent the offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    session_id: String,
    initiator: String,
    responder: String,
}

struct Negotiation {
    state: NegotiationState,
    /// Cancelling this disarms the pending timeout watchdog.
    watchdog: CancellationToken,
}

/// Relays negotiation payloads between participants and tracks per-pair
/// negotiation state. Membership is validated against the registry on every
/// relay; the coordinator holds no roster of its own.
pub struct SignalingCoordinator {
    registry: Arc<SessionRegistry>,
    config: SignalingConfig,
    pairs: RwLock<HashMap<PairKey, Negotiation>>,
    metrics: Arc<CoordinatorMetrics>,
    cancel: CancellationToken,
}

impl SignalingCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, config: SignalingConfig) -> Self {
        Self {
            registry,
            config,
            pairs: RwLock::new(HashMap::new()),
            metrics: Arc::new(CoordinatorMetrics::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> Arc<CoordinatorMetrics> {
        self.metrics.clone()
    }

    /// The fallback menu: audio-only and text-only are always available;
    /// a TURN retry joins them when a relay server is configured.
    pub fn fallback_options(&self) -> Vec<FallbackOption> {
        let mut options = vec![FallbackOption::AudioOnly, FallbackOption::TextOnly];
        if self.config.turn_server_url.is_some() {
            options.push(FallbackOption::TurnRetry);
        }
        options
    }

    /// Relay an offer from `from` to `target`, moving the pair to OfferSent
    /// and arming the timeout watchdog. When the offerer attached a network
    /// sample, the adaptation verdict for it is returned so the caller can
    /// hand it back to the offerer.
    pub async fn relay_offer(
        self: &Arc<Self>,
        session_id: &str,
        from: &str,
        target: &str,
        payload: SignalPayload,
        quality: Option<&NetworkQuality>,
    ) -> Result<Option<MediaProfile>, SignalingError> {
        self.ensure_participant(session_id, from).await?;
        let target_outbox = self.ensure_participant(session_id, target).await?;

        self.forward(
            &target_outbox,
            SessionEvent::Offer {
                session_id: session_id.to_string(),
                from: from.to_string(),
                payload,
            },
            session_id,
            target,
        )?;
        self.metrics.offers_relayed.fetch_add(1, Ordering::Relaxed);

        let key = PairKey {
            session_id: session_id.to_string(),
            initiator: from.to_string(),
            responder: target.to_string(),
        };
        self.transition(key, NegotiationState::OfferSent, true).await;
        debug!(session = %session_id, from = %from, target = %target, "offer relayed");

        Ok(quality.map(assess))
    }

    /// Relay an answer from the responder back to the initiator, moving the
    /// pair to AnswerReceived. The watchdog re-arms for the final hop to
    /// Connected.
    pub async fn relay_answer(
        self: &Arc<Self>,
        session_id: &str,
        from: &str,
        target: &str,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        self.ensure_participant(session_id, from).await?;
        let target_outbox = self.ensure_participant(session_id, target).await?;

        self.forward(
            &target_outbox,
            SessionEvent::Answer {
                session_id: session_id.to_string(),
                from: from.to_string(),
                payload,
            },
            session_id,
            target,
        )?;
        self.metrics.answers_relayed.fetch_add(1, Ordering::Relaxed);

        let key = PairKey {
            session_id: session_id.to_string(),
            initiator: target.to_string(),
            responder: from.to_string(),
        };
        self.transition(key, NegotiationState::AnswerReceived, true)
            .await;
        debug!(session = %session_id, from = %from, target = %target, "answer relayed");
        Ok(())
    }

    /// Relay an ICE candidate. Pure forwarding: no state change, no
    /// discrimination by candidate type.
    pub async fn relay_candidate(
        &self,
        session_id: &str,
        from: &str,
        target: &str,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        self.ensure_participant(session_id, from).await?;
        let target_outbox = self.ensure_participant(session_id, target).await?;

        self.forward(
            &target_outbox,
            SessionEvent::IceCandidate {
                session_id: session_id.to_string(),
                from: from.to_string(),
                payload,
            },
            session_id,
            target,
        )?;
        self.metrics
            .candidates_relayed
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Explicit success signal from either peer: the relay never parses SDP,
    /// so it cannot infer connectivity itself. Disarms the watchdog.
    pub async fn mark_connected(&self, session_id: &str, peer_a: &str, peer_b: &str) {
        let Some(key) = self.find_key(session_id, peer_a, peer_b).await else {
            return;
        };
        let mut pairs = self.pairs.write().await;
        if let Some(negotiation) = pairs.get_mut(&key) {
            negotiation.watchdog.cancel();
            negotiation.state = NegotiationState::Connected;
            self.metrics
                .connections_established
                .fetch_add(1, Ordering::Relaxed);
            info!(
                session = %session_id,
                initiator = %key.initiator,
                responder = %key.responder,
                "peer connection established"
            );
        }
    }

    /// Explicit failure signal: the pair degrades and the caller gets the
    /// fallback menu. Degrading is not teardown; the session continues.
    pub async fn mark_failed(
        &self,
        session_id: &str,
        peer_a: &str,
        peer_b: &str,
        reason: &str,
    ) -> Vec<FallbackOption> {
        if let Some(key) = self.find_key(session_id, peer_a, peer_b).await {
            let mut pairs = self.pairs.write().await;
            if let Some(negotiation) = pairs.get_mut(&key) {
                negotiation.watchdog.cancel();
                if negotiation.state != NegotiationState::Degraded {
                    negotiation.state = NegotiationState::Degraded;
                    self.metrics
                        .degraded_transitions
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            warn!(session = %session_id, peer_a = %peer_a, peer_b = %peer_b, "negotiation failed: {}", reason);
        }
        self.fallback_options()
    }

    /// Current state of a pair (either direction); Idle when unknown.
    pub async fn pair_state(
        &self,
        session_id: &str,
        peer_a: &str,
        peer_b: &str,
    ) -> NegotiationState {
        match self.find_key(session_id, peer_a, peer_b).await {
            Some(key) => self
                .pairs
                .read()
                .await
                .get(&key)
                .map(|n| n.state)
                .unwrap_or(NegotiationState::Idle),
            None => NegotiationState::Idle,
        }
    }

    /// Spawn the maintenance task that prunes negotiation records of
    /// sessions that are no longer Active. Runs until [`Self::shutdown`].
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => coordinator.prune_inactive().await,
                }
            }
            debug!("signaling maintenance stopped");
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn prune_inactive(&self) {
        let keys: Vec<PairKey> = self.pairs.read().await.keys().cloned().collect();
        for key in keys {
            if !self.registry.is_active(&key.session_id).await {
                if let Some(negotiation) = self.pairs.write().await.remove(&key) {
                    negotiation.watchdog.cancel();
                    debug!(session = %key.session_id, "pruned stale negotiation");
                }
            }
        }
    }

    /// Locate a pair record regardless of which peer initiated.
    async fn find_key(
        &self,
        session_id: &str,
        peer_a: &str,
        peer_b: &str,
    ) -> Option<PairKey> {
        let pairs = self.pairs.read().await;
        let forward = PairKey {
            session_id: session_id.to_string(),
            initiator: peer_a.to_string(),
            responder: peer_b.to_string(),
        };
        if pairs.contains_key(&forward) {
            return Some(forward);
        }
        let reverse = PairKey {
            session_id: session_id.to_string(),
            initiator: peer_b.to_string(),
            responder: peer_a.to_string(),
        };
        pairs.contains_key(&reverse).then_some(reverse)
    }

    async fn ensure_participant(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Outbox, SignalingError> {
        self.registry
            .participant_outbox(session_id, user_id)
            .await
            .ok_or_else(|| SignalingError::PeerUnavailable {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
            })
    }

    fn forward(
        &self,
        outbox: &Outbox,
        event: SessionEvent,
        session_id: &str,
        target: &str,
    ) -> Result<(), SignalingError> {
        outbox.try_send(event).map_err(|e| {
            warn!(session = %session_id, target = %target, "signal delivery failed: {}", e);
            SignalingError::PeerUnavailable {
                session_id: session_id.to_string(),
                user_id: target.to_string(),
            }
        })
    }

    /// Replace the pair's record, disarming any previous watchdog and
    /// optionally arming a fresh one for the new phase.
    async fn transition(self: &Arc<Self>, key: PairKey, state: NegotiationState, arm: bool) {
        let watchdog = if arm {
            self.arm_watchdog(&key).await
        } else {
            CancellationToken::new()
        };
        let mut pairs = self.pairs.write().await;
        if let Some(old) = pairs.remove(&key) {
            old.watchdog.cancel();
        }
        pairs.insert(key, Negotiation { state, watchdog });
    }

    /// Watchdog tokens are children of the session's token, so closing the
    /// session stops every pending negotiation timer at once.
    async fn arm_watchdog(self: &Arc<Self>, key: &PairKey) -> CancellationToken {
        let parent = self
            .registry
            .session_token(&key.session_id)
            .await
            .unwrap_or_else(CancellationToken::new);
        let token = parent.child_token();
        let task_token = token.clone();
        let coordinator = Arc::clone(self);
        let key = key.clone();
        let timeout = self.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    coordinator.on_negotiation_timeout(key).await;
                }
            }
        });
        token
    }

    async fn on_negotiation_timeout(&self, key: PairKey) {
        {
            let mut pairs = self.pairs.write().await;
            let Some(negotiation) = pairs.get_mut(&key) else {
                return;
            };
            if negotiation.state == NegotiationState::Connected {
                return;
            }
            negotiation.state = NegotiationState::Degraded;
        }
        self.metrics
            .negotiation_timeouts
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .degraded_transitions
            .fetch_add(1, Ordering::Relaxed);

        let timeout_secs = self.config.negotiation_timeout.as_secs();
        let reason = SignalingError::NegotiationTimeout {
            peer: key.responder.clone(),
            timeout_secs,
        };
        warn!(
            session = %key.session_id,
            initiator = %key.initiator,
            responder = %key.responder,
            "{}", reason
        );
        // Advise the initiator; if it is gone too, there is nobody to tell.
        if let Some(outbox) = self
            .registry
            .participant_outbox(&key.session_id, &key.initiator)
            .await
        {
            let _ = outbox.try_send(SessionEvent::FallbackAdvised {
                session_id: key.session_id.clone(),
                peer: key.responder.clone(),
                options: self.fallback_options(),
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Participant, Role};
    use crate::registry::RegistryConfig;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn quality(bandwidth_bps: u64, latency_ms: u64, packet_loss: f64) -> NetworkQuality {
        NetworkQuality {
            bandwidth_bps,
            latency_ms,
            packet_loss,
            jitter_ms: 5,
        }
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn classification_matches_reference_table() {
        // Poor on every axis.
        let profile = assess(&quality(200_000, 300, 0.08));
        assert_eq!(profile.level, QualityLevel::Poor);
        assert!(!profile.settings.video_enabled);
        assert!(profile.settings.audio_enabled);
        assert_eq!(profile.settings.video_quality, QualityTier::Low);

        // Medium on every axis.
        let profile = assess(&quality(800_000, 120, 0.03));
        assert_eq!(profile.level, QualityLevel::Medium);
        assert!(profile.settings.video_enabled);
        assert_eq!(profile.settings.video_quality, QualityTier::Medium);

        // Good.
        let profile = assess(&quality(5_000_000, 50, 0.01));
        assert_eq!(profile.level, QualityLevel::Good);
        assert!(profile.settings.video_enabled);
        assert_eq!(profile.settings.video_quality, QualityTier::High);
    }

    #[test]
    fn poor_takes_priority_over_otherwise_good_metrics() {
        // Bandwidth alone drags an otherwise perfect link to Poor.
        assert_eq!(classify(&quality(100_000, 10, 0.0)), QualityLevel::Poor);
        // So does latency alone.
        assert_eq!(classify(&quality(10_000_000, 300, 0.0)), QualityLevel::Poor);
        // And loss alone.
        assert_eq!(classify(&quality(10_000_000, 10, 0.10)), QualityLevel::Poor);
    }

    #[test]
    fn boundary_values_use_strict_comparisons() {
        // Exactly at the Poor thresholds is not Poor.
        assert_eq!(classify(&quality(500_000, 200, 0.05)), QualityLevel::Medium);
        // Exactly at the Medium thresholds is Good.
        assert_eq!(classify(&quality(1_000_000, 100, 0.02)), QualityLevel::Good);
        // One past each boundary flips the class.
        assert_eq!(classify(&quality(499_999, 50, 0.0)), QualityLevel::Poor);
        assert_eq!(classify(&quality(2_000_000, 201, 0.0)), QualityLevel::Poor);
        assert_eq!(classify(&quality(999_999, 50, 0.0)), QualityLevel::Medium);
        assert_eq!(classify(&quality(2_000_000, 101, 0.0)), QualityLevel::Medium);
    }

    #[test]
    fn advisories_cooccur_and_never_come_up_empty() {
        let all = advisories(&quality(100_000, 300, 0.10));
        assert_eq!(all.len(), 3);

        let bandwidth_only = advisories(&quality(100_000, 50, 0.0));
        assert_eq!(bandwidth_only.len(), 1);
        assert!(bandwidth_only[0].contains("audio-only"));

        let clear = advisories(&quality(5_000_000, 20, 0.0));
        assert_eq!(clear, vec!["network conditions are good".to_string()]);
    }

    #[test]
    fn signal_payload_uses_webrtc_field_names() {
        let payload = SignalPayload {
            sdp: None,
            candidate: Some("candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host".into()),
            sdp_m_line_index: Some(0),
            sdp_mid: Some("audio".into()),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("sdpMLineIndex").is_some());
        assert!(json.get("sdpMid").is_some());
        assert!(json.get("sdp").is_none());
    }

    // =========================================================================
    // Relay & state machine
    // =========================================================================

    async fn setup(
        config: SignalingConfig,
    ) -> (
        Arc<SessionRegistry>,
        Arc<SignalingCoordinator>,
        mpsc::Receiver<SessionEvent>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        registry.create_session("s-1", "t", "alice").await.unwrap();
        let rx_alice = join(&registry, "alice").await;
        let rx_bob = join(&registry, "bob").await;
        let coordinator = Arc::new(SignalingCoordinator::new(registry.clone(), config));
        (registry, coordinator, rx_alice, rx_bob)
    }

    async fn join(registry: &Arc<SessionRegistry>, user_id: &str) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(32);
        registry
            .add_participant(
                "s-1",
                Participant {
                    user_id: user_id.to_string(),
                    socket_id: format!("sock-{user_id}"),
                    role: Role::Expert,
                    joined_at: Utc::now(),
                },
                tx,
            )
            .await
            .unwrap();
        rx
    }

    fn offer_payload() -> SignalPayload {
        SignalPayload {
            sdp: Some("v=0 o=- 0 0 IN IP4 127.0.0.1".into()),
            ..Default::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn offer_reaches_target_and_returns_profile() {
        let (_registry, coordinator, mut rx_alice, mut rx_bob) =
            setup(SignalingConfig::default()).await;
        drain(&mut rx_alice); // clear bob's join notification

        let profile = coordinator
            .relay_offer(
                "s-1",
                "alice",
                "bob",
                offer_payload(),
                Some(&quality(800_000, 120, 0.03)),
            )
            .await
            .unwrap()
            .expect("quality sample attached, profile expected");
        assert_eq!(profile.level, QualityLevel::Medium);

        match drain(&mut rx_bob).pop().unwrap() {
            SessionEvent::Offer { from, payload, .. } => {
                assert_eq!(from, "alice");
                assert!(payload.sdp.is_some());
            }
            other => panic!("expected Offer, got {:?}", other),
        }
        assert_eq!(
            coordinator.pair_state("s-1", "alice", "bob").await,
            NegotiationState::OfferSent
        );
    }

    #[tokio::test]
    async fn offer_without_sample_returns_no_profile() {
        let (_registry, coordinator, _rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        let profile = coordinator
            .relay_offer("s-1", "alice", "bob", offer_payload(), None)
            .await
            .unwrap();
        assert!(profile.is_none());
    }

    #[tokio::test]
    async fn relay_to_non_participant_fails() {
        let (_registry, coordinator, _rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        let err = coordinator
            .relay_offer("s-1", "alice", "mallory", offer_payload(), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SignalingError::PeerUnavailable {
                session_id: "s-1".into(),
                user_id: "mallory".into(),
            }
        );
    }

    #[tokio::test]
    async fn relay_in_closed_session_fails() {
        let (registry, coordinator, _rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        registry.close_session("s-1").await;
        let err = coordinator
            .relay_offer("s-1", "alice", "bob", offer_payload(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::PeerUnavailable { .. }));
    }

    #[tokio::test]
    async fn answer_advances_the_pair_state() {
        let (_registry, coordinator, mut rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        coordinator
            .relay_offer("s-1", "alice", "bob", offer_payload(), None)
            .await
            .unwrap();
        coordinator
            .relay_answer("s-1", "bob", "alice", offer_payload())
            .await
            .unwrap();

        assert_eq!(
            coordinator.pair_state("s-1", "alice", "bob").await,
            NegotiationState::AnswerReceived
        );
        let got_answer = drain(&mut rx_alice)
            .into_iter()
            .any(|e| matches!(e, SessionEvent::Answer { ref from, .. } if from == "bob"));
        assert!(got_answer);
    }

    #[tokio::test]
    async fn candidates_of_all_types_are_relayed() {
        let (_registry, coordinator, _rx_alice, mut rx_bob) =
            setup(SignalingConfig::default()).await;
        drain(&mut rx_bob);

        for candidate in [
            "candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host",
            "candidate:2 1 UDP 1686052607 198.51.100.1 54401 typ srflx",
            "candidate:3 1 UDP 41885439 203.0.113.1 54402 typ relay",
        ] {
            coordinator
                .relay_candidate(
                    "s-1",
                    "alice",
                    "bob",
                    SignalPayload {
                        candidate: Some(candidate.into()),
                        sdp_m_line_index: Some(0),
                        sdp_mid: Some("0".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(drain(&mut rx_bob).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_connected_disarms_the_watchdog() {
        let (_registry, coordinator, mut rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        coordinator
            .relay_offer("s-1", "alice", "bob", offer_payload(), None)
            .await
            .unwrap();
        coordinator.mark_connected("s-1", "bob", "alice").await;
        assert_eq!(
            coordinator.pair_state("s-1", "alice", "bob").await,
            NegotiationState::Connected
        );

        // Long past the timeout: no degradation, no fallback advice.
        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            coordinator.pair_state("s-1", "alice", "bob").await,
            NegotiationState::Connected
        );
        let advised = drain(&mut rx_alice)
            .into_iter()
            .any(|e| matches!(e, SessionEvent::FallbackAdvised { .. }));
        assert!(!advised);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_degrades_and_advises_the_initiator() {
        let (_registry, coordinator, mut rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        drain(&mut rx_alice);
        coordinator
            .relay_offer("s-1", "alice", "bob", offer_payload(), None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            coordinator.pair_state("s-1", "alice", "bob").await,
            NegotiationState::Degraded
        );
        let events = drain(&mut rx_alice);
        match events.last().unwrap() {
            SessionEvent::FallbackAdvised { peer, options, reason, .. } => {
                assert_eq!(peer, "bob");
                assert!(options.contains(&FallbackOption::AudioOnly));
                assert!(options.contains(&FallbackOption::TextOnly));
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected FallbackAdvised, got {:?}", other),
        }
        assert_eq!(coordinator.metrics().snapshot().negotiation_timeouts, 1);
    }

    #[tokio::test]
    async fn explicit_failure_returns_the_fallback_menu() {
        let (_registry, coordinator, _rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        coordinator
            .relay_offer("s-1", "alice", "bob", offer_payload(), None)
            .await
            .unwrap();

        let options = coordinator
            .mark_failed("s-1", "alice", "bob", "ice failed")
            .await;
        assert_eq!(
            options,
            vec![FallbackOption::AudioOnly, FallbackOption::TextOnly]
        );
        assert_eq!(
            coordinator.pair_state("s-1", "alice", "bob").await,
            NegotiationState::Degraded
        );
    }

    #[tokio::test]
    async fn turn_retry_offered_only_when_configured() {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let without = SignalingCoordinator::new(registry.clone(), SignalingConfig::default());
        assert!(!without.fallback_options().contains(&FallbackOption::TurnRetry));

        let with = SignalingCoordinator::new(
            registry,
            SignalingConfig {
                turn_server_url: Some("turn:relay.cropside.example:3478".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            with.fallback_options(),
            vec![
                FallbackOption::AudioOnly,
                FallbackOption::TextOnly,
                FallbackOption::TurnRetry,
            ]
        );
    }

    #[tokio::test]
    async fn prune_drops_pairs_of_closed_sessions() {
        let (registry, coordinator, _rx_alice, _rx_bob) =
            setup(SignalingConfig::default()).await;
        coordinator
            .relay_offer("s-1", "alice", "bob", offer_payload(), None)
            .await
            .unwrap();

        registry.close_session("s-1").await;
        coordinator.prune_inactive().await;
        assert_eq!(
            coordinator.pair_state("s-1", "alice", "bob").await,
            NegotiationState::Idle
        );
    }
}
