//! WebSocket protocol types.
//!
//! Message types for client-server communication. Both directions are
//! `type`-tagged JSON frames in kebab-case.

use serde::{Deserialize, Serialize};

use cropside_core::{
    FallbackOption, MediaProfile, NetworkQuality, Participant, Recommendation, Role, SessionEvent,
    SessionSnapshot, SignalPayload, WorkspaceEvent, WorkspaceEventKind,
};

/// Identity bound to a connection by the hello handshake. The token itself
/// is minted and verified by the external identity issuer; here it is only
/// carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsUser {
    pub user_id: String,
    pub display_name: String,
}

/// A recommendation as submitted by a client. The server stamps expert
/// identity and creation time; clients cannot speak for other experts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationDraft {
    /// Caller-supplied unique id.
    pub id: String,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Messages sent FROM the client TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Handshake; must be the first frame on every connection.
    Hello {
        /// Opaque auth token from the external identity issuer.
        token: String,
        user_id: String,
        display_name: String,
    },
    /// Open a new diagnosis session; the server generates the session id.
    CreateSession { title: String },
    /// Join (or rebind to) a session. Replies with the full snapshot.
    JoinSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    LeaveSession { session_id: String },
    /// Shared-workspace update; stamped and fanned out to other participants.
    WorkspaceUpdate {
        session_id: String,
        kind: WorkspaceEventKind,
        data: serde_json::Value,
    },
    /// Record an expert opinion in the session's append-only log.
    AddRecommendation {
        session_id: String,
        recommendation: RecommendationDraft,
    },
    /// WebRTC offer for `target`. An attached quality sample is answered
    /// with a `media-profile` frame to this sender.
    Offer {
        session_id: String,
        target: String,
        payload: SignalPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quality: Option<NetworkQuality>,
    },
    Answer {
        session_id: String,
        target: String,
        payload: SignalPayload,
    },
    IceCandidate {
        session_id: String,
        target: String,
        payload: SignalPayload,
    },
    /// Standalone adaptation check; replies with `media-profile`.
    #[serde(rename = "network-quality")]
    QualityCheck { metrics: NetworkQuality },
    /// Outcome of a negotiation this client took part in.
    NegotiationResult {
        session_id: String,
        target: String,
        outcome: NegotiationOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationOutcome {
    Connected,
    Failed,
}

/// Messages sent FROM the server TO the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Handshake reply carrying the server-assigned socket id.
    Welcome { socket_id: String },
    SessionCreated { session: SessionSnapshot },
    /// Join reply: full roster, recommendation log, and workspace log.
    SessionState { session: SessionSnapshot },
    /// Ack for `add-recommendation`, carrying the stored copy.
    RecommendationAdded {
        session_id: String,
        recommendation: Recommendation,
    },
    WorkspaceUpdated {
        session_id: String,
        event: WorkspaceEvent,
    },
    ParticipantJoined {
        session_id: String,
        participant: Participant,
    },
    ParticipantLeft {
        session_id: String,
        user_id: String,
    },
    SessionClosed { session_id: String },
    Offer {
        session_id: String,
        from: String,
        payload: SignalPayload,
    },
    Answer {
        session_id: String,
        from: String,
        payload: SignalPayload,
    },
    IceCandidate {
        session_id: String,
        from: String,
        payload: SignalPayload,
    },
    /// Adaptation verdict for a submitted quality sample.
    MediaProfile { profile: MediaProfile },
    /// Negotiation cannot reach Connected; these downgrades are available.
    FallbackOptions {
        session_id: String,
        peer: String,
        options: Vec<FallbackOption>,
        reason: String,
    },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::WorkspaceUpdated { session_id, event } => {
                ServerMessage::WorkspaceUpdated { session_id, event }
            }
            SessionEvent::ParticipantJoined {
                session_id,
                participant,
            } => ServerMessage::ParticipantJoined {
                session_id,
                participant,
            },
            SessionEvent::ParticipantLeft {
                session_id,
                user_id,
            } => ServerMessage::ParticipantLeft {
                session_id,
                user_id,
            },
            SessionEvent::SessionClosed { session_id } => {
                ServerMessage::SessionClosed { session_id }
            }
            SessionEvent::Offer {
                session_id,
                from,
                payload,
            } => ServerMessage::Offer {
                session_id,
                from,
                payload,
            },
            SessionEvent::Answer {
                session_id,
                from,
                payload,
            } => ServerMessage::Answer {
                session_id,
                from,
                payload,
            },
            SessionEvent::IceCandidate {
                session_id,
                from,
                payload,
            } => ServerMessage::IceCandidate {
                session_id,
                from,
                payload,
            },
            SessionEvent::FallbackAdvised {
                session_id,
                peer,
                options,
                reason,
            } => ServerMessage::FallbackOptions {
                session_id,
                peer,
                options,
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_kebab_case_tags() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"join-session","session_id":"s-1","role":"observer"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinSession { ref session_id, role: Some(Role::Observer) }
                if session_id == "s-1"
        ));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"network-quality","metrics":{"bandwidth_bps":800000,"latency_ms":120,"packet_loss":0.03,"jitter_ms":4}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::QualityCheck { .. }));
    }

    #[test]
    fn offer_quality_sample_is_optional() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"offer","session_id":"s-1","target":"bob","payload":{"sdp":"v=0"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Offer { quality, payload, .. } => {
                assert!(quality.is_none());
                assert_eq!(payload.sdp.as_deref(), Some("v=0"));
            }
            other => panic!("expected Offer, got {:?}", other),
        }
    }

    #[test]
    fn session_events_map_onto_wire_frames() {
        let event = SessionEvent::FallbackAdvised {
            session_id: "s-1".into(),
            peer: "bob".into(),
            options: vec![FallbackOption::AudioOnly, FallbackOption::TextOnly],
            reason: "negotiation with bob timed out after 10s".into(),
        };
        let msg = ServerMessage::from(event);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "fallback-options");
        assert_eq!(json["options"][0], "audio-only");
        assert_eq!(json["options"][1], "text-only");
    }

    #[test]
    fn error_frames_carry_stable_codes() {
        let json =
            serde_json::to_value(ServerMessage::error("session-closed", "session s-1 is closed"))
                .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "session-closed");
    }
}
