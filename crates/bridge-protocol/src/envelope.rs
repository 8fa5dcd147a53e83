use crate::error::CodecError;
use crate::id::MessageId;
use crate::namespace::{Namespace, Path};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_ACTION_LEN: usize = 64;
const MAX_EVENT_NAME_LEN: usize = 64;
const MIN_TTL_MS: u32 = 1;
const MAX_TTL_MS: u32 = 300_000;
const MIN_PATTERNS: usize = 1;
const MAX_PATTERNS: usize = 100;

/// Terminal or intermediate state of a routed `command` (`spec.md` §4.1).
/// `rejected` is accepted on inbound acks but emitted by no router path here
/// (`spec.md` §9, open question) — callers must still be able to deserialize it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
    Completed,
    Failed,
    Timeout,
    Rejected,
}

/// Which message kinds a subscription admits (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionFilter {
    State,
    Events,
    All,
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self::All
    }
}

/// The kind of message a [`SubscriptionFilter`] is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    State,
    Event,
}

impl SubscriptionFilter {
    #[must_use]
    pub fn admits(self, kind: MessageKind) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::State => matches!(kind, MessageKind::State),
            SubscriptionFilter::Events => matches!(kind, MessageKind::Event),
        }
    }
}

/// The seven envelope subtypes (`spec.md` §4.1's payload table), modeled as
/// a tagged sum keyed by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Command {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    State {
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stale: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<Namespace>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    Ack {
        status: AckStatus,
        #[serde(rename = "commandId")]
        command_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            rename = "relatedMessageId"
        )]
        related_message_id: Option<MessageId>,
    },
    Subscribe {
        patterns: Vec<String>,
        #[serde(default)]
        filter: SubscriptionFilter,
        #[serde(default = "default_snapshot")]
        snapshot: bool,
    },
    Unsubscribe {
        patterns: Vec<String>,
    },
}

fn default_snapshot() -> bool {
    true
}

impl Payload {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Command { .. } => "command",
            Payload::Event { .. } => "event",
            Payload::State { .. } => "state",
            Payload::Ack { .. } => "ack",
            Payload::Error { .. } => "error",
            Payload::Subscribe { .. } => "subscribe",
            Payload::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// The unit of exchange between the hub and any participant (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: MessageId,
    pub source: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Namespace>,
    pub path: Path,
    #[serde(flatten)]
    pub payload: Payload,
    pub timestamp: u64,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Envelope {
    /// Every boundary and shape check from `spec.md` §4.1/§8 that isn't
    /// already enforced by the field types themselves. Returns the first
    /// violation found, naming the offending field.
    pub fn validate(&self) -> Result<(), CodecError> {
        let needs_target = matches!(self.payload, Payload::Command { .. } | Payload::Ack { .. });
        if needs_target && self.target.is_none() {
            return Err(CodecError::Invalid {
                field: "target".to_owned(),
                reason: format!("{} requires a target", self.payload.type_name()),
            });
        }

        if let Some(ttl) = self.ttl {
            if !(MIN_TTL_MS..=MAX_TTL_MS).contains(&ttl) {
                return Err(CodecError::Invalid {
                    field: "ttl".to_owned(),
                    reason: format!("ttl must be in 1..=300000, got {ttl}"),
                });
            }
        }

        match &self.payload {
            Payload::Command { action, .. } => {
                if self.idempotency_key.is_none() {
                    return Err(CodecError::Invalid {
                        field: "idempotencyKey".to_owned(),
                        reason: "command requires an idempotencyKey".to_owned(),
                    });
                }
                if action.is_empty() || action.chars().count() > MAX_ACTION_LEN {
                    return Err(CodecError::Invalid {
                        field: "action".to_owned(),
                        reason: format!("action must be 1..={MAX_ACTION_LEN} characters"),
                    });
                }
            }
            Payload::Event { event, .. } => {
                if event.is_empty() || event.chars().count() > MAX_EVENT_NAME_LEN {
                    return Err(CodecError::Invalid {
                        field: "event".to_owned(),
                        reason: format!("event must be 1..={MAX_EVENT_NAME_LEN} characters"),
                    });
                }
            }
            Payload::Subscribe { patterns, .. } | Payload::Unsubscribe { patterns } => {
                validate_patterns(patterns)?;
            }
            Payload::State { .. } | Payload::Ack { .. } | Payload::Error { .. } => {}
        }

        Ok(())
    }
}

fn validate_patterns(patterns: &[String]) -> Result<(), CodecError> {
    if patterns.len() < MIN_PATTERNS || patterns.len() > MAX_PATTERNS {
        return Err(CodecError::Invalid {
            field: "patterns".to_owned(),
            reason: format!(
                "patterns must contain {MIN_PATTERNS}..={MAX_PATTERNS} entries, got {}",
                patterns.len()
            ),
        });
    }
    for pattern in patterns {
        crate::pattern::compile_pattern(pattern)?;
    }
    Ok(())
}
