//! Razorpay webhook payload types
//!
//! Only the fields this service acts on are modelled. The envelope is parsed
//! first so that non-payment events can be acknowledged without requiring a
//! payment entity; the entity is extracted only for `payment.captured`.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// The only event type that creates records
pub const PAYMENT_CAPTURED: &str = "payment.captured";

/// Header Razorpay sets with the event id; used when the body omits `id`
pub const EVENT_ID_HEADER: &str = "x-razorpay-event-id";

/// Top-level webhook body
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl WebhookEnvelope {
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn is_payment_captured(&self) -> bool {
        self.event == PAYMENT_CAPTURED
    }

    /// Event id from the body, falling back to the delivery header
    pub fn event_id(&self, header: Option<&str>) -> BillingResult<String> {
        self.id
            .as_deref()
            .or(header)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BillingError::MalformedPayload("missing event id".into()))
    }

    /// `payload.payment.entity`
    pub fn payment_entity(&self) -> BillingResult<PaymentEntity> {
        let entity = self
            .payload
            .get("payment")
            .and_then(|p| p.get("entity"))
            .cloned()
            .ok_or_else(|| {
                BillingError::MalformedPayload("missing payload.payment.entity".into())
            })?;
        Ok(serde_json::from_value(entity)?)
    }
}

/// `payload.payment.entity`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub notes: Notes,
    /// Minor currency units (paise)
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Free-form `notes` attached when the order was created.
///
/// Razorpay sends `[]` instead of `{}` when no notes were set, and values may
/// be strings, numbers or booleans depending on how the order was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Notes(BTreeMap<String, serde_json::Value>);

impl Notes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Note value rendered as a trimmed, non-empty string
    pub fn get_str(&self, key: &str) -> Option<String> {
        let rendered = match self.0.get(key)? {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!rendered.is_empty()).then_some(rendered)
    }

    /// First present key among `keys`
    pub fn get_any(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.get_str(k))
    }

    pub fn get_bool(&self, keys: &[&str]) -> bool {
        self.get_any(keys)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone().into_iter().collect())
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => {
                Notes(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            _ => Notes::default(),
        }
    }
}

impl<'de> Deserialize<'de> for Notes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NotesVisitor;

        impl<'de> Visitor<'de> for NotesVisitor {
            type Value = Notes;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a notes object or an empty array")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Notes, A::Error> {
                let mut notes = BTreeMap::new();
                while let Some((k, v)) = map.next_entry::<String, serde_json::Value>()? {
                    notes.insert(k, v);
                }
                Ok(Notes(notes))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Notes, A::Error> {
                if seq.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::custom("notes array must be empty"));
                }
                Ok(Notes::default())
            }

            fn visit_unit<E: de::Error>(self) -> Result<Notes, E> {
                Ok(Notes::default())
            }
        }

        deserializer.deserialize_any(NotesVisitor)
    }
}

/// Discriminator value in `notes.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurposeKind {
    Service,
    Donation,
}

impl PurposeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurposeKind::Service => "service",
            PurposeKind::Donation => "donation",
        }
    }
}

impl std::str::FromStr for PurposeKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" => Ok(PurposeKind::Service),
            "donation" => Ok(PurposeKind::Donation),
            other => Err(BillingError::UnrecognizedPurpose(other.to_string())),
        }
    }
}

impl fmt::Display for PurposeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayerInfo {
    pub user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanInfo {
    pub tier: String,
    pub name: Option<String>,
    pub duration_days: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonorInfo {
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// What a captured payment paid for, decoded from `notes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentPurpose {
    Service { payer: PayerInfo, plan: PlanInfo },
    Donation { donor: DonorInfo, is_anonymous: bool },
}

impl PaymentPurpose {
    pub fn kind(&self) -> PurposeKind {
        match self {
            PaymentPurpose::Service { .. } => PurposeKind::Service,
            PaymentPurpose::Donation { .. } => PurposeKind::Donation,
        }
    }

    /// Decode the purpose. A missing or unknown `type` is an error, never a
    /// silent default.
    pub fn from_notes(notes: &Notes) -> BillingResult<Self> {
        let kind: PurposeKind = notes
            .get_str("type")
            .ok_or(BillingError::MissingNote("type"))?
            .parse()?;

        match kind {
            PurposeKind::Service => {
                let user_id = notes
                    .get_str("user_id")
                    .ok_or(BillingError::MissingNote("user_id"))?;
                let tier = notes
                    .get_any(&["plan_tier", "plan"])
                    .ok_or(BillingError::MissingNote("plan_tier"))?;
                // Display-only; a bad value must not cost the payer their invoice.
                let duration_days = notes.get_str("plan_duration_days").and_then(|raw| {
                    raw.parse::<i32>()
                        .map_err(|_| {
                            tracing::warn!(
                                value = %raw,
                                "Ignoring non-integer plan_duration_days note"
                            );
                        })
                        .ok()
                });

                Ok(PaymentPurpose::Service {
                    payer: PayerInfo {
                        user_id,
                        name: notes.get_any(&["payer_name", "name"]),
                        email: notes.get_any(&["payer_email", "email"]),
                    },
                    plan: PlanInfo {
                        tier,
                        name: notes.get_str("plan_name"),
                        duration_days,
                    },
                })
            }
            PurposeKind::Donation => Ok(PaymentPurpose::Donation {
                donor: DonorInfo {
                    user_id: notes.get_any(&["donor_user_id", "user_id"]),
                    name: notes.get_any(&["donor_name", "name"]),
                    email: notes.get_any(&["donor_email", "email"]),
                },
                is_anonymous: notes.get_bool(&["anonymous", "is_anonymous"]),
            }),
        }
    }
}
