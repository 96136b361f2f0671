use serde::Deserialize;

use crate::error::{BrokerError, Result};

/// Flat view of every field a callback document may carry, outer envelope
/// and decrypted body alike. Unknown elements are ignored.
#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(rename = "AppId")]
    app_id: Option<String>,
    #[serde(rename = "CreateTime")]
    create_time: Option<String>,
    #[serde(rename = "InfoType")]
    info_type: Option<String>,
    #[serde(rename = "ComponentVerifyTicket")]
    verify_ticket: Option<String>,
    #[serde(rename = "AuthorizerAppid")]
    authorizer_appid: Option<String>,
    #[serde(rename = "AuthorizationCode")]
    authorization_code: Option<String>,
    #[serde(rename = "AuthorizationCodeExpiredTime")]
    authorization_code_expired_time: Option<String>,
    #[serde(rename = "PreAuthCode")]
    pre_auth_code: Option<String>,
    #[serde(rename = "EncodingAESKey")]
    encoding_aes_key: Option<String>,
    #[serde(rename = "Token")]
    token: Option<String>,
    #[serde(rename = "Encrypt")]
    encrypt: Option<String>,
}

fn parse_document(xml: &str) -> Result<RawDocument> {
    quick_xml::de::from_str(xml).map_err(|e| BrokerError::Malformed(format!("callback xml: {e}")))
}

/// Trims and drops empty text so `<Token></Token>` reads as absent.
fn text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    text(value).ok_or_else(|| BrokerError::Malformed(format!("missing <{field}>")))
}

fn integer(value: Option<String>, field: &str) -> Result<Option<i64>> {
    text(value)
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| BrokerError::Malformed(format!("<{field}> is not an integer: {v:?}")))
        })
        .transpose()
}

/// Outer callback document as received over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub origin_id: Option<String>,
    pub encrypted: Option<String>,
    raw: String,
}

impl Envelope {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc = parse_document(xml)?;
        Ok(Self {
            origin_id: text(doc.app_id),
            encrypted: text(doc.encrypt),
            raw: xml.to_string(),
        })
    }

    /// The document itself, for callbacks delivered in plain mode.
    pub fn plain_body(&self) -> &str {
        &self.raw
    }
}

/// Kinds of notifications a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Authorized,
    UpdateAuthorized,
    Unauthorized,
    VerifyTicketRefresh,
    KeyRotation,
}

impl EventKind {
    pub fn from_info_type(info_type: &str) -> Option<Self> {
        match info_type {
            "authorized" => Some(EventKind::Authorized),
            "updateauthorized" => Some(EventKind::UpdateAuthorized),
            "unauthorized" => Some(EventKind::Unauthorized),
            "component_verify_ticket" | "verify_ticket_refresh" => {
                Some(EventKind::VerifyTicketRefresh)
            }
            "key_rotation" => Some(EventKind::KeyRotation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Authorized => "authorized",
            EventKind::UpdateAuthorized => "updateauthorized",
            EventKind::Unauthorized => "unauthorized",
            EventKind::VerifyTicketRefresh => "component_verify_ticket",
            EventKind::KeyRotation => "key_rotation",
        }
    }
}

/// Grant carried by `authorized` and `updateauthorized` notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub tenant_id: String,
    pub authorization_code: String,
    pub code_expires_at: Option<i64>,
    pub pre_auth_code: Option<String>,
}

impl Grant {
    fn from_document(doc: &mut RawDocument) -> Result<Self> {
        Ok(Self {
            tenant_id: required(doc.authorizer_appid.take(), "AuthorizerAppid")?,
            authorization_code: required(doc.authorization_code.take(), "AuthorizationCode")?,
            code_expires_at: integer(
                doc.authorization_code_expired_time.take(),
                "AuthorizationCodeExpiredTime",
            )?,
            pre_auth_code: text(doc.pre_auth_code.take()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Authorized(Grant),
    UpdateAuthorized(Grant),
    Unauthorized { tenant_id: String },
    VerifyTicketRefresh { ticket: String },
    KeyRotation { encoding_aes_key: String, token: Option<String> },
    Other { info_type: String },
}

impl CallbackEvent {
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            CallbackEvent::Authorized(_) => Some(EventKind::Authorized),
            CallbackEvent::UpdateAuthorized(_) => Some(EventKind::UpdateAuthorized),
            CallbackEvent::Unauthorized { .. } => Some(EventKind::Unauthorized),
            CallbackEvent::VerifyTicketRefresh { .. } => Some(EventKind::VerifyTicketRefresh),
            CallbackEvent::KeyRotation { .. } => Some(EventKind::KeyRotation),
            CallbackEvent::Other { .. } => None,
        }
    }
}

/// A decoded, not yet validated, notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub origin_id: String,
    /// Unix seconds; 0 when the sender did not stamp the message.
    pub create_time: i64,
    pub info_type: String,
    pub event: CallbackEvent,
}

impl Notification {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut doc = parse_document(xml)?;
        let origin_id = text(doc.app_id.take()).unwrap_or_default();
        let create_time = integer(doc.create_time.take(), "CreateTime")?.unwrap_or(0);
        let info_type = required(doc.info_type.take(), "InfoType")?;

        let event = match EventKind::from_info_type(&info_type) {
            Some(EventKind::Authorized) => CallbackEvent::Authorized(Grant::from_document(&mut doc)?),
            Some(EventKind::UpdateAuthorized) => {
                CallbackEvent::UpdateAuthorized(Grant::from_document(&mut doc)?)
            }
            Some(EventKind::Unauthorized) => CallbackEvent::Unauthorized {
                tenant_id: required(doc.authorizer_appid, "AuthorizerAppid")?,
            },
            Some(EventKind::VerifyTicketRefresh) => CallbackEvent::VerifyTicketRefresh {
                ticket: required(doc.verify_ticket, "ComponentVerifyTicket")?,
            },
            Some(EventKind::KeyRotation) => CallbackEvent::KeyRotation {
                encoding_aes_key: required(doc.encoding_aes_key, "EncodingAESKey")?,
                token: text(doc.token),
            },
            None => CallbackEvent::Other {
                info_type: info_type.clone(),
            },
        };

        Ok(Self {
            origin_id,
            create_time,
            info_type,
            event,
        })
    }
}
