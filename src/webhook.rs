//! Decoding of the intake webhook body.
//!
//! Slash commands arrive form-encoded (`text`, `response_url`, `trigger_id`,
//! `user_id`). Form submissions arrive as a `payload` field holding JSON. A JSON
//! body with the same fields is accepted too.

use crate::error::ValidationError;
use crate::modal::{InboundCommand, ViewSubmission};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum WebhookBody {
    Command(InboundCommand),
    Submission(ViewSubmission),
}

#[derive(Debug, Default, Deserialize)]
struct CommandFields {
    #[serde(default)]
    text: String,
    #[serde(default)]
    response_url: String,
    #[serde(default)]
    trigger_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl From<CommandFields> for InboundCommand {
    fn from(fields: CommandFields) -> Self {
        InboundCommand {
            raw_text: fields.text,
            callback_url: fields.response_url,
            trigger_token: fields.trigger_id,
            user_id: fields.user_id,
        }
    }
}

impl WebhookBody {
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Self, ValidationError> {
        let is_json = content_type
            .map(|ct| ct.trim_start().starts_with("application/json"))
            .unwrap_or(false);
        let fields = if is_json {
            serde_json::from_slice::<CommandFields>(body).map_err(malformed)?
        } else {
            parse_form(body)
        };

        match fields.payload {
            Some(payload) => submission(payload).map(WebhookBody::Submission),
            None => Ok(WebhookBody::Command(fields.into())),
        }
    }
}

fn parse_form(body: &[u8]) -> CommandFields {
    let mut fields = CommandFields::default();
    for (key, value) in url::form_urlencoded::parse(body) {
        match &*key {
            "text" => fields.text = value.into_owned(),
            "response_url" => fields.response_url = value.into_owned(),
            "trigger_id" => fields.trigger_id = value.into_owned(),
            "user_id" => fields.user_id = value.into_owned(),
            "payload" => fields.payload = Some(Value::String(value.into_owned())),
            _ => {}
        }
    }
    fields
}

/// The payload is either JSON text (form bodies) or an inline object.
fn submission(payload: Value) -> Result<ViewSubmission, ValidationError> {
    match payload {
        Value::String(raw) => serde_json::from_str(&raw).map_err(malformed),
        other => serde_json::from_value(other).map_err(malformed),
    }
}

fn malformed(e: serde_json::Error) -> ValidationError {
    ValidationError::MalformedRequest(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM: Option<&str> = Some("application/x-www-form-urlencoded");

    #[test]
    fn form_command() {
        let body = b"token=x&text=py+print%28%27hi%27%29&response_url=https%3A%2F%2Fhooks.example%2F1&trigger_id=T1&user_id=U1";
        match WebhookBody::parse(FORM, body).unwrap() {
            WebhookBody::Command(cmd) => assert_eq!(
                cmd,
                InboundCommand {
                    raw_text: "py print('hi')".to_string(),
                    callback_url: "https://hooks.example/1".to_string(),
                    trigger_token: "T1".to_string(),
                    user_id: "U1".to_string(),
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_content_type_is_treated_as_form() {
        assert!(matches!(
            WebhookBody::parse(None, b"text=sh").unwrap(),
            WebhookBody::Command(InboundCommand { raw_text, .. }) if raw_text == "sh"
        ));
    }

    #[test]
    fn form_payload_is_a_submission() {
        let payload = serde_json::json!({
            "type": "view_submission",
            "user": { "id": "U9" },
            "view": { "private_metadata": "sh", "state": { "values": {} } }
        })
        .to_string();
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("payload", &payload)
            .finish();
        match WebhookBody::parse(FORM, body.as_bytes()).unwrap() {
            WebhookBody::Submission(sub) => {
                assert_eq!(sub.view.private_metadata, "sh");
                assert_eq!(sub.user.unwrap().id, "U9");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn json_bodies_are_accepted() {
        let command = br#"{"text":"js 1","response_url":"https://hooks.example/2"}"#;
        assert!(matches!(
            WebhookBody::parse(Some("application/json; charset=utf-8"), command).unwrap(),
            WebhookBody::Command(InboundCommand { callback_url, .. }) if callback_url == "https://hooks.example/2"
        ));

        let inline = br#"{"payload":{"view":{"private_metadata":"py"}}}"#;
        assert!(matches!(
            WebhookBody::parse(Some("application/json"), inline).unwrap(),
            WebhookBody::Submission(sub) if sub.view.private_metadata == "py"
        ));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(matches!(
            WebhookBody::parse(FORM, b"payload=%7Bnot+json"),
            Err(ValidationError::MalformedRequest(_))
        ));
        assert!(matches!(
            WebhookBody::parse(Some("application/json"), b"[1,2"),
            Err(ValidationError::MalformedRequest(_))
        ));
    }
}
