//! Interactive follow-up for commands that arrive without code.
//!
//! A command with code goes straight to the dispatcher. A command with only a
//! language opens a form; the language and trigger token ride along in the form's
//! private metadata, so the follow-up submission carries everything needed to
//! build the request and nothing is stored here in between.

use crate::command::{strip_fence, ParsedCommand};
use crate::error::{DispatchFailure, ValidationError};
use crate::registry::{LanguageRegistry, LanguageRuntime};
use crate::types::ExecutionRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

pub const CODE_BLOCK_ID: &str = "main_code_block";
pub const CODE_ACTION_ID: &str = "code_input";
pub const CHANNEL_BLOCK_ID: &str = "response_block";
pub const CHANNEL_ACTION_ID: &str = "conversation_select_action";

/// Fields of a slash command after signature verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundCommand {
    pub raw_text: String,
    pub callback_url: String,
    pub trigger_token: String,
    pub user_id: String,
}

/// State for one pending form round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModalSession {
    pub trigger_token: String,
    pub language_key: String,
    pub placeholder_snippet: String,
}

#[derive(Serialize, Deserialize)]
struct FormState {
    trigger_token: String,
    language_key: String,
}

impl ModalSession {
    /// Opaque state handed to the form system and returned with the submission.
    pub fn private_metadata(&self) -> String {
        let state = FormState {
            trigger_token: self.trigger_token.clone(),
            language_key: self.language_key.clone(),
        };
        // Two string fields always serialize.
        serde_json::to_string(&state).unwrap_or_default()
    }

    pub fn view(&self, runtime: &LanguageRuntime) -> ModalView {
        ModalView {
            kind: "modal",
            title: PlainText::new("RESL"),
            submit: PlainText::new("Run Code"),
            close: PlainText::new("Cancel"),
            private_metadata: self.private_metadata(),
            blocks: vec![
                Block {
                    block_id: CODE_BLOCK_ID,
                    kind: "input",
                    optional: false,
                    label: PlainText::new(format!("Enter {} here", runtime.display_name)),
                    hint: Some(PlainText::new("Wrapping your code in backticks is optional")),
                    element: Element {
                        kind: "plain_text_input",
                        action_id: CODE_ACTION_ID,
                        multiline: true,
                        placeholder: Some(PlainText::new(self.placeholder_snippet.clone())),
                        default_to_current_conversation: false,
                        response_url_enabled: false,
                    },
                },
                Block {
                    block_id: CHANNEL_BLOCK_ID,
                    kind: "input",
                    optional: true,
                    label: PlainText::new("Select a channel to post the result in"),
                    hint: None,
                    element: Element {
                        kind: "conversations_select",
                        action_id: CHANNEL_ACTION_ID,
                        multiline: false,
                        placeholder: None,
                        default_to_current_conversation: true,
                        response_url_enabled: true,
                    },
                },
            ],
        }
    }
}

/// What intake should do with a parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    Direct(ExecutionRequest),
    AwaitingInput(ModalSession),
}

/// Decides between running now and asking for code.
pub fn coordinate(
    parsed: ParsedCommand,
    inbound: &InboundCommand,
    registry: &LanguageRegistry,
) -> Result<Intake, ValidationError> {
    let ParsedCommand { language_key, code } = parsed;
    let runtime = registry
        .get(&language_key)
        .ok_or_else(|| ValidationError::UnsupportedLanguage(language_key.clone()))?;

    if code.is_empty() {
        debug!(language = %language_key, "No code given, opening form");
        return Ok(Intake::AwaitingInput(ModalSession {
            trigger_token: inbound.trigger_token.clone(),
            language_key,
            placeholder_snippet: runtime.placeholder_snippet.clone(),
        }));
    }

    if inbound.callback_url.is_empty() {
        return Err(ValidationError::NoCallbackTarget);
    }

    Ok(Intake::Direct(ExecutionRequest {
        language_key,
        code,
        callback_url: inbound.callback_url.clone(),
        user_id: inbound.user_id.clone(),
        is_modal_round_trip: false,
    }))
}

// Follow-up submission payload. Only the fields read here are modelled.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewSubmission {
    #[serde(default)]
    pub user: Option<SubmissionUser>,
    #[serde(default)]
    pub view: SubmittedView,
    #[serde(default)]
    pub response_urls: Vec<ResponseUrl>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionUser {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmittedView {
    #[serde(default)]
    pub private_metadata: String,
    #[serde(default)]
    pub state: ViewState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewState {
    #[serde(default)]
    pub values: HashMap<String, HashMap<String, ElementValue>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElementValue {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub selected_conversation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseUrl {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub response_url: String,
}

impl ViewSubmission {
    fn element(&self, block_id: &str, action_id: &str) -> Option<&ElementValue> {
        let block = self.view.state.values.get(block_id)?;
        block.get(action_id).or_else(|| block.values().next())
    }

    fn form_state(&self) -> FormState {
        // Older forms carried the bare language key as metadata.
        serde_json::from_str(&self.view.private_metadata).unwrap_or_else(|_| FormState {
            trigger_token: String::new(),
            language_key: self.view.private_metadata.trim().to_string(),
        })
    }

    /// The channel override wins when its response URL was provided; otherwise the
    /// first response URL is used.
    fn callback_target(&self) -> Option<&str> {
        let selected = self
            .element(CHANNEL_BLOCK_ID, CHANNEL_ACTION_ID)
            .and_then(|e| e.selected_conversation.as_deref());
        let usable = || self.response_urls.iter().filter(|r| !r.response_url.is_empty());
        selected
            .and_then(|channel| usable().find(|r| r.channel_id == channel))
            .or_else(|| usable().next())
            .map(|r| r.response_url.as_str())
    }
}

/// Builds the request for a submitted form, skipping free-text parsing.
pub fn resume(
    submission: &ViewSubmission,
    registry: &LanguageRegistry,
) -> Result<ExecutionRequest, ValidationError> {
    let state = submission.form_state();
    if registry.get(&state.language_key).is_none() {
        return Err(ValidationError::UnsupportedLanguage(state.language_key));
    }

    let code = submission
        .element(CODE_BLOCK_ID, CODE_ACTION_ID)
        .and_then(|e| e.value.as_deref())
        .map(strip_fence)
        .unwrap_or_default();
    if code.trim().is_empty() {
        return Err(ValidationError::EmptyModalSubmission);
    }

    let callback_url = submission
        .callback_target()
        .ok_or(ValidationError::NoCallbackTarget)?;

    info!(
        language = %state.language_key,
        trigger = %state.trigger_token,
        "Form submission accepted"
    );
    Ok(ExecutionRequest {
        language_key: state.language_key,
        code: code.to_string(),
        callback_url: callback_url.to_string(),
        user_id: submission.user.as_ref().map(|u| u.id.clone()).unwrap_or_default(),
        is_modal_round_trip: true,
    })
}

// Form definition sent to the platform. Only its data shape matters here.

#[derive(Debug, Clone, Serialize)]
pub struct ModalView {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: PlainText,
    pub submit: PlainText,
    pub close: PlainText,
    pub private_metadata: String,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlainText {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl PlainText {
    fn new(text: impl Into<String>) -> Self {
        Self {
            kind: "plain_text",
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub block_id: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    pub label: PlainText,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<PlainText>,
    pub element: Element,
}

#[derive(Debug, Clone, Serialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub action_id: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub multiline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<PlainText>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default_to_current_conversation: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub response_url_enabled: bool,
}

/// Opens the input form on the chat platform.
#[async_trait]
pub trait FormOpener: Send + Sync {
    async fn open(
        &self,
        session: &ModalSession,
        runtime: &LanguageRuntime,
    ) -> Result<(), DispatchFailure>;
}

const FORMS_TARGET: &str = "form endpoint";

/// Posts forms to a `views.open` style endpoint with a bearer token.
pub struct HttpForms {
    client: reqwest::Client,
    endpoint: String,
    bot_token: Option<String>,
}

impl HttpForms {
    pub fn new(client: reqwest::Client, endpoint: String, bot_token: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            bot_token,
        }
    }
}

#[derive(Deserialize)]
struct PlatformReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl FormOpener for HttpForms {
    async fn open(
        &self,
        session: &ModalSession,
        runtime: &LanguageRuntime,
    ) -> Result<(), DispatchFailure> {
        let token = self.bot_token.as_deref().ok_or_else(|| DispatchFailure::Unreachable {
            target: FORMS_TARGET.to_string(),
            reason: "no bot token configured".to_string(),
        })?;

        let body = serde_json::json!({
            "trigger_id": session.trigger_token,
            "view": session.view(runtime),
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchFailure::Unreachable {
                target: FORMS_TARGET.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchFailure::Rejected {
                target: FORMS_TARGET.to_string(),
                reason: status.to_string(),
            });
        }
        let reply: PlatformReply = response.json().await.map_err(|e| DispatchFailure::Rejected {
            target: FORMS_TARGET.to_string(),
            reason: e.to_string(),
        })?;
        if !reply.ok {
            return Err(DispatchFailure::Rejected {
                target: FORMS_TARGET.to_string(),
                reason: reply.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(())
    }
}
