//! Posts results back to the chat callback URL.

use crate::types::{ExecutionRequest, ExecutionResult};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

pub const NO_OUTPUT: &str = "[No output]";
pub const FAILURE_MESSAGE: &str = "Sorry! Unable to setup execution environment :(";

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("callback request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("callback endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_type: Option<&'static str>,
    pub text: String,
}

#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(&self, url: &str, message: &CallbackMessage) -> Result<(), DeliveryError>;
}

pub struct HttpCallback {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCallback {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl CallbackSink for HttpCallback {
    async fn deliver(&self, url: &str, message: &CallbackMessage) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(message)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status));
        }
        Ok(())
    }
}

/// What the responder has to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Output(ExecutionResult),
    Failure,
}

pub struct Responder {
    sink: Box<dyn CallbackSink>,
}

impl Responder {
    pub fn new(sink: Box<dyn CallbackSink>) -> Self {
        Self { sink }
    }

    /// Delivers once, best effort. Delivery errors are logged and dropped since
    /// there is nobody left to tell.
    pub async fn respond(&self, request: &ExecutionRequest, outcome: Outcome) {
        let message = render(request, &outcome);
        match self.sink.deliver(&request.callback_url, &message).await {
            Ok(()) => info!(
                language = %request.language_key,
                modal = request.is_modal_round_trip,
                "Result delivered"
            ),
            Err(e) => error!(
                url = %request.callback_url,
                error = %e,
                "Failed to deliver result"
            ),
        }
    }

    pub async fn report_failure(&self, request: &ExecutionRequest) {
        self.respond(request, Outcome::Failure).await;
    }
}

/// Builds the callback message for an outcome.
pub fn render(request: &ExecutionRequest, outcome: &Outcome) -> CallbackMessage {
    let text = match outcome {
        Outcome::Failure => FAILURE_MESSAGE.to_string(),
        Outcome::Output(result) => {
            let output = result.rendered_output();
            let output = if output.is_empty() { NO_OUTPUT } else { output.as_str() };
            if request.is_modal_round_trip {
                format!(
                    "<@{}>\n{}\n{}",
                    request.user_id,
                    fenced(&request.code),
                    fenced(output)
                )
            } else {
                fenced(output)
            }
        }
    };
    CallbackMessage {
        response_type: Some("in_channel"),
        text,
    }
}

/// Wraps text in a triple-backtick block. Backticks inside are escaped so the
/// block cannot be closed early.
pub fn fenced(text: &str) -> String {
    format!("```{}```", text.replace('`', "\\`"))
}
