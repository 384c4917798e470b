//! Stage-to-stage invocation.
//!
//! Stages talk through a [`Transport`], either in-process or over HTTP. The
//! payload is always the JSON encoding of an [`ExecutionRequest`], so the
//! receiving stage never depends on how it was reached.

use crate::error::DispatchFailure;
use crate::types::ExecutionRequest;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

pub const STAGE_TOKEN_HEADER: &str = "x-stage-token";
pub const INVOCATION_TYPE_HEADER: &str = "x-invocation-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Responder,
    Sandbox,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Responder => "responder",
            Stage::Sandbox => "sandbox",
        })
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "responder" => Ok(Stage::Responder),
            "sandbox" => Ok(Stage::Sandbox),
            other => Err(format!("unknown stage {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Returns once the target accepted the invocation.
    FireAndForget,
    /// Returns the target's reply.
    WaitForReply,
}

impl DispatchMode {
    fn invocation_type(self) -> &'static str {
        match self {
            DispatchMode::FireAndForget => "event",
            DispatchMode::WaitForReply => "request-response",
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands the payload over without waiting for the stage to finish.
    async fn invoke_async(&self, target: Stage, payload: Vec<u8>) -> Result<(), DispatchFailure>;

    /// Runs the stage to completion and returns its reply.
    async fn invoke_sync(&self, target: Stage, payload: Vec<u8>)
        -> Result<Vec<u8>, DispatchFailure>;
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Serializes `request` and hands it to `target`. Returns the reply for
    /// [`DispatchMode::WaitForReply`]. Failures are never retried here.
    pub async fn dispatch(
        &self,
        target: Stage,
        request: &ExecutionRequest,
        mode: DispatchMode,
    ) -> Result<Option<Vec<u8>>, DispatchFailure> {
        let payload =
            serde_json::to_vec(request).map_err(|e| DispatchFailure::Codec(e.to_string()))?;
        debug!(%target, ?mode, bytes = payload.len(), "Dispatching");

        let outcome = match mode {
            DispatchMode::FireAndForget => self
                .transport
                .invoke_async(target, payload)
                .await
                .map(|()| None),
            DispatchMode::WaitForReply => {
                self.transport.invoke_sync(target, payload).await.map(Some)
            }
        };
        if let Err(e) = &outcome {
            error!(%target, error = %e, "Dispatch failed");
        }
        outcome
    }

    pub async fn send(&self, target: Stage, request: &ExecutionRequest) -> Result<(), DispatchFailure> {
        self.dispatch(target, request, DispatchMode::FireAndForget)
            .await
            .map(|_| ())
    }

    /// Waits for `target` and decodes its reply as `R`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        target: Stage,
        request: &ExecutionRequest,
    ) -> Result<R, DispatchFailure> {
        let reply = self
            .dispatch(target, request, DispatchMode::WaitForReply)
            .await?
            .unwrap_or_default();
        serde_json::from_slice(&reply).map_err(|e| DispatchFailure::Codec(e.to_string()))
    }
}

/// Something that can run a stage given its encoded request.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, stage: Stage, payload: Vec<u8>) -> Result<Vec<u8>, DispatchFailure>;
}

/// Runs stages as tasks inside this process.
///
/// Holds a weak reference because the handler usually owns the dispatcher that
/// owns this transport.
pub struct LocalTransport {
    handler: Weak<dyn StageHandler>,
}

impl LocalTransport {
    pub fn new(handler: Weak<dyn StageHandler>) -> Self {
        Self { handler }
    }

    fn handler(&self, target: Stage) -> Result<Arc<dyn StageHandler>, DispatchFailure> {
        self.handler.upgrade().ok_or_else(|| DispatchFailure::Unreachable {
            target: target.to_string(),
            reason: "stage handler has shut down".to_string(),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn invoke_async(&self, target: Stage, payload: Vec<u8>) -> Result<(), DispatchFailure> {
        let handler = self.handler(target)?;
        tokio::spawn(async move {
            if let Err(e) = handler.handle(target, payload).await {
                warn!(%target, error = %e, "Background stage failed");
            }
        });
        Ok(())
    }

    async fn invoke_sync(
        &self,
        target: Stage,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, DispatchFailure> {
        self.handler(target)?.handle(target, payload).await
    }
}

/// Invokes stages deployed behind HTTP endpoints.
///
/// Fire-and-forget invocations expect `202 Accepted`; request-response ones
/// expect `200 OK` with the reply as the body.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: HashMap<Stage, String>,
    stage_token: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        endpoints: HashMap<Stage, String>,
        stage_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoints,
            stage_token,
            timeout,
        }
    }

    async fn post(
        &self,
        target: Stage,
        payload: Vec<u8>,
        mode: DispatchMode,
    ) -> Result<reqwest::Response, DispatchFailure> {
        let endpoint = self
            .endpoints
            .get(&target)
            .ok_or_else(|| DispatchFailure::Unreachable {
                target: target.to_string(),
                reason: "no endpoint configured".to_string(),
            })?;

        let mut request = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(INVOCATION_TYPE_HEADER, mode.invocation_type())
            .body(payload);
        if let Some(token) = &self.stage_token {
            request = request.header(STAGE_TOKEN_HEADER, token);
        }

        request.send().await.map_err(|e| DispatchFailure::Unreachable {
            target: target.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke_async(&self, target: Stage, payload: Vec<u8>) -> Result<(), DispatchFailure> {
        let response = self.post(target, payload, DispatchMode::FireAndForget).await?;
        match response.status() {
            reqwest::StatusCode::ACCEPTED | reqwest::StatusCode::OK => Ok(()),
            status => Err(DispatchFailure::Rejected {
                target: target.to_string(),
                reason: status.to_string(),
            }),
        }
    }

    async fn invoke_sync(
        &self,
        target: Stage,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, DispatchFailure> {
        let response = self.post(target, payload, DispatchMode::WaitForReply).await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(DispatchFailure::Rejected {
                target: target.to_string(),
                reason: status.to_string(),
            });
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| DispatchFailure::Unreachable {
                target: target.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            language_key: "sh".to_string(),
            code: "echo hi".to_string(),
            callback_url: "https://hooks.example/1".to_string(),
            user_id: String::new(),
            is_modal_round_trip: false,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Stage, ExecutionRequest)>>,
        done: Notify,
    }

    #[async_trait]
    impl StageHandler for Recorder {
        async fn handle(&self, stage: Stage, payload: Vec<u8>) -> Result<Vec<u8>, DispatchFailure> {
            let request: ExecutionRequest = serde_json::from_slice(&payload).unwrap();
            let reply = serde_json::to_vec(&request.code).unwrap();
            self.seen.lock().unwrap().push((stage, request));
            self.done.notify_one();
            Ok(reply)
        }
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in [Stage::Responder, Stage::Sandbox] {
            assert_eq!(stage.to_string().parse::<Stage>(), Ok(stage));
        }
        assert!("intake".parse::<Stage>().is_err());
    }

    #[tokio::test]
    async fn local_fire_and_forget_runs_in_background() {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn StageHandler> = recorder.clone();
        let dispatcher = Dispatcher::new(Arc::new(LocalTransport::new(Arc::downgrade(&handler))));

        let reply = dispatcher
            .dispatch(Stage::Responder, &request(), DispatchMode::FireAndForget)
            .await
            .unwrap();
        assert_eq!(reply, None);

        recorder.done.notified().await;
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(Stage::Responder, request())]);
    }

    #[tokio::test]
    async fn local_call_returns_decoded_reply() {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn StageHandler> = recorder.clone();
        let dispatcher = Dispatcher::new(Arc::new(LocalTransport::new(Arc::downgrade(&handler))));

        let code: String = dispatcher.call(Stage::Sandbox, &request()).await.unwrap();
        assert_eq!(code, "echo hi");
    }

    #[tokio::test]
    async fn dropped_handler_is_unreachable() {
        let handler: Arc<dyn StageHandler> = Arc::new(Recorder::default());
        let transport = LocalTransport::new(Arc::downgrade(&handler));
        drop(handler);
        let dispatcher = Dispatcher::new(Arc::new(transport));

        assert!(matches!(
            dispatcher.send(Stage::Responder, &request()).await,
            Err(DispatchFailure::Unreachable { .. })
        ));
    }

    fn http_transport(server: &mockito::Server, token: Option<&str>) -> HttpTransport {
        let endpoints = HashMap::from([
            (Stage::Responder, format!("{}/stages/responder", server.url())),
            (Stage::Sandbox, format!("{}/stages/sandbox", server.url())),
        ]);
        HttpTransport::new(
            reqwest::Client::new(),
            endpoints,
            token.map(str::to_string),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn http_fire_and_forget_sends_event_invocation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/stages/responder")
            .match_header(INVOCATION_TYPE_HEADER, "event")
            .match_header(STAGE_TOKEN_HEADER, "s3cret")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "language_key": "sh",
                "code": "echo hi"
            })))
            .with_status(202)
            .create_async()
            .await;

        let dispatcher = Dispatcher::new(Arc::new(http_transport(&server, Some("s3cret"))));
        dispatcher.send(Stage::Responder, &request()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_request_response_returns_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/stages/sandbox")
            .match_header(INVOCATION_TYPE_HEADER, "request-response")
            .with_status(200)
            .with_body(r#""done""#)
            .create_async()
            .await;

        let dispatcher = Dispatcher::new(Arc::new(http_transport(&server, None)));
        let reply: String = dispatcher.call(Stage::Sandbox, &request()).await.unwrap();
        assert_eq!(reply, "done");
    }

    #[tokio::test]
    async fn http_error_status_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/stages/sandbox")
            .with_status(500)
            .create_async()
            .await;

        let dispatcher = Dispatcher::new(Arc::new(http_transport(&server, None)));
        let outcome: Result<String, _> = dispatcher.call(Stage::Sandbox, &request()).await;
        assert!(matches!(outcome, Err(DispatchFailure::Rejected { .. })));
    }

    #[tokio::test]
    async fn http_missing_endpoint_is_unreachable() {
        let transport = HttpTransport::new(
            reqwest::Client::new(),
            HashMap::new(),
            None,
            Duration::from_secs(1),
        );
        let dispatcher = Dispatcher::new(Arc::new(transport));
        assert!(matches!(
            dispatcher.send(Stage::Sandbox, &request()).await,
            Err(DispatchFailure::Unreachable { .. })
        ));
    }
}
