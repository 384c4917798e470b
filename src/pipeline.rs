//! The responder and sandbox stages behind a single [`StageHandler`].

use crate::dispatch::{Dispatcher, LocalTransport, Stage, StageHandler, Transport};
use crate::error::DispatchFailure;
use crate::responder::{Outcome, Responder};
use crate::sandbox::Sandbox;
use crate::types::{ExecutionRequest, SandboxReply};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{error, warn};

pub struct Stages {
    sandbox: Sandbox,
    responder: Responder,
    dispatcher: Dispatcher,
}

impl Stages {
    /// All stages run as tasks in this process.
    pub fn in_process(sandbox: Sandbox, responder: Responder) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Stages>| {
            let handler: Weak<dyn StageHandler> = this.clone();
            Stages {
                sandbox,
                responder,
                dispatcher: Dispatcher::new(Arc::new(LocalTransport::new(handler))),
            }
        })
    }

    /// Stages are reached through `transport`, typically deployed elsewhere.
    pub fn with_transport(
        sandbox: Sandbox,
        responder: Responder,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Stages {
            sandbox,
            responder,
            dispatcher: Dispatcher::new(transport),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Gets the result from the sandbox stage and posts it. Whatever happens, the
    /// callback URL receives exactly one message.
    pub async fn run_responder(&self, request: ExecutionRequest) {
        let outcome = match self
            .dispatcher
            .call::<SandboxReply>(Stage::Sandbox, &request)
            .await
        {
            Ok(SandboxReply::Completed { result }) => Outcome::Output(result),
            Ok(SandboxReply::Failed { error }) => {
                warn!(language = %request.language_key, %error, "Sandbox could not run the code");
                Outcome::Failure
            }
            Err(e) => {
                error!(language = %request.language_key, error = %e, "Sandbox stage unavailable");
                Outcome::Failure
            }
        };
        self.responder.respond(&request, outcome).await;
    }

    pub async fn run_sandbox(&self, request: &ExecutionRequest) -> SandboxReply {
        self.sandbox
            .execute(&request.language_key, &request.code)
            .await
            .into()
    }
}

fn codec(e: serde_json::Error) -> DispatchFailure {
    DispatchFailure::Codec(e.to_string())
}

#[async_trait]
impl StageHandler for Stages {
    async fn handle(&self, stage: Stage, payload: Vec<u8>) -> Result<Vec<u8>, DispatchFailure> {
        let request: ExecutionRequest = serde_json::from_slice(&payload).map_err(codec)?;
        match stage {
            Stage::Responder => {
                self.run_responder(request).await;
                Ok(Vec::new())
            }
            Stage::Sandbox => serde_json::to_vec(&self.run_sandbox(&request).await).map_err(codec),
        }
    }
}
