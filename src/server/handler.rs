use crate::common::data::{RecordedRequest, ResponseSpec};
use crate::common::http::HttpClient;
use crate::server::{
    handlers::{HandlerExecutor, HandlerOutcome, ProducedResponse},
    state::{self, StateManager},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot dispatch request: {0}")]
    DispatchError(String),
}

/// Turns a completed request into a response decision. The seam between
/// the HTTP front-end and the rule pipeline.
#[async_trait]
pub trait Handler {
    async fn handle(&self, req: Arc<RecordedRequest>) -> Result<HandlerOutcome, Error>;
}

/// The rule pipeline: walks the registry snapshot, records the request on
/// the winning rule, runs its handler.
pub struct RuleDispatchHandler<S>
where
    S: StateManager + Send + Sync + 'static,
{
    state: Arc<S>,
    executor: HandlerExecutor,
}

impl<S> RuleDispatchHandler<S>
where
    S: StateManager + Send + Sync + 'static,
{
    pub fn new(
        state: Arc<S>,
        http_client: Arc<dyn HttpClient + Send + Sync>,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            state,
            executor: HandlerExecutor::new(http_client, handler_timeout),
        }
    }
}

#[async_trait]
impl<S> Handler for RuleDispatchHandler<S>
where
    S: StateManager + Send + Sync + 'static,
{
    async fn handle(&self, req: Arc<RecordedRequest>) -> Result<HandlerOutcome, Error> {
        let snapshot = self.state.snapshot();

        match state::select_rule(&snapshot, &req).await {
            Some(selected) => Ok(self.executor.run(selected.handler, req).await),
            None => Ok(HandlerOutcome::Respond(ProducedResponse::Full(
                ResponseSpec::new(503)
                    .header("content-type", "text/plain")
                    .body(format!(
                        "mockproxy: no rule matched {} {}. Register a matching rule before \
                         exercising the endpoint.",
                        req.method(),
                        req.uri()
                    )),
            ))),
        }
    }
}
