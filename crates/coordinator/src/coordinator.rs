//! Turn coordination: route, dispatch, aggregate.

use std::fmt;
use std::sync::Arc;

use relay_common::{Credential, Message, Output, OutputSink, RelayError, Result, Turn};
use relay_llm::{build_dial_client, LlmClient};
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::gateway::{BackendGateway, Dispatch};
use crate::gpa::{GpaGateway, API_KEY_HEADER};
use crate::router::Router;
use crate::routing::AgentKind;
use crate::ums::UmsGateway;

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Routing,
    Dispatching(AgentKind),
    Aggregating,
    Done,
    Failed,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Routing => f.write_str("routing"),
            Self::Dispatching(kind) => write!(f, "dispatching({kind})"),
            Self::Aggregating => f.write_str("aggregating"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// The coordinator that answers one turn with exactly one backend agent.
///
/// Holds no per-conversation state. Everything needed to resume a backend
/// travels in the messages the caller sends back.
pub struct Coordinator {
    config: CoordinatorConfig,
    router: Router,
    gpa_llm: Arc<dyn LlmClient>,
    http_client: reqwest::Client,
}

impl Coordinator {
    /// Create a coordinator talking to the endpoints in `config`.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        info!(
            routing_endpoint = %config.llm.endpoint,
            routing_deployment = %config.llm.deployment,
            ums = %config.ums.endpoint,
            gpa = %config.gpa.endpoint,
            "Initializing relay coordinator"
        );

        let router_llm = build_dial_client(&config.llm.dial())?;
        let gpa_llm = build_dial_client(&config.gpa)?;
        Ok(Self::with_clients(config, router_llm, gpa_llm))
    }

    /// Create a coordinator with caller-supplied LLM clients.
    pub fn with_clients(
        config: CoordinatorConfig,
        router_llm: Arc<dyn LlmClient>,
        gpa_llm: Arc<dyn LlmClient>,
    ) -> Self {
        let router = Router::new(router_llm, config.llm.credential());
        Self {
            config,
            router,
            gpa_llm,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Fresh gateway for one turn.
    fn gateway(&self, kind: AgentKind) -> Box<dyn BackendGateway> {
        match kind {
            AgentKind::Ums => Box::new(UmsGateway::new(&self.config.ums, self.http_client.clone())),
            AgentKind::Gpa => Box::new(GpaGateway::new(self.gpa_llm.clone())),
        }
    }

    /// Credential handed to the chosen gateway: the caller's `Api-Key` for
    /// the general-purpose agent, falling back to the internal one. The UMS
    /// agent takes none.
    fn gateway_credential(&self, kind: AgentKind, turn: &Turn) -> Option<Credential> {
        match kind {
            AgentKind::Ums => None,
            AgentKind::Gpa => Some(
                turn.header(API_KEY_HEADER)
                    .filter(|k| !k.trim().is_empty())
                    .map(Credential::from)
                    .unwrap_or_else(|| self.config.llm.credential()),
            ),
        }
    }

    /// Answer one turn.
    ///
    /// Content is streamed into `sink` as it arrives; the returned message
    /// echoes it together with the continuity state for the next turn. On
    /// error the partial output already written stays in the sink and every
    /// section opened here has been closed.
    pub async fn handle_turn(&self, turn: &Turn, sink: &dyn OutputSink) -> Result<Message> {
        let output = Output::new(sink);
        let mut phase = TurnPhase::Routing;
        debug!(%phase, messages = turn.messages().len(), "Turn started");

        let decision = match self.router.classify(turn, output).await {
            Ok(decision) => decision,
            Err(e) => return Err(fail(phase, e)),
        };

        let kind = decision.agent_kind;
        phase = TurnPhase::Dispatching(kind);
        debug!(%phase, "Dispatching turn");

        let gateway = self.gateway(kind);
        let credential = self.gateway_credential(kind, turn);
        let dispatch = Dispatch::new(turn)
            .with_instructions(decision.instructions())
            .with_credential(credential.as_ref());

        let stage = output.stage(&kind.stage_name());
        let result = gateway.respond(dispatch, output).await;
        stage.close();

        let message = match result {
            Ok(message) => message,
            Err(e) => return Err(fail(phase, e)),
        };

        phase = TurnPhase::Aggregating;
        if is_empty_answer(&message) {
            warn!(%phase, agent = %kind, "Agent returned an empty answer");
        }

        phase = TurnPhase::Done;
        info!(
            %phase,
            agent = %kind,
            len = message.content.len(),
            has_state = message.state().is_some(),
            "Turn completed"
        );

        Ok(message)
    }
}

/// No text and no side channel: nothing reached the caller.
fn is_empty_answer(message: &Message) -> bool {
    message.content.trim().is_empty()
        && message
            .custom_content
            .as_ref()
            .map_or(true, |c| c.attachments.is_empty() && c.state.is_none())
}

fn fail(phase: TurnPhase, err: RelayError) -> RelayError {
    error!(%phase, code = err.code(), error = %err, "Turn failed");
    debug!(phase = %TurnPhase::Failed, "Turn ended");
    err
}
