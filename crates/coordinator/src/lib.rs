//! Turn coordinator for the relay multi-agent system.
//!
//! The coordinator handles one conversational turn at a time:
//! 1. Asks the routing LLM which backend agent should answer
//! 2. Dispatches the turn to that agent's gateway
//! 3. Relays the agent's streamed answer into the caller's output sink
//! 4. Returns the aggregated assistant message with its continuity state
//!
//! # Architecture
//!
//! ```text
//! Turn (history + new user message)
//!      │
//!      ▼
//! ┌─────────────────┐
//! │     Router      │  ◄── structured-output LLM call
//! └────────┬────────┘
//!          │ RoutingDecision
//!    ┌─────┴──────┐
//!    ▼            ▼
//! [UMS gateway] [GPA gateway]
//!  SSE chat      streamed chat + side channel
//!    │            │
//!    └─────┬──────┘
//!          ▼
//!   Output sink + assistant Message
//! ```

pub mod config;
pub mod continuity;
pub mod coordinator;
pub mod gateway;
pub mod gpa;
pub mod router;
pub mod routing;
pub mod stream;
pub mod ums;

pub use config::{CoordinatorConfig, RoutingLlmConfig, UmsConfig};
pub use coordinator::{Coordinator, TurnPhase};
pub use gateway::{augment_with_instructions, BackendGateway, Dispatch};
pub use gpa::GpaGateway;
pub use router::Router;
pub use routing::{AgentKind, RoutingDecision};
pub use stream::{StageDelta, StageStatus, StreamEvent, StreamMerger, TrackedStage};
pub use ums::UmsGateway;
