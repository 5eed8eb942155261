// [[ASSEMBLY]]/libs/assembly-core/src/lib.rs
// Purpose: Shared vocabulary for the orchestrator and the stage agents.
// Architecture: Domain Library
// Dependencies: serde, chrono, reqwest, tracing

pub mod catalog;
pub mod protocol;
pub mod reservoir;
pub mod telemetry;
pub mod tokens;

pub use catalog::{AgentDescriptor, AgentType, CatalogError, ProcessingStage, PIPELINE_ORDER};
pub use protocol::{BookOutcome, HealthReport, ProcessRequest, ProcessResponse, ResetTokensResponse};
pub use reservoir::{PostgrestReservoir, Reservoir, ReservoirBook, ReservoirError, ReservoirInit};
pub use tokens::{TokenTracker, TokenUsage, AGENT_TOKEN_LIMIT, ORCHESTRATOR_TOKEN_LIMIT};
