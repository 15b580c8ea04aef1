use thiserror::Error;

/// Failures talking to a chat-completion endpoint.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0} is not set")]
    MissingApiKey(&'static str),
    #[error("chat endpoint unreachable: {0}")]
    Transport(String),
    #[error("{0}")]
    Api(String),
    #[error("malformed chat completion: {0}")]
    Malformed(String),
}

/// Failures of a single tool invocation. These are reported back to the
/// model as error tool messages and never abort a turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    Unknown(String),
    #[error("{tool} rejected its arguments: {reason}")]
    BadArguments { tool: String, reason: String },
    #[error("{tool} failed: {reason}")]
    Failed { tool: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("invalid agent setup: {0}")]
    Setup(String),
    #[error("no answer after {limit} model calls")]
    RecursionLimit { limit: u32 },
    #[error("turn ended without an answer")]
    NoAnswer,
}
