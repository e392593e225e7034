//! Crate-local errors for the inbound-message pipeline.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No binding in the cascade resolved an agent for this message.
    #[error("could not resolve an agent for this message: {0}")]
    Routing(#[from] moltis_routing::Error),

    /// The agent's configured model has no matching registered provider.
    #[error("no provider available for agent '{agent_id}' (model: {model})")]
    NoProvider { agent_id: String, model: String },

    /// Reading or writing the session transcript failed.
    #[error("session store error: {0}")]
    Session(String),

    /// The agent loop itself failed (provider error, exhausted retries, etc).
    #[error("agent run failed: {0}")]
    AgentRun(String),

    /// Sending a reply chunk to the channel's outbound adapter failed.
    #[error("delivery failed ({context}): {message}")]
    Delivery { context: String, message: String },
}
