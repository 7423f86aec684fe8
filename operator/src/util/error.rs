#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    /// Malformed schedule spec: bad time, unknown day, unknown timezone.
    /// Never retried automatically.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Failed to parse cron expression: {source}")]
    Cron {
        #[from]
        source: cron::error::Error,
    },

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },
}
