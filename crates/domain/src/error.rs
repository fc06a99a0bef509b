/// Shared error type used across all sidecar crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection: {0}")]
    Connection(String),

    #[error("agent process exited with code {exit_code}")]
    Process { exit_code: i64 },

    #[error("database: {0}")]
    Database(String),

    #[error("bus: {0}")]
    Bus(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind name surfaced in the `error` render event payload.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Connection(_) => "ConnectionError",
            Error::Process { .. } => "ProcessError",
            Error::Database(_) => "DatabaseError",
            Error::Bus(_) => "BusError",
            Error::Config(_) => "ConfigError",
            Error::Other(_) => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(Error::Connection("x".into()).kind_name(), "ConnectionError");
        assert_eq!(Error::Process { exit_code: 137 }.kind_name(), "ProcessError");
        assert_eq!(Error::Other("x".into()).kind_name(), "Error");
    }
}
