use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected status {status} from {context}: {body}")]
    UnexpectedStatus {
        context: String,
        status: u16,
        body: String,
    },

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("unknown app: {0}")]
    UnknownApp(String),

    #[error("relay cancelled")]
    RelayCancelled,

    #[error("relay failed: {0}")]
    RelayFailed(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("package error: {0}")]
    Package(String),

    #[error("invalid archive entry: {0}")]
    ArchiveEntry(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("body too large: {0} bytes (max {1})")]
    BodyTooLarge(usize, usize),
}

pub type Result<T> = std::result::Result<T, FaasError>;
