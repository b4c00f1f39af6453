#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed lookup response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}
