use thiserror::Error;

/// Errors raised at the boundary with an upstream data source.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, timeout, or a body that could not be decoded.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    /// The upstream answered, but not in the shape we expect.
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("upstream returned no data")]
    Empty,
}

/// Why a single symbol dropped out of the batch.
#[derive(Debug, Error)]
pub enum SymbolFailure {
    #[error("price history is empty")]
    EmptyHistory,

    #[error("price history unavailable: {0}")]
    History(#[source] ProviderError),

    #[error("malformed price series: {0}")]
    MalformedSeries(String),
}

/// Reason a row of the institutional flow table was skipped.
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("row has no column {0}")]
    MissingColumn(usize),

    #[error("not a number: {0:?}")]
    BadNumber(String),
}
