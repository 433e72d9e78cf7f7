use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid digest `{0}`")]
    #[diagnostic(code(manifest::invalid_digest))]
    InvalidDigest(String),

    #[error("unknown digest algorithm `{0}`")]
    #[diagnostic(
        code(manifest::unknown_digest_alg),
        help("Supported algorithms are `sha256` and `sha512`.")
    )]
    UnknownDigestAlg(String),

    #[error("invalid artifact spec: {0}")]
    #[diagnostic(code(manifest::invalid_spec))]
    InvalidSpec(String),

    #[error("unsupported URL scheme `{scheme}` in `{url}`")]
    #[diagnostic(
        code(manifest::unsupported_scheme),
        help("Resources must use `http`, `https` or `file` URLs.")
    )]
    UnsupportedScheme { url: String, scheme: String },

    #[error("json error: {0}")]
    #[diagnostic(code(manifest::json_error))]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec(message.into())
    }
}
