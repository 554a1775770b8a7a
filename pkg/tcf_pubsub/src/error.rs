use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection string must be of the form <scheme>://host:port[?k=v&...]")]
    BadConnectionString,

    #[error("codec error: {0}")]
    Codec(#[from] tcf_codec::CodecError),

    #[error("filter \"{0}\" is already broadcasting, stop it first")]
    AlreadyBroadcasting(String),

    #[error("filter \"{0}\" is not broadcasting")]
    NotBroadcasting(String),

    #[error("connection closed")]
    Closed,
}
