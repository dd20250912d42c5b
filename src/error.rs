use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown stream: ssrc {0}")]
    UnknownStream(u32),
    #[error("rtp queue is empty")]
    QueueEmpty,
    #[error("stream already registered: ssrc {0}")]
    DuplicateRegistration(u32),
    #[error("malformed feedback: {0}")]
    MalformedFeedback(String),
    #[error("no new packets to report")]
    NothingToReport,
    #[error("registry is full: capacity {capacity}")]
    RegistryFull { capacity: usize },
    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),
    #[error("invalid rtcp header")]
    InvalidHeader,
}
