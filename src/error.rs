//! Error types for the RiverQ client library

/// Main error type for RiverQ client operations
#[derive(Debug, thiserror::Error)]
pub enum RiverqError {
    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Handshake/negotiation errors
    #[error("Negotiation error: {message}")]
    Negotiation { message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// No pooled connection could be obtained for a broker address
    #[error("No connection available for {address}")]
    NoConnection { address: String },

    /// Routing produced no candidate brokers for a topic
    #[error("No data nodes available for topic '{topic}'")]
    NoDataNodes { topic: String },

    /// The lookup service does not know the topic
    #[error("Topic '{topic}' not found")]
    TopicNotFound { topic: String },

    /// No lookup endpoints registered
    #[error("No lookup endpoints configured")]
    NoLookupEndpoints,

    /// Lookup query failed
    #[error("Lookup error: {message}")]
    Lookup { message: String },

    /// Malformed message body or message rejected as invalid
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Blank or rejected topic name
    #[error("Invalid topic name: '{topic}'")]
    InvalidTopic { topic: String },

    /// Tag or extended-header feature not supported by the target topic
    #[error("Feature '{feature}' not supported by topic '{topic}'")]
    UnsupportedFeature { topic: String, feature: String },

    /// Error frame returned by a broker
    #[error("Broker error {code}: {detail}")]
    Broker { code: String, detail: String },

    /// Broker abandoned during subscription setup
    #[error("Data node abandoned: {address}")]
    InvalidDataNode { address: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// All publish attempts exhausted; carries every per-attempt failure in order
    #[error("Publish to '{topic}' failed after {} attempts", attempts.len())]
    PublishFailed {
        topic: String,
        attempts: Vec<RiverqError>,
    },
}

impl RiverqError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new negotiation error
    pub fn negotiation<S: Into<String>>(message: S) -> Self {
        Self::Negotiation {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new lookup error
    pub fn lookup<S: Into<String>>(message: S) -> Self {
        Self::Lookup {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error represents a transport-level failure
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Io(_)
                | Self::Timeout { .. }
                | Self::NoConnection { .. }
        )
    }

    /// Lookup failures that must be surfaced immediately instead of retried
    pub fn is_terminal_lookup(&self) -> bool {
        matches!(self, Self::TopicNotFound { .. } | Self::NoLookupEndpoints)
    }
}

/// Classification of one publish attempt's failure, consumed by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishClass {
    /// Raise immediately, never retry
    Fatal,
    /// Invalidate the topic's routing, back off briefly, retry
    RoutingStale,
    /// Invalidate the pooled connection, retry with a fresh borrow
    Transport,
}

/// Broker-defined error codes carried in error frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCode {
    BadBody,
    BadTopic,
    BadMessage,
    FailedOnNotLeader,
    FailedOnNotWritable,
    TopicNotExist,
    ExtNotSupport,
    TagNotSupport,
    PubFailed,
    MpubFailed,
    Invalid,
    Unknown(String),
}

impl BrokerCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "E_BAD_BODY" => Self::BadBody,
            "E_BAD_TOPIC" => Self::BadTopic,
            "E_BAD_MESSAGE" => Self::BadMessage,
            "E_FAILED_ON_NOT_LEADER" => Self::FailedOnNotLeader,
            "E_FAILED_ON_NOT_WRITABLE" => Self::FailedOnNotWritable,
            "E_TOPIC_NOT_EXIST" => Self::TopicNotExist,
            "E_EXT_NOT_SUPPORT" => Self::ExtNotSupport,
            "E_TAG_NOT_SUPPORT" => Self::TagNotSupport,
            "E_PUB_FAILED" => Self::PubFailed,
            "E_MPUB_FAILED" => Self::MpubFailed,
            "E_INVALID" => Self::Invalid,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// How the publish engine reacts to this code. Not-leader, not-writable and
    /// topic-not-exist mean the cached routing is stale; the broker may still be
    /// perfectly healthy for other topics.
    pub fn classify_for_publish(&self) -> PublishClass {
        match self {
            Self::BadBody | Self::BadMessage | Self::BadTopic => PublishClass::Fatal,
            Self::ExtNotSupport | Self::TagNotSupport => PublishClass::Fatal,
            Self::FailedOnNotLeader | Self::FailedOnNotWritable | Self::TopicNotExist => {
                PublishClass::RoutingStale
            }
            Self::PubFailed | Self::MpubFailed => PublishClass::RoutingStale,
            Self::Invalid | Self::Unknown(_) => PublishClass::Transport,
        }
    }

    /// Whether a subscribe rejection with this code means the whole broker
    /// should be abandoned for the topic. Intentionally different from the
    /// publish classification above: a consumer that cannot SUB has nothing
    /// further to do with the node, while a producer only needs fresh routing.
    pub fn abandons_broker_on_subscribe(&self) -> bool {
        matches!(
            self,
            Self::FailedOnNotLeader | Self::FailedOnNotWritable | Self::TopicNotExist
        )
    }

    /// Convert a publish-path error frame into a client error
    pub fn to_publish_error(&self, topic: &str, detail: &str) -> RiverqError {
        match self {
            Self::BadBody => RiverqError::InvalidMessage {
                message: format!("malformed message body: {detail}"),
            },
            Self::BadMessage => RiverqError::InvalidMessage {
                message: detail.to_string(),
            },
            Self::BadTopic => RiverqError::InvalidTopic {
                topic: topic.to_string(),
            },
            Self::ExtNotSupport => RiverqError::UnsupportedFeature {
                topic: topic.to_string(),
                feature: "extended header".to_string(),
            },
            Self::TagNotSupport => RiverqError::UnsupportedFeature {
                topic: topic.to_string(),
                feature: "tag".to_string(),
            },
            _ => RiverqError::Broker {
                code: self.wire_name(),
                detail: detail.to_string(),
            },
        }
    }

    fn wire_name(&self) -> String {
        match self {
            Self::BadBody => "E_BAD_BODY".to_string(),
            Self::BadTopic => "E_BAD_TOPIC".to_string(),
            Self::BadMessage => "E_BAD_MESSAGE".to_string(),
            Self::FailedOnNotLeader => "E_FAILED_ON_NOT_LEADER".to_string(),
            Self::FailedOnNotWritable => "E_FAILED_ON_NOT_WRITABLE".to_string(),
            Self::TopicNotExist => "E_TOPIC_NOT_EXIST".to_string(),
            Self::ExtNotSupport => "E_EXT_NOT_SUPPORT".to_string(),
            Self::TagNotSupport => "E_TAG_NOT_SUPPORT".to_string(),
            Self::PubFailed => "E_PUB_FAILED".to_string(),
            Self::MpubFailed => "E_MPUB_FAILED".to_string(),
            Self::Invalid => "E_INVALID".to_string(),
            Self::Unknown(other) => other.clone(),
        }
    }
}
