/// Result alias that carries the custom [`LivetapError`] type.
pub type Result<T> = std::result::Result<T, LivetapError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LivetapError {
    /// The configuration cannot produce a usable pipeline. Raised synchronously
    /// by the topology builder; no partial pipeline is ever returned.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A node could not be built, typically because its type name did not
    /// resolve against the node registry.
    #[error("unable to construct node `{name}`: {reason}")]
    NodeConstruction { name: String, reason: String },
    /// A single frame could not be processed by a node. The frame is skipped
    /// and the node keeps running.
    #[error("node {node} failed to process frame: {message}")]
    Processing { node: String, message: String },
    /// The pipeline has been shut down and no longer accepts input.
    #[error("pipeline has been shut down")]
    Closed,
    /// Free form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration documents that fail to deserialize.
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

impl LivetapError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates a configuration error with the given diagnostic.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a node construction error for the node type `name`.
    pub fn node_construction(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NodeConstruction {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a processing error attributed to `node`.
    pub fn processing(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            node: node.into(),
            message: message.into(),
        }
    }
}

impl From<&str> for LivetapError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LivetapError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<realfft::FftError> for LivetapError {
    fn from(value: realfft::FftError) -> Self {
        Self::Message(format!("fft failed: {value}"))
    }
}
