//! Error types for the Local Storage Operator
//!
//! Provides structured error types for all operator components including
//! device discovery, inventory reconciliation, volume placement and orphan
//! cleanup.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource version conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Selector / Strategy Errors
    // =========================================================================
    #[error("Unsupported scheduler strategy: {strategy}")]
    UnsupportedStrategy { strategy: String },

    #[error("Invalid disk selector {selector}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    // =========================================================================
    // Placement Errors
    // =========================================================================
    #[error("No qualifying node: {reason}")]
    NoQualifyingNode { reason: String },

    #[error("No qualifying device: {reason}")]
    NoQualifyingDevice { reason: String },

    #[error("Device group {group} not found on node {node}")]
    DeviceGroupNotFound { node: String, group: String },

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("Command {tool} failed: {reason}")]
    CommandFailed { tool: String, reason: String },

    #[error("Device {device}: {source}")]
    Device {
        device: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    // =========================================================================
    // Notification Errors
    // =========================================================================
    #[error("Event queue closed")]
    EventQueueClosed,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap an error with the device it was raised for
    pub fn device(device: impl Into<String>, source: Error) -> Self {
        Error::Device {
            device: device.into(),
            source: Box::new(source),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } => ErrorAction::RequeueWithBackoff,

            // Nothing fits right now - capacity may free up
            Error::NoQualifyingNode { .. }
            | Error::NoQualifyingDevice { .. }
            | Error::DeviceGroupNotFound { .. }
            | Error::NodeNotFound { .. }
            | Error::ResourceNotFound { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration errors - don't retry automatically
            Error::Configuration(_)
            | Error::UnsupportedStrategy { .. }
            | Error::InvalidSelector { .. }
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // Wrapped device errors follow their cause
            Error::Device { source, .. } => source.action(),

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(_) | Error::Conflict { .. } | Error::CommandFailed { .. } => true,
            Error::Device { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Check if this is a placement or lookup miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NoQualifyingNode { .. }
                | Error::NoQualifyingDevice { .. }
                | Error::DeviceGroupNotFound { .. }
                | Error::NodeNotFound { .. }
                | Error::ResourceNotFound { .. }
                | Error::DeviceNotFound { .. }
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
