// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Factory configuration.

use mats_serial::{Channel, KeepTrace, MessagingModel};

use crate::broker::{Destination, DestinationKind};

/// Header name under which the trace id is mirrored onto every broker
/// message, for broker-side tooling.
pub const TRACE_ID_HEADER: &str = "traceId";

/// Factory-wide configuration.
///
/// Two factories configured with different `destination_prefix` or
/// `trace_key` values cannot communicate; do not change those unless you
/// have a compelling reason to.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Factory identity, for logging. Default: `""`.
    pub name: String,
    /// Prefix applied to channel ids to form queue and topic names in the
    /// underlying broker. Default: `"mats."`.
    pub destination_prefix: String,
    /// Key under which the serialized envelope is stored in the message
    /// body map. Default: `"mats:trace"`.
    pub trace_key: String,
    /// Name of the application employing the runtime; surfaced in
    /// envelopes and logs.
    pub app_name: String,
    /// Version string of the application; surfaced in envelopes and logs.
    pub app_version: String,
    /// Node-specific identifier, by default the hostname.
    pub nodename: String,
    /// Default number of consumer slots per stage. Subscription terminators
    /// are always pinned to 1.
    pub concurrency: usize,
    /// Default history-retention mode for initiations that do not specify
    /// one.
    pub default_keep_trace: KeepTrace,
}

impl FactoryConfig {
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            destination_prefix: "mats.".to_string(),
            trace_key: "mats:trace".to_string(),
            app_name: app_name.into(),
            app_version: app_version.into(),
            nodename: default_nodename(),
            concurrency: default_concurrency(),
            default_keep_trace: KeepTrace::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `MATS_APP_NAME`
    ///
    /// Optional (with defaults):
    /// - `MATS_APP_VERSION` (default `""`)
    /// - `MATS_NAME` (default `""`)
    /// - `MATS_DESTINATION_PREFIX` (default `"mats."`)
    /// - `MATS_TRACE_KEY` (default `"mats:trace"`)
    /// - `MATS_NODENAME` (default: hostname)
    /// - `MATS_CONCURRENCY` (default: available parallelism)
    pub fn from_env() -> Result<Self, ConfigError> {
        let app_name =
            std::env::var("MATS_APP_NAME").map_err(|_| ConfigError::Missing("MATS_APP_NAME"))?;
        let app_version = std::env::var("MATS_APP_VERSION").unwrap_or_default();

        let mut config = Self::new(app_name, app_version);
        if let Ok(name) = std::env::var("MATS_NAME") {
            config.name = name;
        }
        if let Ok(prefix) = std::env::var("MATS_DESTINATION_PREFIX") {
            config.destination_prefix = prefix;
        }
        if let Ok(key) = std::env::var("MATS_TRACE_KEY") {
            config.trace_key = key;
        }
        if let Ok(nodename) = std::env::var("MATS_NODENAME") {
            config.nodename = nodename;
        }
        if let Ok(concurrency) = std::env::var("MATS_CONCURRENCY") {
            config.concurrency = concurrency.parse().map_err(|_| {
                ConfigError::Invalid("MATS_CONCURRENCY", "must be a positive integer")
            })?;
            if config.concurrency == 0 {
                return Err(ConfigError::Invalid(
                    "MATS_CONCURRENCY",
                    "must be a positive integer",
                ));
            }
        }
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_destination_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.destination_prefix = prefix.into();
        self
    }

    pub fn with_trace_key(mut self, key: impl Into<String>) -> Self {
        self.trace_key = key.into();
        self
    }

    pub fn with_nodename(mut self, nodename: impl Into<String>) -> Self {
        self.nodename = nodename.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_default_keep_trace(mut self, keep_trace: KeepTrace) -> Self {
        self.default_keep_trace = keep_trace;
        self
    }

    /// Resolve a channel to its broker destination: `prefix + channel id`,
    /// queue or topic per the channel's messaging model.
    pub fn destination_for(&self, channel: &Channel) -> Destination {
        let name = format!("{}{}", self.destination_prefix, channel.id());
        let kind = match channel.model() {
            MessagingModel::Queue => DestinationKind::Queue,
            MessagingModel::Topic => DestinationKind::Topic,
        };
        Destination { name, kind }
    }

    /// Body key holding the serializer meta, next to the envelope.
    pub fn meta_key(&self) -> String {
        format!("{}{}", self.trace_key, mats_serial::META_KEY_POSTFIX)
    }

    /// Body key for a named binary side-channel payload.
    pub fn bytes_key(&self, key: &str) -> String {
        format!("{}:bytes:{}", self.trace_key, key)
    }

    /// Body key for a named string side-channel payload.
    pub fn string_key(&self, key: &str) -> String {
        format!("{}:string:{}", self.trace_key, key)
    }
}

fn default_nodename() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
