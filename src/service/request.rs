//! Capability table: typed requests parsed from `(method, payload)`.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};

use super::manifest::VersionDescriptor;

/// Errors turning an envelope into a typed request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    #[error("Invalid arguments for '{method}': {message}")]
    InvalidArguments { method: Method, message: String },
}

/// Every operation the worker exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Predict,
    Train,
    Deploy,
    EnabledVersion,
    AvailableVersions,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Predict,
        Method::Train,
        Method::Deploy,
        Method::EnabledVersion,
        Method::AvailableVersions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Predict => "predict",
            Method::Train => "train",
            Method::Deploy => "deploy",
            Method::EnabledVersion => "enabled_version",
            Method::AvailableVersions => "available_versions",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call on the worker's capability set.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Run inference on one input.
    Predict { input: Value },
    /// Train on labelled items, producing a new available version.
    Train { input: Vec<Value> },
    /// Enable a previously trained version.
    Deploy { version: String },
    EnabledVersion,
    AvailableVersions,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InputArgs<T> {
    input: T,
}

/// `version` may be a bare id or a descriptor carrying one.
#[derive(Deserialize)]
#[serde(untagged)]
enum VersionArg {
    Id(String),
    Descriptor(VersionDescriptor),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DeployArgs {
    version: VersionArg,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

fn parse_args<T: DeserializeOwned>(
    method: Method,
    payload: Map<String, Value>,
) -> Result<T, RequestError> {
    serde_json::from_value(Value::Object(payload)).map_err(|e| RequestError::InvalidArguments {
        method,
        message: e.to_string(),
    })
}

impl Request {
    /// Look up `method` and validate `payload` against its signature.
    pub fn parse(method: &str, payload: Map<String, Value>) -> Result<Self, RequestError> {
        let method = Method::from_name(method)
            .ok_or_else(|| RequestError::UnknownMethod(method.to_string()))?;

        let request = match method {
            Method::Predict => {
                let args: InputArgs<Value> = parse_args(method, payload)?;
                Request::Predict { input: args.input }
            }
            Method::Train => {
                let args: InputArgs<Vec<Value>> = parse_args(method, payload)?;
                Request::Train { input: args.input }
            }
            Method::Deploy => {
                let args: DeployArgs = parse_args(method, payload)?;
                let version = match args.version {
                    VersionArg::Id(id) => Some(id),
                    VersionArg::Descriptor(descriptor) => descriptor.version,
                };
                let version = version.ok_or_else(|| RequestError::InvalidArguments {
                    method,
                    message: "version id is required".to_string(),
                })?;
                Request::Deploy { version }
            }
            Method::EnabledVersion => {
                parse_args::<NoArgs>(method, payload)?;
                Request::EnabledVersion
            }
            Method::AvailableVersions => {
                parse_args::<NoArgs>(method, payload)?;
                Request::AvailableVersions
            }
        };

        Ok(request)
    }

    pub fn method(&self) -> Method {
        match self {
            Request::Predict { .. } => Method::Predict,
            Request::Train { .. } => Method::Train,
            Request::Deploy { .. } => Method::Deploy,
            Request::EnabledVersion => Method::EnabledVersion,
            Request::AvailableVersions => Method::AvailableVersions,
        }
    }

    /// Named arguments as they travel in the envelope payload.
    pub fn args(&self) -> Map<String, Value> {
        let args = match self {
            Request::Predict { input } => json!({ "input": input }),
            Request::Train { input } => json!({ "input": input }),
            Request::Deploy { version } => json!({ "version": VersionDescriptor::named(version.as_str()) }),
            Request::EnabledVersion | Request::AvailableVersions => json!({}),
        };

        match args {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
