//! CloudFormation template value.
//!
//! A [`StackTemplate`] is never mutated in place: retention changes produce a
//! new template, so the value fetched from the stack and the value pushed back
//! are always distinct.

use serde_json::{Map, Value};

use crate::constants::{LOG_GROUP_TYPE, RETAIN};
use crate::error::TemplateError;

const RESOURCES: &str = "Resources";
const TYPE: &str = "Type";
const DELETION_POLICY: &str = "DeletionPolicy";

/// Top-level template mapping, in document order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StackTemplate(Map<String, Value>);

impl StackTemplate {
    #[must_use]
    pub fn new(body: Map<String, Value>) -> Self {
        Self(body)
    }

    /// Parse a template body returned by the service (JSON, or YAML without
    /// short-form intrinsic tags).
    ///
    /// # Errors
    /// Returns [`TemplateError::Parse`] when the body is not a mapping.
    pub fn parse(body: &str) -> Result<Self, TemplateError> {
        let value: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(_) => serde_yaml::from_str(body).map_err(|e| TemplateError::Parse(e.to_string()))?,
        };
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(TemplateError::Parse(format!(
                "expected a mapping, found {other}"
            ))),
        }
    }

    /// Whether the template has no top-level keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Top-level mapping.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// `Resources` section, if present.
    #[must_use]
    pub fn resources(&self) -> Option<&Map<String, Value>> {
        self.0.get(RESOURCES).and_then(Value::as_object)
    }

    /// Deletion policy of a resource.
    #[must_use]
    pub fn deletion_policy(&self, key: &str) -> Option<&str> {
        self.resources()?
            .get(key)?
            .get(DELETION_POLICY)
            .and_then(Value::as_str)
    }

    /// Keys of log group resources not marked `Retain`, in template order.
    ///
    /// A missing `DeletionPolicy` counts as not retained.
    #[must_use]
    pub fn unretained_log_group_keys(&self) -> Vec<String> {
        let Some(resources) = self.resources() else {
            return Vec::new();
        };
        resources
            .iter()
            .filter(|(_, resource)| {
                resource.get(TYPE).and_then(Value::as_str) == Some(LOG_GROUP_TYPE)
                    && resource.get(DELETION_POLICY).and_then(Value::as_str) != Some(RETAIN)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys of every resource marked `Retain`, in template order.
    #[must_use]
    pub fn retained_keys(&self) -> Vec<String> {
        self.resources()
            .map(|resources| {
                resources
                    .iter()
                    .filter(|(_, r)| r.get(DELETION_POLICY).and_then(Value::as_str) == Some(RETAIN))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// New template with `DeletionPolicy: Retain` set on every given resource.
    ///
    /// # Errors
    /// Returns [`TemplateError::MissingKey`] naming `Resources` or the absent
    /// resource key, and [`TemplateError::InvalidResource`] for a resource
    /// that is not a mapping. `self` is left untouched either way.
    pub fn with_retained<I, S>(&self, keys: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut body = self.0.clone();
        let resources = body
            .get_mut(RESOURCES)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| TemplateError::MissingKey(RESOURCES.to_string()))?;

        for key in keys {
            let key = key.as_ref();
            let resource = resources
                .get_mut(key)
                .ok_or_else(|| TemplateError::MissingKey(key.to_string()))?
                .as_object_mut()
                .ok_or_else(|| TemplateError::InvalidResource(key.to_string()))?;
            resource.insert(DELETION_POLICY.to_string(), Value::String(RETAIN.to_string()));
        }

        Ok(Self(body))
    }

    /// New template where every resource retained in `previous` and still
    /// declared here keeps `DeletionPolicy: Retain`.
    #[must_use]
    pub fn inherit_retention(&self, previous: &StackTemplate) -> Self {
        let mut body = self.0.clone();
        let Some(resources) = body.get_mut(RESOURCES).and_then(Value::as_object_mut) else {
            return self.clone();
        };
        for key in previous.retained_keys() {
            if let Some(resource) = resources.get_mut(&key).and_then(Value::as_object_mut) {
                resource.insert(DELETION_POLICY.to_string(), Value::String(RETAIN.to_string()));
            }
        }
        Self(body)
    }

    /// Serialize for upload.
    ///
    /// # Errors
    /// Returns [`TemplateError::Parse`] if serialization fails.
    pub fn to_body(&self) -> Result<String, TemplateError> {
        serde_json::to_string(&self.0).map_err(|e| TemplateError::Parse(e.to_string()))
    }
}

impl From<Map<String, Value>> for StackTemplate {
    fn from(body: Map<String, Value>) -> Self {
        Self(body)
    }
}
