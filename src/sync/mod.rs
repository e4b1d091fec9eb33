//! External task-sync adapter contract.
//!
//! The core never talks to GitHub, Linear, or any other provider directly;
//! it defines the adapter boundary and the shape of tasks crossing it.
//! Providers implement [`TaskSyncAdapter`] out of tree. The `dirty_elements`
//! table (see the storage layer) tells adapters what changed locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Task state on the provider side. Providers with richer state machines
/// fold them down to this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExternalTaskState {
    #[default]
    Open,
    Closed,
}

/// A task as seen by an external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTask {
    pub external_id: String,
    pub url: String,
    pub provider: String,
    pub project: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub state: ExternalTaskState,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    /// Local 1..=5 scale; each adapter maps provider-native values with
    /// round-trip fidelity for all five.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Provider-specific bag, passed through untouched.
    #[serde(default)]
    pub raw: Value,
}

/// Fields for creating an issue on the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExternalTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub state: ExternalTaskState,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Partial update; unset fields are left untouched on the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExternalTaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignees: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// Which way a field flows between the local store and the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
    Both,
}

/// One field-level mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub local_field: String,
    pub external_field: String,
    pub direction: SyncDirection,
}

/// A provider's field-mapping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapConfig {
    pub provider: String,
    pub fields: Vec<FieldMapping>,
}

/// Provider connection settings, passed opaquely to
/// [`TaskSyncAdapter::test_connection`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub extra: Value,
}

/// The adapter boundary. All methods are fallible and synchronous from the
/// engine's perspective; adapters own their transport.
pub trait TaskSyncAdapter {
    /// Fetch one issue by its provider id.
    ///
    /// # Errors
    ///
    /// Returns an adapter-defined storage error on transport failure.
    fn get_issue(&self, project: &str, external_id: &str) -> Result<Option<ExternalTask>>;

    /// Issues updated at or after the given instant.
    ///
    /// # Errors
    ///
    /// Returns an adapter-defined storage error on transport failure.
    fn list_issues_since(&self, project: &str, since: DateTime<Utc>)
    -> Result<Vec<ExternalTask>>;

    /// Create an issue on the provider.
    ///
    /// # Errors
    ///
    /// Returns an adapter-defined storage error on transport failure.
    fn create_issue(&self, project: &str, task: &NewExternalTask) -> Result<ExternalTask>;

    /// Apply a partial update on the provider.
    ///
    /// # Errors
    ///
    /// Returns an adapter-defined storage error on transport failure.
    fn update_issue(
        &self,
        project: &str,
        external_id: &str,
        patch: &ExternalTaskPatch,
    ) -> Result<ExternalTask>;

    /// The adapter's field-mapping rules.
    fn field_map_config(&self) -> FieldMapConfig;

    /// Whether the given configuration can reach the provider.
    ///
    /// # Errors
    ///
    /// Returns an adapter-defined storage error on transport failure.
    fn test_connection(&self, config: &AdapterConfig) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_task_round_trips_json() {
        let task = ExternalTask {
            external_id: "1234".to_string(),
            url: "https://example.test/issues/1234".to_string(),
            provider: "github".to_string(),
            project: "acme/widgets".to_string(),
            title: "Fix the frobnicator".to_string(),
            body: Some("details".to_string()),
            state: ExternalTaskState::Open,
            labels: vec!["bug".to_string()],
            assignees: vec!["alice".to_string()],
            priority: Some(2),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
            raw: serde_json::json!({"number": 1234}),
        };

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("externalId"));
        let back: ExternalTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn priority_scale_round_trips() {
        for p in 1..=5 {
            let patch = ExternalTaskPatch {
                priority: Some(p),
                ..ExternalTaskPatch::default()
            };
            let json = serde_json::to_string(&patch).unwrap();
            let back: ExternalTaskPatch = serde_json::from_str(&json).unwrap();
            assert_eq!(back.priority, Some(p));
        }
    }
}
