use std::fmt;

use chrono::{DateTime, Utc};
use logflow_core::{Value, ValueMap};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_REPOSITORY: &str = "default";

/// An action to run on every document matched by a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCommand {
    pub id: String,
    pub action: String,
    pub query: String,
    pub repository: String,
    pub username: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub params: ValueMap,
}

impl BulkCommand {
    /// Action, query and user are fixed, everything else can be chained.
    pub fn builder(
        action: impl Into<String>,
        query: impl Into<String>,
        username: impl Into<String>,
    ) -> BulkCommandBuilder {
        BulkCommandBuilder {
            action: action.into(),
            query: query.into(),
            username: username.into(),
            repository: DEFAULT_REPOSITORY.to_string(),
            params: ValueMap::new(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

impl fmt::Display for BulkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|(name, value)| format!("{name}={value:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "BulkCommand(id={}, action={}, query={}, repository={}, user={}, submitted={}, params={{{params}}})",
            self.id,
            self.action,
            self.query,
            self.repository,
            self.username,
            self.submitted_at.to_rfc3339(),
        )
    }
}

pub struct BulkCommandBuilder {
    action: String,
    query: String,
    username: String,
    repository: String,
    params: ValueMap,
}

impl BulkCommandBuilder {
    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Adds every parameter of `params`, replacing the ones already set.
    pub fn params(mut self, params: ValueMap) -> Self {
        self.params.extend(params);
        self
    }

    /// Assigns a fresh time ordered id and the submission time.
    pub fn build(self) -> BulkCommand {
        BulkCommand {
            id: Uuid::now_v7().to_string(),
            action: self.action,
            query: self.query,
            repository: self.repository,
            username: self.username,
            submitted_at: Utc::now(),
            params: self.params,
        }
    }
}
