//! Credential resolution over the user's department tree.
//!
//! A user belongs to one or more departments; each department may have
//! integrations (applications) configured and child departments. The bearer
//! token for the knowledge-base service is the token of the first `ragflow`
//! application found in a depth-first walk.

use serde::{Deserialize, Serialize};

/// Integration kind of a department application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationKind {
    Ragflow,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ApplicationKind,
    #[serde(default)]
    pub config: ApplicationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Department {
    pub name: String,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub children: Vec<Department>,
}

/// Find the first configured `ragflow` token, checking a department's own
/// applications before descending into its children.
pub fn find_ragflow_token(departments: &[Department]) -> Option<&str> {
    for dept in departments {
        let own = dept
            .applications
            .iter()
            .find(|app| app.kind == ApplicationKind::Ragflow)
            .and_then(|app| app.config.token.as_deref())
            .filter(|token| !token.is_empty());
        if own.is_some() {
            return own;
        }

        if let Some(token) = find_ragflow_token(&dept.children) {
            return Some(token);
        }
    }
    None
}
