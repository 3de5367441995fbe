use crate::variables::JobVariables;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kubernetes image pull policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    /// Value as the Kubernetes API spells it.
    pub fn as_k8s(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullPolicy::Always => write!(f, "always"),
            PullPolicy::IfNotPresent => write!(f, "if_not_present"),
            PullPolicy::Never => write!(f, "never"),
        }
    }
}

fn default_protocol() -> String {
    "http".to_string()
}

/// A port exposed by a build or service image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Port {
    pub number: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub name: String,
}

/// Image reference for the build container or a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub pull_policies: Vec<PullPolicy>,
}

impl Image {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Aliases declared on the image; several may be given separated by commas or spaces.
    pub fn aliases(&self) -> Vec<&str> {
        self.alias
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|a| !a.is_empty())
            .collect()
    }
}

/// Registry credentials supplied with the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(rename = "type", default = "default_credentials_type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_credentials_type() -> String {
    "registry".to_string()
}

/// Script body for one build stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageScript {
    pub name: String,
    #[serde(default)]
    pub script: String,
    /// Generated by the runner rather than supplied by the user; runs in the helper container.
    #[serde(default)]
    pub predefined: bool,
}

/// The job as the executor sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub image: Image,
    #[serde(default)]
    pub services: Vec<Image>,
    #[serde(default)]
    pub credentials: Vec<Credentials>,
    #[serde(default)]
    pub variables: JobVariables,
    #[serde(default)]
    pub stages: Vec<StageScript>,
    /// Job timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl JobSpec {
    /// Load a job definition from a YAML file.
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let job: JobSpec = serde_yaml::from_str(&contents)?;
        Ok(job)
    }

    /// Name shared by every resource created for this job, before sanitising.
    pub fn project_unique_name(&self) -> String {
        let runner = if self.runner.is_empty() {
            "local"
        } else {
            self.runner.as_str()
        };
        format!("runner-{}-project-{}-job-{}", runner, self.project_id, self.id)
    }

    pub fn stage(&self, name: &str) -> Option<&StageScript> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Registry credentials only.
    pub fn registry_credentials(&self) -> impl Iterator<Item = &Credentials> {
        self.credentials.iter().filter(|c| c.kind == "registry")
    }
}
