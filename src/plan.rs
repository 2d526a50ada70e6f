use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::RanklabError;

/// Maximum number of models per plan (prevents fan-out abuse).
pub const MAX_MODELS: usize = 20;

/// Plan schema version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

/// Problem formulation of the benchmark items.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ProblemType {
    Binary,
    #[serde(rename = "MCQA")]
    Mcqa,
    #[serde(rename = "short-form")]
    ShortForm,
    #[serde(rename = "open-ended")]
    OpenEnded,
}

impl ProblemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "Binary",
            Self::Mcqa => "MCQA",
            Self::ShortForm => "short-form",
            Self::OpenEnded => "open-ended",
        }
    }
}

/// Whether the evaluation targets general or locale-specific knowledge.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum TargetType {
    General,
    Local,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "General",
            Self::Local => "Local",
        }
    }
}

/// Capability axis being measured.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum TaskType {
    Knowledge,
    Reasoning,
    Value,
    Alignment,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knowledge => "Knowledge",
            Self::Reasoning => "Reasoning",
            Self::Value => "Value",
            Self::Alignment => "Alignment",
        }
    }
}

/// Wire protocol spoken by a model endpoint.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenaiCompatible,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenaiCompatible => "openai-compatible",
            Self::Anthropic => "anthropic",
        }
    }
}

/// How a model answer is scored against the reference.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringMethod {
    ExactMatch,
    Contains,
    Judge,
}

impl ScoringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactMatch => "exact-match",
            Self::Contains => "contains",
            Self::Judge => "judge",
        }
    }
}

/// Human-readable plan metadata. Excluded from fingerprinting.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlanMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// The evaluation profile: what to measure, in which language, on which
/// subjects, with how many samples.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvalProfile {
    pub problem_type: ProblemType,
    pub target_type: TargetType,
    pub task_type: TaskType,
    #[serde(default)]
    pub external_tool_usage: bool,
    pub language: String,
    pub subject_types: Vec<String>,
    pub sample_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// One model endpoint to evaluate.
///
/// The credential never serializes: task snapshots, logs, and queue payloads
/// get the redacted form for free.
#[derive(Clone, Deserialize, Serialize)]
pub struct ModelSpec {
    pub name: String,
    pub provider_kind: ProviderKind,
    pub endpoint: String,
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
}

impl std::fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSpec")
            .field("name", &self.name)
            .field("provider_kind", &self.provider_kind)
            .field("endpoint", &self.endpoint)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

fn default_call_timeout() -> u64 {
    60
}

fn default_batch_size() -> u32 {
    8
}

/// Execution directives for the evaluator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvalDirectives {
    pub scoring_method: ScoringMethod,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for EvalDirectives {
    fn default() -> Self {
        Self {
            scoring_method: ScoringMethod::ExactMatch,
            call_timeout_secs: default_call_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

/// A validated evaluation request. The unit of work for the dispatcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plan {
    pub schema_version: u32,
    #[serde(default)]
    pub meta: PlanMeta,
    pub profile: EvalProfile,
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub directives: EvalDirectives,
}

impl Plan {
    /// Validate against the closed schema. Returns the first violation.
    pub fn validate(&self, taxonomy: &SubjectTaxonomy) -> Result<(), RanklabError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(RanklabError::Validation(format!(
                "unsupported schema_version {} (expected {SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        if self.models.is_empty() {
            return Err(RanklabError::Validation("at least one model required".into()));
        }
        if self.models.len() > MAX_MODELS {
            return Err(RanklabError::Validation(format!(
                "{} models requested, max is {MAX_MODELS}",
                self.models.len()
            )));
        }
        // Model identity is the name everywhere downstream (credential
        // envelope keys, sample rows, cache row keys), so names must be
        // unique regardless of endpoint.
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err(RanklabError::Validation("model name must be non-empty".into()));
            }
            if model.endpoint.trim().is_empty() {
                return Err(RanklabError::Validation(format!(
                    "model {:?} has an empty endpoint",
                    model.name
                )));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(RanklabError::Validation(format!(
                    "duplicate model entry {:?}",
                    model.name
                )));
            }
        }
        if self.profile.language.trim().is_empty() {
            return Err(RanklabError::Validation("language must be non-empty".into()));
        }
        if self.profile.subject_types.is_empty() {
            return Err(RanklabError::Validation(
                "at least one subject_type required".into(),
            ));
        }
        for subject in &self.profile.subject_types {
            if !taxonomy.contains(subject) {
                return Err(RanklabError::Validation(format!(
                    "unknown subject_type {subject:?}"
                )));
            }
        }
        if self.profile.sample_size == 0 {
            return Err(RanklabError::Validation("sample_size must be >= 1".into()));
        }
        if self.directives.call_timeout_secs == 0 {
            return Err(RanklabError::Validation("call_timeout_secs must be >= 1".into()));
        }
        if self.directives.batch_size == 0 {
            return Err(RanklabError::Validation("batch_size must be >= 1".into()));
        }
        Ok(())
    }

    /// Clone with credentials stripped. This is what lands on the task
    /// record; `ModelSpec` serialization skips credentials as well.
    pub fn redacted(&self) -> Plan {
        let mut plan = self.clone();
        for model in &mut plan.models {
            model.credential = None;
        }
        plan
    }

    /// Restrict the plan to the given model names (used for partial cache
    /// hits, where only the uncached models need evaluation).
    pub fn retain_models(&self, keep: &HashSet<String>) -> Plan {
        let mut plan = self.clone();
        plan.models.retain(|m| keep.contains(&m.name));
        plan
    }
}

/// Closed subject taxonomy, supplied at construction.
///
/// Entries use the `Coarse/fine` form. Membership is validation data, not a
/// contract; deployments load their own set.
#[derive(Debug, Clone)]
pub struct SubjectTaxonomy {
    entries: BTreeSet<String>,
}

impl SubjectTaxonomy {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.entries.contains(subject)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SubjectTaxonomy {
    /// Compact built-in set so the binary runs without external taxonomy
    /// data. Deployments replace this via `SubjectTaxonomy::new`.
    fn default() -> Self {
        Self::new([
            "Tech./Coding",
            "Tech./ML",
            "Tech./Security",
            "Math/Algebra",
            "Math/Geometry",
            "Math/Calculus",
            "Math/Statistics",
            "Science/Physics",
            "Science/Chemistry",
            "Science/Biology",
            "Science/Earth",
            "Humanities/History",
            "Humanities/Philosophy",
            "Humanities/Literature",
            "Language/Grammar",
            "Language/Translation",
            "Language/Reading",
            "Society/Law",
            "Society/Economics",
            "Society/Politics",
            "Culture/Art",
            "Culture/Music",
            "Culture/Food",
            "HASS/Education",
        ])
    }
}

/// Fixture shared by unit tests across the crate.
#[cfg(test)]
pub(crate) fn sample_plan() -> Plan {
    Plan {
        schema_version: SCHEMA_VERSION,
        meta: PlanMeta {
            name: "korean hs math".into(),
            description: "compare models on Korean high-school math".into(),
        },
        profile: EvalProfile {
            problem_type: ProblemType::Mcqa,
            target_type: TargetType::Local,
            task_type: TaskType::Knowledge,
            external_tool_usage: false,
            language: "Korean".into(),
            subject_types: vec!["Math/Algebra".into()],
            sample_size: 50,
            seed: Some(7),
        },
        models: vec![ModelSpec {
            name: "m1".into(),
            provider_kind: ProviderKind::OpenaiCompatible,
            endpoint: "https://api.example.com/v1/chat/completions".into(),
            credential: Some("sk-secret".into()),
        }],
        directives: EvalDirectives::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_wire_names_are_exact() {
        assert_eq!(serde_json::to_value(ProblemType::Mcqa).unwrap(), "MCQA");
        assert_eq!(serde_json::to_value(ProblemType::ShortForm).unwrap(), "short-form");
        assert_eq!(serde_json::to_value(ProblemType::OpenEnded).unwrap(), "open-ended");
        assert_eq!(serde_json::to_value(TargetType::General).unwrap(), "General");
        assert_eq!(serde_json::to_value(TaskType::Alignment).unwrap(), "Alignment");
        assert_eq!(
            serde_json::to_value(ProviderKind::OpenaiCompatible).unwrap(),
            "openai-compatible"
        );
        assert_eq!(
            serde_json::to_value(ScoringMethod::ExactMatch).unwrap(),
            "exact-match"
        );
    }

    #[test]
    fn unknown_enum_value_rejected() {
        let err = serde_json::from_value::<ProblemType>(serde_json::json!("essay"));
        assert!(err.is_err());
    }

    #[test]
    fn valid_plan_passes() {
        sample_plan().validate(&SubjectTaxonomy::default()).unwrap();
    }

    #[test]
    fn empty_models_rejected() {
        let mut plan = sample_plan();
        plan.models.clear();
        let err = plan.validate(&SubjectTaxonomy::default()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn unknown_subject_rejected() {
        let mut plan = sample_plan();
        plan.profile.subject_types = vec!["Sports/Curling".into()];
        let err = plan.validate(&SubjectTaxonomy::default()).unwrap_err();
        assert!(err.to_string().contains("Sports/Curling"));
    }

    #[test]
    fn zero_sample_size_rejected() {
        let mut plan = sample_plan();
        plan.profile.sample_size = 0;
        assert!(plan.validate(&SubjectTaxonomy::default()).is_err());
    }

    #[test]
    fn duplicate_model_rejected() {
        let mut plan = sample_plan();
        plan.models.push(plan.models[0].clone());
        assert!(plan.validate(&SubjectTaxonomy::default()).is_err());
    }

    #[test]
    fn same_name_different_endpoint_rejected() {
        let mut plan = sample_plan();
        let mut twin = plan.models[0].clone();
        twin.endpoint = "https://other.example/v1/chat/completions".into();
        twin.credential = Some("sk-other".into());
        plan.models.push(twin);
        let err = plan.validate(&SubjectTaxonomy::default()).unwrap_err();
        assert!(err.to_string().contains("duplicate model entry"));
    }

    #[test]
    fn credential_never_serializes() {
        let plan = sample_plan();
        let json = serde_json::to_string(&plan).unwrap();
        assert!(!json.contains("sk-secret"), "credential leaked: {json}");
    }

    #[test]
    fn debug_redacts_credential() {
        let plan = sample_plan();
        let rendered = format!("{:?}", plan.models[0]);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn redacted_strips_credentials() {
        let plan = sample_plan().redacted();
        assert!(plan.models.iter().all(|m| m.credential.is_none()));
    }

    #[test]
    fn taxonomy_is_closed() {
        let tax = SubjectTaxonomy::new(["A/b", "C/d"]);
        assert!(tax.contains("A/b"));
        assert!(!tax.contains("a/b"), "membership is case-sensitive");
        assert_eq!(tax.len(), 2);
    }
}
