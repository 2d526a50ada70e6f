//! Plan canonicalization and fingerprinting.
//!
//! Two plans that differ only in volatile fields (credentials, human-readable
//! metadata, sample_size within a bucket) hash identically and share cache
//! entries and in-flight coalescing.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::plan::Plan;

/// Canonical form fed to the hash. Field order is fixed by the struct;
/// volatile fields (meta, credentials) never appear.
#[derive(Serialize)]
struct CanonicalPlan<'a> {
    schema_version: u32,
    scoring_method: &'static str,
    problem_type: &'static str,
    target_type: &'static str,
    task_type: &'static str,
    external_tool_usage: bool,
    language: String,
    subject_types: Vec<&'a str>,
    models: Vec<(&'a str, &'static str, &'a str)>,
    sample_size_bucket: u32,
    seed: Option<u64>,
}

pub struct Fingerprinter {
    buckets: Vec<u32>,
    max_sample_size: u32,
}

impl Fingerprinter {
    /// `buckets` is the ladder from configuration; it is sorted and
    /// deduplicated here so callers can pass it raw.
    pub fn new(buckets: &[u32], max_sample_size: u32) -> Self {
        let mut buckets: Vec<u32> = buckets.iter().copied().filter(|b| *b > 0).collect();
        buckets.sort_unstable();
        buckets.dedup();
        if buckets.is_empty() {
            buckets.push(max_sample_size.max(1));
        }
        Self {
            buckets,
            max_sample_size: max_sample_size.max(1),
        }
    }

    /// Map a requested sample size to the smallest bucket that covers it.
    /// Requests above the top bucket (or the configured max) land on the
    /// top bucket, bounding over-delivery.
    pub fn bucketed_sample_size(&self, requested: u32) -> u32 {
        let clamped = requested.clamp(1, self.max_sample_size);
        self.buckets
            .iter()
            .copied()
            .find(|b| *b >= clamped)
            .unwrap_or_else(|| *self.buckets.last().unwrap_or(&clamped))
    }

    /// Compute the 64-char lowercase hex SHA-256 fingerprint of a plan's
    /// canonical form.
    pub fn fingerprint(&self, plan: &Plan) -> String {
        let mut subject_types: Vec<&str> =
            plan.profile.subject_types.iter().map(String::as_str).collect();
        subject_types.sort_unstable();

        let mut models: Vec<(&str, &'static str, &str)> = plan
            .models
            .iter()
            .map(|m| (m.name.as_str(), m.provider_kind.as_str(), m.endpoint.as_str()))
            .collect();
        models.sort_unstable();

        let canonical = CanonicalPlan {
            schema_version: plan.schema_version,
            scoring_method: plan.directives.scoring_method.as_str(),
            problem_type: plan.profile.problem_type.as_str(),
            target_type: plan.profile.target_type.as_str(),
            task_type: plan.profile.task_type.as_str(),
            external_tool_usage: plan.profile.external_tool_usage,
            language: plan.profile.language.trim().to_lowercase(),
            subject_types,
            models,
            sample_size_bucket: self.bucketed_sample_size(plan.profile.sample_size),
            seed: plan.profile.seed,
        };

        // Serialization of a fixed-field struct is deterministic; a failure
        // here would be a serde bug, not input-dependent.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Fingerprint of the plan reduced to a single model. Cache rows written
    /// under singleton fingerprints let overlapping plans share results.
    pub fn singleton(&self, plan: &Plan, model_name: &str) -> String {
        let keep: std::collections::HashSet<String> = [model_name.to_string()].into();
        self.fingerprint(&plan.retain_models(&keep))
    }
}

/// Short prefix of a fingerprint for log fields and synthesized ids.
pub fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(16)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BUCKETS;
    use crate::plan::{ModelSpec, Plan, ProviderKind, ScoringMethod};

    fn fp() -> Fingerprinter {
        Fingerprinter::new(DEFAULT_BUCKETS, 1000)
    }

    fn base_plan() -> Plan {
        let json = serde_json::json!({
            "schema_version": 1,
            "meta": {"name": "compare", "description": "desc"},
            "profile": {
                "problem_type": "MCQA",
                "target_type": "Local",
                "task_type": "Knowledge",
                "external_tool_usage": false,
                "language": "Korean",
                "subject_types": ["Tech./Coding", "Math/Algebra"],
                "sample_size": 97,
                "seed": 7
            },
            "models": [
                {"name": "m2", "provider_kind": "openai-compatible",
                 "endpoint": "https://b.example/v1", "credential": "sk-b"},
                {"name": "m1", "provider_kind": "openai-compatible",
                 "endpoint": "https://a.example/v1", "credential": "sk-a"}
            ],
            "directives": {"scoring_method": "exact-match"}
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn deterministic() {
        let plan = base_plan();
        let a = fp().fingerprint(&plan);
        let b = fp().fingerprint(&plan);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn volatile_fields_do_not_affect_hash() {
        let plan = base_plan();
        let base = fp().fingerprint(&plan);

        let mut renamed = plan.clone();
        renamed.meta.name = "another name".into();
        renamed.meta.description = "another description".into();
        assert_eq!(fp().fingerprint(&renamed), base);

        let mut other_creds = plan.clone();
        for m in &mut other_creds.models {
            m.credential = Some("sk-different".into());
        }
        assert_eq!(fp().fingerprint(&other_creds), base);
    }

    #[test]
    fn model_order_is_canonical() {
        let plan = base_plan();
        let mut reversed = plan.clone();
        reversed.models.reverse();
        assert_eq!(fp().fingerprint(&reversed), fp().fingerprint(&plan));
    }

    #[test]
    fn subject_order_is_canonical() {
        let plan = base_plan();
        let mut reversed = plan.clone();
        reversed.profile.subject_types.reverse();
        assert_eq!(fp().fingerprint(&reversed), fp().fingerprint(&plan));
    }

    #[test]
    fn language_is_trimmed_and_lowercased() {
        let plan = base_plan();
        let mut shouty = plan.clone();
        shouty.profile.language = "  KOREAN ".into();
        assert_eq!(fp().fingerprint(&shouty), fp().fingerprint(&plan));
    }

    #[test]
    fn sample_size_within_bucket_coalesces() {
        let plan = base_plan(); // 97 → bucket 100
        let mut exact = plan.clone();
        exact.profile.sample_size = 100;
        assert_eq!(fp().fingerprint(&exact), fp().fingerprint(&plan));
    }

    #[test]
    fn bucket_boundary_splits_hash() {
        let mut at_boundary = base_plan();
        at_boundary.profile.sample_size = 50;
        let mut past_boundary = base_plan();
        past_boundary.profile.sample_size = 51; // → bucket 100
        assert_ne!(
            fp().fingerprint(&at_boundary),
            fp().fingerprint(&past_boundary)
        );
    }

    #[test]
    fn same_bucket_interior_coalesces() {
        let mut a = base_plan();
        a.profile.sample_size = 51;
        let mut b = base_plan();
        b.profile.sample_size = 99;
        assert_eq!(fp().fingerprint(&a), fp().fingerprint(&b));
    }

    #[test]
    fn above_top_bucket_clamps_to_top() {
        assert_eq!(fp().bucketed_sample_size(5000), 1000);
        assert_eq!(fp().bucketed_sample_size(1000), 1000);
        assert_eq!(fp().bucketed_sample_size(1), 10);
    }

    #[test]
    fn scoring_method_affects_hash() {
        let plan = base_plan();
        let mut judged = plan.clone();
        judged.directives.scoring_method = ScoringMethod::Judge;
        assert_ne!(fp().fingerprint(&judged), fp().fingerprint(&plan));
    }

    #[test]
    fn seed_affects_hash() {
        let plan = base_plan();
        let mut reseeded = plan.clone();
        reseeded.profile.seed = Some(8);
        assert_ne!(fp().fingerprint(&reseeded), fp().fingerprint(&plan));
    }

    #[test]
    fn extra_model_affects_hash() {
        let plan = base_plan();
        let mut more = plan.clone();
        more.models.push(ModelSpec {
            name: "m3".into(),
            provider_kind: ProviderKind::OpenaiCompatible,
            endpoint: "https://c.example/v1".into(),
            credential: None,
        });
        assert_ne!(fp().fingerprint(&more), fp().fingerprint(&plan));
    }

    #[test]
    fn short_prefix() {
        let plan = base_plan();
        let full = fp().fingerprint(&plan);
        assert_eq!(short(&full).len(), 16);
        assert!(full.starts_with(short(&full)));
    }
}
