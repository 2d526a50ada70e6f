//! Shared harness for integration tests: an in-memory store, queue, vault,
//! and dispatcher wired exactly like `main`, plus plan builders and polling
//! helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ranklab::config::Config;
use ranklab::credentials::CredentialVault;
use ranklab::dispatcher::{CancelHub, Dispatcher};
use ranklab::evaluator::Evaluator;
use ranklab::fingerprint::Fingerprinter;
use ranklab::plan::{Plan, SubjectTaxonomy};
use ranklab::queue::InMemoryQueue;
use ranklab::server::AppState;
use ranklab::store::Store;
use ranklab::store::cache::CacheIndex;
use ranklab::store::samples::{SampleRow, SampleStore};
use ranklab::store::tasks::TaskRegistry;
use ranklab::task::{Task, TaskPatch, TaskStatus, epoch_ms};
use ranklab::worker::{WorkerContext, run_worker};

pub fn test_config() -> Config {
    Config {
        task_max_duration: Duration::from_secs(30),
        cache_ttl: Duration::from_secs(3600),
        min_cache_reuse_samples: 10,
        cancel_latency_bound: Duration::from_millis(200),
        lease_ttl: Duration::from_millis(200),
        progress_min_interval: Duration::from_millis(10),
        credential_envelope_ttl: Duration::from_secs(60),
        worker_concurrency: 1,
        ..Config::default()
    }
}

pub struct Harness {
    pub config: Config,
    pub store: Arc<Store>,
    pub registry: TaskRegistry,
    pub samples: SampleStore,
    pub cache: CacheIndex,
    pub queue: Arc<InMemoryQueue>,
    pub vault: Arc<CredentialVault>,
    pub cancels: Arc<CancelHub>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Store::open_in_memory().expect("in-memory store");
        let registry = TaskRegistry::new(store.clone());
        let samples = SampleStore::new(store.clone());
        let cache =
            CacheIndex::new(store.clone(), config.cache_ttl, config.min_evaluator_version);
        let queue = Arc::new(InMemoryQueue::new(config.lease_ttl));
        let vault =
            Arc::new(CredentialVault::new(config.credential_envelope_ttl).expect("vault"));
        let cancels = Arc::new(CancelHub::new());
        let dispatcher = Dispatcher::new(
            &config,
            SubjectTaxonomy::default(),
            registry.clone(),
            cache.clone(),
            queue.clone(),
            vault.clone(),
            cancels.clone(),
        );
        Self {
            config,
            store,
            registry,
            samples,
            cache,
            queue,
            vault,
            cancels,
            dispatcher,
        }
    }

    pub fn fingerprinter(&self) -> Fingerprinter {
        Fingerprinter::new(&self.config.sample_size_buckets, self.config.max_sample_size)
    }

    pub fn worker_ctx(&self, evaluator: Arc<dyn Evaluator>) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            registry: self.registry.clone(),
            samples: self.samples.clone(),
            cache: self.cache.clone(),
            queue: self.queue.clone(),
            vault: self.vault.clone(),
            evaluator,
            cancels: self.cancels.clone(),
            config: self.config.clone(),
        })
    }

    pub fn spawn_worker(
        &self,
        evaluator: Arc<dyn Evaluator>,
        shutdown: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run_worker(self.worker_ctx(evaluator), 0, shutdown.clone()))
    }

    pub fn app_state(&self, evaluator: Arc<dyn Evaluator>) -> Arc<AppState> {
        let dispatcher = Dispatcher::new(
            &self.config,
            SubjectTaxonomy::default(),
            self.registry.clone(),
            self.cache.clone(),
            self.queue.clone(),
            self.vault.clone(),
            self.cancels.clone(),
        );
        Arc::new(AppState {
            dispatcher,
            registry: self.registry.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            evaluator,
            config: self.config.clone(),
        })
    }

    pub async fn wait_for_status(
        &self,
        task_id: &str,
        want: TaskStatus,
        timeout: Duration,
    ) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last = None;
        while tokio::time::Instant::now() < deadline {
            if let Ok(task) = self.registry.get(task_id).await {
                if task.status == want {
                    return task;
                }
                last = Some(task.status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} never reached {want:?} (last seen: {last:?})");
    }

    pub async fn wait_terminal(&self, task_id: &str, timeout: Duration) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Ok(task) = self.registry.get(task_id).await
                && task.status.is_terminal()
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    pub async fn wait_sample_count(&self, task_id: &str, want: u64, timeout: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut count = 0;
        while tokio::time::Instant::now() < deadline {
            count = self.samples.task_sample_count(task_id).await.unwrap_or(0);
            if count >= want {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} has {count} samples, wanted >= {want}");
    }

    /// Seed a SUCCESS task whose samples average the given correctness
    /// values, with aggregates upserted into the cache. The plan is
    /// normalized the same way the dispatcher normalizes submissions, so a
    /// later submit of the same plan hits the seeded fingerprint. Returns
    /// the task.
    pub async fn seed_success(&self, plan: &Plan, correctness: &[f64]) -> Task {
        let mut plan = plan.clone();
        plan.profile.sample_size = self
            .fingerprinter()
            .bucketed_sample_size(plan.profile.sample_size);
        let plan = &plan;
        let fingerprint = self.fingerprinter().fingerprint(plan);
        let task = Task::new_evaluation(fingerprint.clone(), plan);
        let task_id = task.task_id.clone();
        self.registry.create(task).await.expect("seed create");
        self.registry
            .transition(&task_id, &[TaskStatus::Pending], TaskStatus::Started, TaskPatch::default())
            .await
            .expect("seed start");

        let subject = plan.profile.subject_types[0].clone();
        let mut rows = Vec::new();
        for model in &plan.models {
            for (index, value) in correctness.iter().enumerate() {
                rows.push(SampleRow {
                    task_id: task_id.clone(),
                    model_name: model.name.clone(),
                    sample_index: index as u32,
                    fingerprint: fingerprint.clone(),
                    prompt: format!("seed question #{index}"),
                    answer: format!("seed answer #{index}"),
                    correctness: *value,
                    skill_label: None,
                    target_label: Some(plan.profile.target_type.as_str().to_string()),
                    subject_label: Some(subject.clone()),
                    task_label: Some(plan.profile.task_type.as_str().to_string()),
                    dataset_name: Some("seed".to_string()),
                    metadata: None,
                    ts: epoch_ms(),
                });
            }
        }
        self.samples.append(rows).await.expect("seed samples");
        self.cache
            .upsert_from_task(&task_id)
            .await
            .expect("seed upsert");
        self.registry
            .transition(&task_id, &[TaskStatus::Started], TaskStatus::Success, TaskPatch::default())
            .await
            .expect("seed success")
    }
}

/// Wire form of a test plan (credentials included), as a client would POST
/// it: one model entry per name, evaluating Korean Tech./Coding knowledge.
pub fn plan_json(models: &[&str], sample_size: u32) -> serde_json::Value {
    let model_entries: Vec<serde_json::Value> = models
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "provider_kind": "openai-compatible",
                "endpoint": format!("https://{name}.example/v1/chat/completions"),
                "credential": format!("sk-{name}"),
            })
        })
        .collect();
    serde_json::json!({
        "schema_version": 1,
        "meta": {"name": "itest", "description": "integration test plan"},
        "profile": {
            "problem_type": "MCQA",
            "target_type": "Local",
            "task_type": "Knowledge",
            "external_tool_usage": false,
            "language": "Korean",
            "subject_types": ["Tech./Coding"],
            "sample_size": sample_size,
            "seed": 7
        },
        "models": model_entries,
        "directives": {"scoring_method": "exact-match"}
    })
}

/// Typed form of [`plan_json`].
pub fn plan_with_models(models: &[&str], sample_size: u32) -> Plan {
    serde_json::from_value(plan_json(models, sample_size)).expect("test plan deserializes")
}
