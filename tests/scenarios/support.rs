use ciris::dma::ReasoningBackend;
use ciris::scheduler::BatchLimits;
use ciris::schemas::{Task, TaskStatus};
use ciris::{CirisRuntime, Config};
use std::sync::Arc;
use tempfile::TempDir;

pub struct Harness {
    pub runtime: CirisRuntime,
    round: u64,
    _tmp: TempDir,
}

pub fn config_in(tmp: &TempDir) -> Config {
    Config {
        config_path: tmp.path().join("config.toml"),
        data_dir: tmp.path().to_path_buf(),
        ..Config::default()
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(|_| {}, None).await
    }

    pub async fn with(
        tweak: impl FnOnce(&mut Config),
        backend: Option<Arc<dyn ReasoningBackend>>,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);
        tweak(&mut config);
        let runtime = match backend {
            Some(backend) => CirisRuntime::build_with_backend(config, backend).await,
            None => CirisRuntime::build(config).await,
        }
        .unwrap();
        Self {
            runtime,
            round: 0,
            _tmp: tmp,
        }
    }

    pub async fn submit(&self, description: &str) -> Task {
        self.runtime
            .submit_task(description, 0, None, Some("tester".into()))
            .await
            .unwrap()
    }

    /// Pull and process one batch; returns how many thoughts ran.
    pub async fn round(&mut self) -> usize {
        self.round += 1;
        let batch = self
            .runtime
            .scheduler()
            .pull_batch(self.round, BatchLimits::new(10, 10))
            .await
            .unwrap();
        let pulled = batch.len();
        self.runtime.thoughts().process_batch(batch, 4).await;
        pulled
    }

    pub async fn task_status(&self, task_id: &str) -> TaskStatus {
        self.runtime
            .scheduler()
            .store()
            .get_task(task_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    /// Run rounds until the task closes or `max_rounds` pass.
    pub async fn drive(&mut self, task_id: &str, max_rounds: usize) -> TaskStatus {
        for _ in 0..max_rounds {
            let status = self.task_status(task_id).await;
            if status.is_terminal() {
                return status;
            }
            self.round().await;
        }
        self.task_status(task_id).await
    }
}
