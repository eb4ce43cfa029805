use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, ExecutionOutcome, OutcomeKind, RunSpec, StartAck};
use crate::error::Result;

/// In-process backend that interprets the resolved command instead of
/// running a container. Used by the test harness and `--backend sim` dry
/// runs.
///
/// Recognized command tokens:
/// - `succeed` — complete successfully after the default runtime
/// - `fail` / `fail:N` — exit non-zero (code N, default 1)
/// - `sleep:MS` — run for MS milliseconds, then succeed
/// - `hang` — run until terminated
/// - `stall` — never confirm the start (exercises the stall path)
///
/// Anything else succeeds after the default runtime.
pub struct SimBackend {
    outcome_tx: mpsc::Sender<ExecutionOutcome>,
    default_runtime: Duration,
    running: Arc<Mutex<HashMap<Uuid, Arc<Notify>>>>,
}

#[derive(Debug, Clone, Copy)]
enum Directive {
    Succeed(Duration),
    Fail(i32),
    Hang,
    Stall,
}

impl SimBackend {
    pub fn new(outcome_tx: mpsc::Sender<ExecutionOutcome>) -> Self {
        Self::with_runtime(outcome_tx, Duration::from_millis(20))
    }

    pub fn with_runtime(outcome_tx: mpsc::Sender<ExecutionOutcome>, runtime: Duration) -> Self {
        Self {
            outcome_tx,
            default_runtime: runtime,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn directive(&self, command: &[String]) -> Directive {
        for token in command {
            if token == "succeed" {
                return Directive::Succeed(self.default_runtime);
            }
            if token == "hang" {
                return Directive::Hang;
            }
            if token == "stall" {
                return Directive::Stall;
            }
            if token == "fail" {
                return Directive::Fail(1);
            }
            if let Some(code) = token.strip_prefix("fail:") {
                return Directive::Fail(code.parse().unwrap_or(1));
            }
            if let Some(ms) = token.strip_prefix("sleep:") {
                let ms = ms.parse().unwrap_or(0);
                return Directive::Succeed(Duration::from_millis(ms));
            }
        }
        Directive::Succeed(self.default_runtime)
    }
}

#[async_trait]
impl ExecutionBackend for SimBackend {
    async fn start(&self, spec: RunSpec) -> Result<StartAck> {
        let directive = self.directive(&spec.command);

        if matches!(directive, Directive::Stall) {
            // Simulates an environment that never confirms; the caller's
            // bounded wait turns this into a dispatch stall.
            std::future::pending::<()>().await;
            unreachable!();
        }

        let instance_id = spec.instance_id;
        let cancel = Arc::new(Notify::new());
        self.running.lock().await.insert(instance_id, cancel.clone());

        let outcome_tx = self.outcome_tx.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let work = async {
                match directive {
                    Directive::Succeed(runtime) => {
                        tokio::time::sleep(runtime).await;
                        (OutcomeKind::Succeeded, Some(0))
                    }
                    Directive::Fail(code) => {
                        (OutcomeKind::Failed, Some(code))
                    }
                    Directive::Hang => {
                        std::future::pending::<()>().await;
                        unreachable!()
                    }
                    Directive::Stall => unreachable!(),
                }
            };

            let (kind, exit_code) = tokio::select! {
                outcome = work => outcome,
                _ = cancel.notified() => (OutcomeKind::Cancelled, None),
            };

            running.lock().await.remove(&instance_id);
            let _ = outcome_tx
                .send(ExecutionOutcome {
                    instance_id,
                    kind,
                    exit_code,
                    message: None,
                })
                .await;
        });

        Ok(StartAck {
            instance_id,
            runtime_ref: format!("sim-{}", instance_id),
        })
    }

    async fn terminate(&self, instance_id: Uuid) -> Result<()> {
        if let Some(cancel) = self.running.lock().await.get(&instance_id) {
            cancel.notify_one();
        }
        Ok(())
    }
}
