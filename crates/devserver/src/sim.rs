//! Simulated job runner behind `POST /jobs/{id}/start`.

use std::time::Duration;

use jobwatch_types::StatusBody;
use serde::Deserialize;
use tracing::info;

use crate::state::DevState;

/// Optional body of `POST /jobs/{id}/start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimPlan {
    pub steps: u64,
    pub tick_ms: u64,
    /// Fail instead of running this step (1-based).
    pub fail_at: Option<u64>,
    pub stage: String,
}

impl Default for SimPlan {
    fn default() -> Self {
        Self {
            steps: 10,
            tick_ms: 500,
            fail_at: None,
            stage: "processing".into(),
        }
    }
}

pub async fn run(state: DevState, job_id: String, plan: SimPlan) {
    let steps = plan.steps.max(1);
    let tick = Duration::from_millis(plan.tick_ms);
    info!(job_id = %job_id, steps, tick_ms = plan.tick_ms, "simulated job started");

    for step in 1..=steps {
        tokio::time::sleep(tick).await;
        if plan.fail_at == Some(step) {
            state.fail(&job_id, &format!("simulated failure at step {step}/{steps}"));
            info!(job_id = %job_id, step, "simulated job failed");
            return;
        }
        if step == steps {
            state.finish(&job_id, serde_json::json!({ "processed": steps }));
            break;
        }
        state.publish(
            &job_id,
            StatusBody {
                status: Some("running".into()),
                progress: Some(step as f64 / steps as f64),
                stage: Some(plan.stage.clone()),
                message: Some(format!("Processing item {step}/{steps}")),
                processed: Some(step),
                total: Some(steps),
                ..Default::default()
            },
        );
    }
    info!(job_id = %job_id, "simulated job completed");
}
