// Demo topic handlers
//
// Each handler shows one outcome kind:
// - echo: success, returns the received variables
// - flaky: retryable failure half of the time
// - validate: BPMN error when the order amount is missing or negative

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde_json::Value;
use tracing::info;

use extask_core::{Outcome, TaskHandle, Variables};

pub const ECHO_TOPIC: &str = "echo";
pub const FLAKY_TOPIC: &str = "flaky";
pub const VALIDATE_TOPIC: &str = "validate";

const FLAKY_MAX_RETRIES: u32 = 3;
const FLAKY_RETRY_DELAY: Duration = Duration::from_secs(5);

pub const INVALID_AMOUNT: &str = "INVALID_AMOUNT";

pub async fn echo(task: TaskHandle) -> Result<Outcome> {
    info!(task_id = %task.id(), variables = task.variables().len(), "Echoing variables");
    Ok(task.complete(task.variables().clone(), Variables::new()))
}

pub async fn flaky(task: TaskHandle) -> Result<Outcome> {
    let unlucky = rand::thread_rng().gen_bool(0.5);
    Ok(flaky_outcome(&task, unlucky))
}

fn flaky_outcome(task: &TaskHandle, unlucky: bool) -> Outcome {
    if unlucky {
        return task.fail(
            "Flaky dependency unavailable",
            Some(format!("attempt with {:?} retries left", task.retries())),
            FLAKY_MAX_RETRIES,
            FLAKY_RETRY_DELAY,
        );
    }
    task.complete(Variables::new().with("flaky", "ok"), Variables::new())
}

pub async fn validate(task: TaskHandle) -> Result<Outcome> {
    let amount = task.variable("amount").as_ref().and_then(Value::as_f64);
    match amount {
        Some(amount) if amount >= 0.0 => {
            Ok(task.complete(Variables::new().with("valid", true), Variables::new()))
        }
        Some(amount) => Ok(task.bpmn_error(
            INVALID_AMOUNT,
            Some(format!("amount must not be negative, got {amount}")),
            Variables::new().with("valid", false),
        )),
        None => Ok(task.bpmn_error(
            INVALID_AMOUNT,
            Some("amount is missing or not a number".to_string()),
            Variables::new().with("valid", false),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extask_core::TaskOffer;
    use serde_json::json;

    fn task(topic: &str, variables: Variables) -> TaskHandle {
        TaskHandle::new(TaskOffer::new("task-1", topic, "worker-1").with_variables(variables))
    }

    #[test_log::test(tokio::test)]
    async fn test_echo_returns_variables() {
        let vars = Variables::new().with("order", "o-1").with("amount", 30);
        let outcome = echo(task(ECHO_TOPIC, vars.clone())).await.unwrap();

        assert_eq!(outcome, Outcome::success(vars, Variables::new()));
    }

    #[test]
    fn test_flaky_failure_counts_down_engine_retries() {
        let handle = TaskHandle::new(
            TaskOffer::new("task-1", FLAKY_TOPIC, "worker-1").with_retries(Some(2)),
        );
        let outcome = flaky_outcome(&handle, true);

        assert!(outcome.is_retryable_failure());
        assert!(matches!(
            outcome,
            Outcome::RetryableFailure { retries_remaining: 1, .. }
        ));
    }

    #[test]
    fn test_flaky_success() {
        let outcome = flaky_outcome(&task(FLAKY_TOPIC, Variables::new()), false);
        assert!(outcome.is_success());
    }

    #[test_log::test(tokio::test)]
    async fn test_validate_accepts_positive_amount() {
        let outcome = validate(task(VALIDATE_TOPIC, Variables::new().with("amount", 12.5)))
            .await
            .unwrap();

        assert!(outcome.is_success());
    }

    #[test_log::test(tokio::test)]
    async fn test_validate_rejects_negative_amount() {
        let outcome = validate(task(VALIDATE_TOPIC, Variables::new().with("amount", -1)))
            .await
            .unwrap();

        match outcome {
            Outcome::BusinessError { code, variables, .. } => {
                assert_eq!(code, INVALID_AMOUNT);
                assert_eq!(variables.get("valid"), Some(json!(false)));
            }
            other => panic!("expected business error, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_validate_rejects_missing_amount() {
        let outcome = validate(task(VALIDATE_TOPIC, Variables::new())).await.unwrap();
        assert!(outcome.is_business_error());
    }
}
