use crate::worker::{HandlerError, JobContext, JobHandler};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

pub const LOG_MESSAGE_JOB_TYPE: &str = "log_message";

#[derive(Debug, Deserialize)]
struct LogMessagePayload {
    message: String,
    #[serde(default)]
    level: Option<String>,
}

/// Writes its payload to the log. Handy for checking a deployment end to end.
pub struct LogMessageHandler;

impl JobHandler for LogMessageHandler {
    fn job_type(&self) -> &'static str {
        LOG_MESSAGE_JOB_TYPE
    }

    fn description(&self) -> &'static str {
        "Log the message carried in the payload"
    }

    fn execute(&self, ctx: &JobContext, payload: &JsonValue) -> Result<(), HandlerError> {
        let payload: LogMessagePayload = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::Permanent(format!("invalid payload: {}", e)))?;

        match payload.level.as_deref().unwrap_or("info") {
            "debug" => debug!("[{}] {}", ctx.job_id, payload.message),
            "info" => info!("[{}] {}", ctx.job_id, payload.message),
            "warn" => warn!("[{}] {}", ctx.job_id, payload.message),
            "error" => error!("[{}] {}", ctx.job_id, payload.message),
            other => {
                return Err(HandlerError::Permanent(format!(
                    "unknown log level '{}'",
                    other
                )))
            }
        }
        Ok(())
    }
}
