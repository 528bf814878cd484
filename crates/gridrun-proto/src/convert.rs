//! Converters between wire types and domain types.

use gridrun_core::{ComputeTask, ConnectedClient, TaskId};

use crate::message::{CancelTask, ServerMessage, TaskAssignment, WorkerRegistered};

impl From<&ComputeTask> for TaskAssignment {
    fn from(task: &ComputeTask) -> Self {
        Self {
            task_id: task.task_id.as_str().to_string(),
            task_type: task.task_type.clone(),
            input_data: task.input_data.clone(),
            model_id: task.model_id.clone(),
            timeout_seconds: task.timeout_seconds,
        }
    }
}

impl From<&ConnectedClient> for WorkerRegistered {
    fn from(client: &ConnectedClient) -> Self {
        Self {
            session_id: client.session_id.as_str().to_string(),
            supported_models: client.supported_models.iter().cloned().collect(),
        }
    }
}

impl ServerMessage {
    pub fn assignment(task: &ComputeTask) -> Self {
        Self::TaskAssignment(task.into())
    }

    pub fn cancel(task_id: &TaskId) -> Self {
        Self::CancelTask(CancelTask {
            task_id: task_id.as_str().to_string(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(crate::message::ErrorFrame {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridrun_core::SessionId;
    use serde_json::json;

    #[test]
    fn test_assignment_from_task() {
        let task = ComputeTask::new("sentiment", json!(["great"]), "distilbert").with_timeout(30);
        let assignment = TaskAssignment::from(&task);
        assert_eq!(assignment.task_id, task.task_id.as_str());
        assert_eq!(assignment.model_id, "distilbert");
        assert_eq!(assignment.timeout_seconds, 30);
        assert_eq!(assignment.input_data, json!(["great"]));
    }

    #[test]
    fn test_registered_lists_models_sorted() {
        let client = ConnectedClient::new(SessionId::new("s1"), Utc::now())
            .with_model("zeta")
            .with_model("alpha");
        let registered = WorkerRegistered::from(&client);
        assert_eq!(registered.session_id, "s1");
        assert_eq!(registered.supported_models, vec!["alpha", "zeta"]);
    }
}
