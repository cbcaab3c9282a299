use serde::{Deserialize, Serialize};

/// `{queueName -> {workerName, deadLetterQueue?}}` (spec §3 "Queue Consumer").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConsumer {
    pub queue_name: String,
    pub worker_name: String,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
}
