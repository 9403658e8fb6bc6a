//! Entry point for external "new work" notifications.

use tracing::info;
use uuid::Uuid;

use crate::client::{Client, ClientError, StartOutcome};

/// Namespace for deriving instance ids from `(orchestration, identifier)`.
const TRIGGER_NAMESPACE: Uuid = Uuid::from_u128(0x6d1c_4f3e_9a2b_4c58_8e7f_3b0a_d4c2_19e5);

/// Starts one orchestration instance per distinct identifier.
///
/// Each notification maps to a deterministic instance id, so a notification
/// delivered twice (e.g. by an at-least-once queue) starts a single instance.
#[derive(Clone)]
pub struct TriggerAdapter {
    client: Client,
    orchestration: String,
}

impl TriggerAdapter {
    pub fn new(client: Client, orchestration: impl Into<String>) -> Self {
        Self {
            client,
            orchestration: orchestration.into(),
        }
    }

    /// Instance id a notification for `identifier` resolves to.
    pub fn instance_id_for(&self, identifier: &str) -> String {
        let name = format!("{}\n{}", self.orchestration, identifier);
        Uuid::new_v5(&TRIGGER_NAMESPACE, name.as_bytes()).to_string()
    }

    /// Start the orchestration with `identifier` as input, or resolve to the
    /// instance an earlier notification started. Returns the instance id.
    pub async fn notify_new_work(&self, identifier: &str) -> Result<String, ClientError> {
        let instance = self.instance_id_for(identifier);
        match self
            .client
            .start_orchestration_with_id(&instance, &self.orchestration, identifier)
            .await?
        {
            StartOutcome::Started => info!(
                target: "duraflow::trigger",
                instance_id = %instance,
                identifier,
                orchestration_name = %self.orchestration,
                "New work started"
            ),
            StartOutcome::AlreadyExists => info!(
                target: "duraflow::trigger",
                instance_id = %instance,
                identifier,
                "Duplicate notification resolved to existing instance"
            ),
        }
        Ok(instance)
    }
}
