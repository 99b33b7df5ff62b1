// ── Command API ──
//
// Every write to the hub flows through the `Command` enum. Commands are
// queued on the session's channel and executed by its command processor,
// so callers never hold a reference to the connection itself.

use std::sync::Arc;

use homesync_api::{HubConnection, ServiceCall};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CoreError;

/// A command envelope sent through the command channel.
/// Contains the command and a oneshot response channel.
pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub response_tx: tokio::sync::oneshot::Sender<Result<CommandResult, CoreError>>,
}

/// All write operations against the hub.
#[derive(Debug, Clone)]
pub enum Command {
    CallService(ServiceCall),
    FireEvent {
        event_type: String,
        data: Option<Value>,
    },
}

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Ok,
    /// Response payload of a service called with `return_response`.
    Response(Value),
}

impl CommandResult {
    pub fn into_response(self) -> Option<Value> {
        match self {
            Self::Ok => None,
            Self::Response(value) => Some(value),
        }
    }
}

pub(crate) async fn command_processor_task(
    connection: Arc<dyn HubConnection>,
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<CommandEnvelope>,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let result = route_command(connection.as_ref(), envelope.command).await;
                let _ = envelope.response_tx.send(result);
            }
        }
    }
    debug!("command processor stopped");
}

async fn route_command(
    connection: &dyn HubConnection,
    command: Command,
) -> Result<CommandResult, CoreError> {
    match command {
        Command::CallService(call) => {
            debug!(domain = %call.domain, service = %call.service, "calling service");
            let response = connection.call_service(call).await?;
            Ok(response.map_or(CommandResult::Ok, CommandResult::Response))
        }
        Command::FireEvent { event_type, data } => {
            debug!(event_type = %event_type, "firing event");
            connection.fire_event(event_type, data).await?;
            Ok(CommandResult::Ok)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use homesync_api::{FailPoint, MemoryConnection, ServiceTarget};
    use serde_json::json;
    use tokio::sync::oneshot;

    async fn run(
        connection: Arc<MemoryConnection>,
        command: Command,
    ) -> Result<CommandResult, CoreError> {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let processor = tokio::spawn(command_processor_task(connection, cancel.clone(), rx));

        let (response_tx, response_rx) = oneshot::channel();
        tx.send(CommandEnvelope {
            command,
            response_tx,
        })
        .await
        .unwrap();
        let result = response_rx.await.unwrap();

        cancel.cancel();
        processor.await.unwrap();
        result
    }

    #[tokio::test]
    async fn routes_service_calls_with_response() {
        let connection = Arc::new(MemoryConnection::new());
        connection.respond_with("weather", "get_forecasts", json!({"temperature": 21}));

        let call = ServiceCall {
            domain: "weather".into(),
            service: "get_forecasts".into(),
            target: Some(ServiceTarget::from_entity("weather.home")),
            data: None,
            return_response: true,
        };
        let result = run(Arc::clone(&connection), Command::CallService(call)).await;
        assert_eq!(
            result.unwrap().into_response(),
            Some(json!({"temperature": 21}))
        );
        assert_eq!(connection.service_calls().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_is_translated() {
        let connection = Arc::new(MemoryConnection::new());
        connection.fail_next(FailPoint::FireEvent);
        let result = run(
            connection,
            Command::FireEvent {
                event_type: "doorbell".into(),
                data: None,
            },
        )
        .await;
        assert!(result.is_err());
    }
}
