use server_api::ApiContext;
use shared::protocol::ServerEvent;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self { api, events }
    }

    /// Fans an event out to websocket subscribers. Having none is not an error.
    pub(crate) fn publish(&self, event: ServerEvent) {
        if let Err(error) = self.events.send(event) {
            debug!(event = ?error.0, "no subscribers for server event");
        }
    }
}
