//! `GET /api/events`: the live event stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::GatewayState;
use crate::hub::Frame;

/// Render one hub frame as an SSE event.
pub fn frame_to_event(frame: Frame) -> Event {
    match frame {
        Frame::Retry(delay) => Event::default().retry(delay),
        Frame::Comment(text) => Event::default().comment(text),
        Frame::Event(event) => Event::default()
            .event(event.name())
            .data(event.to_payload().to_string()),
    }
}

pub async fn events_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let subscription = match state.hub.subscribe() {
        Ok(sub) => sub,
        Err(e) => {
            warn!("Rejecting event stream: {e}");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    debug!(subscriber = subscription.id(), "Event stream opened");

    let stream = subscription.map(|frame| Ok::<_, Infallible>(frame_to_event(frame)));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cronpilot_cron::manager::CronManager;
    use cronpilot_cron::memory::MemoryCrontab;
    use cronpilot_cron::wrapper::WrapperCodec;
    use cronpilot_exec::JobRunner;

    use crate::hub::BroadcastHub;

    fn state(hub: BroadcastHub) -> Arc<GatewayState> {
        let manager = Arc::new(CronManager::new(
            Arc::new(MemoryCrontab::new(vec!["root".into()])),
            WrapperCodec::new("/opt/cronpilot/cron-log-wrapper.sh"),
        ));
        let runner = Arc::new(JobRunner::new(
            manager.clone(),
            Arc::new(hub.clone()),
            std::env::temp_dir(),
        ));
        Arc::new(GatewayState {
            manager,
            runner,
            hub,
            auth_token: None,
        })
    }

    #[tokio::test]
    async fn test_stream_headers_and_lifetime() {
        let hub = BroadcastHub::new(Duration::from_secs(60), Duration::from_millis(3000), 16);
        hub.start();
        let response = events_handler(State(state(hub.clone()))).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert_eq!(hub.subscriber_count(), 1);

        // Client abort drops the body and with it the subscription.
        drop(response);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_hub_rejects_streams() {
        let hub = BroadcastHub::new(Duration::from_secs(60), Duration::from_millis(3000), 16);
        let response = events_handler(State(state(hub))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
