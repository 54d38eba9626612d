//! HTTP implementations of the emitters

use super::{CrashReportSink, RouteEmitter};
use crate::error::EmitError;
use crate::models::{CrashReport, RouteMessage};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

fn build_client(timeout: Duration) -> Result<Client, EmitError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Base URLs must end in a slash for `Url::join` to append instead of replace
fn base_url(endpoint: &str) -> Result<Url, EmitError> {
    let mut url = Url::parse(endpoint)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

async fn post_json<B: Serialize + ?Sized>(
    client: &Client,
    url: Url,
    body: &B,
) -> Result<(), EmitError> {
    let response = client.post(url.clone()).json(body).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(EmitError::Status {
            endpoint: url.to_string(),
            status: status.as_u16(),
        });
    }

    Ok(())
}

/// Route emitter posting to a message-bus HTTP gateway
///
/// Each message goes to `<endpoint>/<subject>`, so registrations land on
/// `router.register` and removals on `router.unregister`.
pub struct HttpRouteEmitter {
    client: Client,
    base_url: Url,
}

impl HttpRouteEmitter {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, EmitError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url(endpoint)?,
        })
    }
}

#[async_trait]
impl RouteEmitter for HttpRouteEmitter {
    async fn publish(&self, message: &RouteMessage) -> Result<(), EmitError> {
        let url = self.base_url.join(message.action.subject())?;
        debug!(
            subject = message.action.subject(),
            app = %message.app,
            instance = %message.private_instance_id,
            "Publishing route message"
        );
        post_json(&self.client, url, message).await
    }
}

/// Crash sink posting to the controller's internal API
pub struct CloudControllerCrashSink {
    client: Client,
    base_url: Url,
}

impl CloudControllerCrashSink {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, EmitError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url(endpoint)?,
        })
    }
}

#[async_trait]
impl CrashReportSink for CloudControllerCrashSink {
    async fn notify(&self, report: &CrashReport) -> Result<(), EmitError> {
        let url = self.base_url.join(&format!(
            "internal/v4/apps/{}/crashed",
            report.process_guid
        ))?;
        debug!(
            process_guid = %report.process_guid,
            index = report.index,
            "Reporting crash"
        );
        post_json(&self.client, url, report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RouteAction;
    use mockito::Matcher;
    use serde_json::json;

    fn route_message(action: RouteAction) -> RouteMessage {
        RouteMessage {
            action,
            host: "10.0.0.7".to_string(),
            port: 8080,
            uris: vec!["dora.example.com".to_string()],
            app: "app-guid".to_string(),
            private_instance_id: "dora-dev-abc-0".to_string(),
            private_instance_index: "0".to_string(),
        }
    }

    fn crash_report() -> CrashReport {
        CrashReport {
            process_guid: "app-v1".to_string(),
            reason: "CrashLoopBackOff".to_string(),
            instance: "dora-dev-abc-0".to_string(),
            index: 0,
            exit_status: 1,
            exit_description: "better luck next time".to_string(),
            crash_count: 3,
            crash_timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_register_posts_to_register_subject() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/nats/router.register")
            .match_body(Matcher::Json(json!({
                "host": "10.0.0.7",
                "port": 8080,
                "uris": ["dora.example.com"],
                "app": "app-guid",
                "private_instance_id": "dora-dev-abc-0",
                "private_instance_index": "0"
            })))
            .with_status(200)
            .create_async()
            .await;

        let emitter =
            HttpRouteEmitter::new(&format!("{}/nats", server.url()), Duration::from_secs(1))
                .unwrap();
        emitter
            .publish(&route_message(RouteAction::Register))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unregister_posts_to_unregister_subject() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/router.unregister")
            .with_status(204)
            .create_async()
            .await;

        let emitter = HttpRouteEmitter::new(&server.url(), Duration::from_secs(1)).unwrap();
        emitter
            .publish(&route_message(RouteAction::Unregister))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/router.register")
            .with_status(503)
            .create_async()
            .await;

        let emitter = HttpRouteEmitter::new(&server.url(), Duration::from_secs(1)).unwrap();
        let err = emitter
            .publish(&route_message(RouteAction::Register))
            .await
            .unwrap_err();

        assert!(matches!(err, EmitError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_crash_sink_posts_report() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/internal/v4/apps/app-v1/crashed")
            .match_body(Matcher::PartialJson(json!({
                "process_guid": "app-v1",
                "reason": "CrashLoopBackOff",
                "index": 0,
                "crash_count": 3
            })))
            .with_status(200)
            .create_async()
            .await;

        let sink = CloudControllerCrashSink::new(&server.url(), Duration::from_secs(1)).unwrap();
        sink.notify(&crash_report()).await.unwrap();

        mock.assert_async().await;
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let result = HttpRouteEmitter::new("not a url", Duration::from_secs(1));
        assert!(matches!(result, Err(EmitError::Endpoint(_))));
    }
}
