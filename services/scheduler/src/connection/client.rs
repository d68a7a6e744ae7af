//! HTTP client for the resource manager's scheduler endpoint.

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use halyard_proto::{Call, FrameworkInfo, STREAM_ID_HEADER};
use reqwest::StatusCode;
use tracing::{debug, error};

use super::{ConnectionError, LineReader};
use crate::config::Config;

/// Body stream of an open subscription.
pub type EventStream = BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>;

/// An open SUBSCRIBE response.
pub struct Subscription {
    /// Value of the `Mesos-Stream-Id` response header.
    pub stream_id: String,
    pub lines: LineReader<EventStream>,
}

/// Scheduler endpoint client.
#[derive(Clone)]
pub struct MasterClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl MasterClient {
    /// No overall request timeout is set on the underlying client because
    /// the subscribe response body is open-ended. Each call bounds itself.
    pub fn new(config: &Config) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint: config.scheduler_endpoint(),
            username: config.master_username.clone(),
            password: config.master_password.clone(),
            timeout: config.request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post(&self) -> reqwest::RequestBuilder {
        let request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json");
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// Send SUBSCRIBE and wait for the response headers.
    pub async fn subscribe(&self, info: FrameworkInfo) -> Result<Subscription, ConnectionError> {
        let call = Call::subscribe(info);
        debug!(endpoint = %self.endpoint, framework_id = ?call.framework_id, "Subscribing");

        let response = tokio::time::timeout(self.timeout, self.post().json(&call).send())
            .await
            .map_err(|_| ConnectionError::Timeout {
                operation: "subscribe",
                after: self.timeout,
            })??;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Subscribe rejected");
            return Err(ConnectionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream_id = response
            .headers()
            .get(STREAM_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(ConnectionError::MissingStreamId)?;

        Ok(Subscription {
            stream_id,
            lines: LineReader::new(response.bytes_stream().boxed()),
        })
    }

    /// Send one non-subscribe call on the session identified by `stream_id`.
    pub async fn call(&self, call: &Call, stream_id: &str) -> Result<(), ConnectionError> {
        let request = self
            .post()
            .header(STREAM_ID_HEADER, stream_id)
            .timeout(self.timeout)
            .json(call);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectionError::Timeout {
                    operation: "call",
                    after: self.timeout,
                }
            } else {
                ConnectionError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(call = ?call.kind, status = %status, "Call accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_proto::{FrameworkId, TaskIdValue};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> MasterClient {
        let config = Config {
            master_url: server.uri(),
            master_username: "sched".to_string(),
            master_password: "secret".to_string(),
            ..Config::default()
        };
        MasterClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_call_carries_stream_id_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/scheduler"))
            .and(header(STREAM_ID_HEADER, "stream-7"))
            .and(header("authorization", "Basic c2NoZWQ6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let call = Call::kill(FrameworkId::new("fw"), TaskIdValue::new("task_1"), None);
        client_for(&server).call(&call, "stream-7").await.unwrap();
    }

    #[tokio::test]
    async fn test_call_rejection_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad call"))
            .mount(&server)
            .await;

        let call = Call::revive(FrameworkId::new("fw"));
        let err = client_for(&server).call(&call, "s").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Status { status: 400, ref body } if body == "bad call"));
    }

    #[tokio::test]
    async fn test_subscribe_requires_stream_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"type\":\"HEARTBEAT\"}\n"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.subscribe(Config::default().framework_info()).await;
        assert!(matches!(result, Err(ConnectionError::MissingStreamId)));
    }

    #[tokio::test]
    async fn test_subscribe_returns_stream_id_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/scheduler"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(STREAM_ID_HEADER, "abc")
                    .set_body_string("{\"type\":\"HEARTBEAT\"}\n"),
            )
            .mount(&server)
            .await;

        let mut sub = client_for(&server)
            .subscribe(Config::default().framework_info())
            .await
            .unwrap();
        assert_eq!(sub.stream_id, "abc");
        assert_eq!(
            sub.lines.next_line().await.unwrap().as_deref(),
            Some(&b"{\"type\":\"HEARTBEAT\"}"[..])
        );
        assert_eq!(sub.lines.next_line().await.unwrap(), None);
    }
}
