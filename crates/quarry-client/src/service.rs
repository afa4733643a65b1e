use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use quarry_core::error::AppError;
use quarry_core::registry::ServiceDescriptor;
use quarry_core::traits::ServiceInvoker;
use reqwest::Client;

use crate::http;

/// Invokes internal services by POSTing the JSON payload to
/// `{address}/{operation}`, forwarding the given headers.
#[derive(Clone)]
pub struct HttpServiceInvoker {
    client: Client,
    timeout: Duration,
}

impl HttpServiceInvoker {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: http::build_client(timeout)?,
            timeout,
        })
    }
}

#[async_trait]
impl ServiceInvoker for HttpServiceInvoker {
    async fn invoke(
        &self,
        service: &ServiceDescriptor,
        operation: &str,
        payload: &serde_json::Value,
        headers: &HashMap<String, String>,
    ) -> Result<serde_json::Value, AppError> {
        let url = format!(
            "{}/{}",
            service.address.trim_end_matches('/'),
            operation.trim_start_matches('/')
        );

        let mut request = self.client.post(&url).json(payload);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| http::send_error(&service.name, e, self.timeout))?;
        let response = http::check_status(&service.name, response).await?;
        http::read_json(&service.name, response).await
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use quarry_core::registry::{NewService, ServiceRegistry};
    use serde_json::json;

    use super::*;

    fn descriptor(address: &str) -> ServiceDescriptor {
        ServiceRegistry::new().register_service(
            NewService::new("matcher", address, "1.0").with_capability("job-matching"),
        )
    }

    #[tokio::test]
    async fn posts_payload_with_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/match")
            .match_header("traceparent", "00-abc-def-01")
            .match_body(Matcher::Json(json!({"profile_keywords": ["rust"]})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"matches": []}"#)
            .create_async()
            .await;

        let headers = HashMap::from([("traceparent".to_string(), "00-abc-def-01".to_string())]);
        let value = HttpServiceInvoker::new()
            .unwrap()
            .invoke(
                &descriptor(&format!("{}/", server.url())),
                "match",
                &json!({"profile_keywords": ["rust"]}),
                &headers,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(value, json!({"matches": []}));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/match")
            .with_status(502)
            .create_async()
            .await;

        let err = HttpServiceInvoker::new()
            .unwrap()
            .invoke(&descriptor(&server.url()), "match", &json!({}), &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.should_trip_circuit());
    }
}
