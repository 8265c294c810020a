use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::Value;

use loanflow_core::resilience::{
    Method, Transport, TransportError, TransportRequest, TransportResponse,
};

const USER_AGENT: &str = concat!("loanflow/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed transport. Every HTTP status comes back as a response; only
/// connection, timeout and decode problems are errors.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .timeout(request.timeout);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response =
            builder.send().await.map_err(|error| classify(&error, request.timeout))?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|error| classify(&error, request.timeout))?;

        Ok(TransportResponse { status, body: decode_body(&text, status)? })
    }
}

fn classify(error: &reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout { after: timeout }
    } else if error.is_decode() || error.is_body() {
        TransportError::Decode(error.to_string())
    } else {
        TransportError::Connect(error.to_string())
    }
}

/// Successful bodies must be JSON. Error bodies are kept as text when they are not.
fn decode_body(text: &str, status: u16) -> Result<Value, TransportError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(text) {
        Ok(body) => Ok(body),
        Err(_) if !(200..300).contains(&status) => Ok(Value::String(text.to_string())),
        Err(error) => Err(TransportError::Decode(error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::decode_body;
    use loanflow_core::resilience::TransportError;

    #[test]
    fn json_bodies_are_parsed() {
        assert_eq!(decode_body(r#"{"credit_score": 780}"#, 200), Ok(json!({"credit_score": 780})));
        assert_eq!(decode_body("  ", 204), Ok(serde_json::Value::Null));
    }

    #[test]
    fn non_json_success_is_a_decode_error() {
        assert!(matches!(decode_body("<html>", 200), Err(TransportError::Decode(_))));
        assert_eq!(decode_body("bad gateway", 502), Ok(json!("bad gateway")));
    }
}
