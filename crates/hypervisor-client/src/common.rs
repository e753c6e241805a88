//! Common utilities shared by the platform clients

use crate::error::HypervisorError;
use crate::models::Credentials;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Build an HTTP client for the endpoint, trusting the configured CA bundle if any
pub fn build_http_client(credentials: &Credentials) -> Result<Client, HypervisorError> {
    let mut builder = Client::builder().timeout(Duration::from_secs(60));

    if let Some(pem) = &credentials.ca_cert {
        let certs = reqwest::Certificate::from_pem_bundle(pem.as_bytes())?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    Ok(builder.build()?)
}

/// Map a non-success response to a typed error
pub async fn check_status(response: Response, what: &str) -> Result<Response, HypervisorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            HypervisorError::Authentication(format!("{}: {} - {}", what, status, body))
        }
        StatusCode::NOT_FOUND => HypervisorError::NotFound(what.to_string()),
        _ => HypervisorError::Api(format!("{}: {} - {}", what, status, body)),
    })
}

/// Decode a JSON response, keeping the start of the body in the error
pub async fn decode_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, HypervisorError> {
    let response = check_status(response, what).await?;
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| {
        HypervisorError::InvalidResponse(format!(
            "{}: error decoding response body: {} - Response (first 500 chars): {}",
            what,
            e,
            text.chars().take(500).collect::<String>()
        ))
    })
}
