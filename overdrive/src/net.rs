//! Loopback POST to the agent, optionally sealed with the machine-id key.

use crate::config::AgentEndpoint;
use crate::request::OptimizationRequest;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

pub async fn read_machine_id() -> Option<String> {
    match tokio::fs::read_to_string("/etc/machine-id").await {
        Ok(id) => {
            let id = id.trim().to_string();
            (!id.is_empty()).then_some(id)
        }
        Err(_) => None,
    }
}

fn encrypt(plaintext: &str, machine_id: &str) -> Option<String> {
    let key: [u8; 32] = Sha256::digest(machine_id.as_bytes()).into();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext.as_bytes()).ok()?;

    let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Some(BASE64.encode(sealed))
}

pub async fn send(
    request: &OptimizationRequest,
    endpoint: &AgentEndpoint,
    machine_id: Option<&str>,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(request)?;

    let (body, content_type) = match machine_id {
        Some(id) => match encrypt(&json, id) {
            Some(sealed) => (sealed, "application/x-www-form-urlencoded"),
            None => anyhow::bail!("could not encrypt the request payload"),
        },
        None => (json, "application/json"),
    };

    info!("sending optimization request for pid '{}'", request.pid);
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/", endpoint.port))
        .header("Content-Type", content_type)
        .body(body)
        .send()
        .await;

    match response {
        Ok(response) => match response.status().as_u16() {
            200 | 202 => debug!("request successfully sent for pid '{}'", request.pid),
            401 => warn!(
                "unauthorized request. Optimizations will not be performed for pid '{}'",
                request.pid
            ),
            status => error!(
                "unexpected response for the request (pid: {}, status: {status})",
                request.pid
            ),
        },
        Err(e) => {
            eprintln!(
                "[overdrive] Request for pid '{}' could not reach the agent. It may not be running: {e}",
                request.pid
            );
        }
    }
    Ok(())
}
