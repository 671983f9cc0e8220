//! One-shot status and health commands

use anyhow::{Context, Result};

use ps_client::{Backend, HttpBackend};
use ps_core::config::ClientConfig;

use crate::output::{print_error, print_info, print_state, print_success, print_warning};

/// Fetch the pairing status once, plus the pairing code when one is needed
pub async fn status_command(config: ClientConfig, json: bool) -> Result<()> {
    let backend = HttpBackend::new(config.clone())?;

    let mut state = match backend.fetch_status().await {
        Ok(state) => state,
        Err(e) => {
            print_error(&format!("Failed to fetch status from {}: {}", config.api_url, e));
            return Err(e).context("Status request failed");
        }
    };

    if state.needs_pairing_code() {
        match backend.fetch_pairing_code().await {
            Ok(Some(code)) => {
                if let Some(with_code) = state.with_code(code) {
                    state = with_code;
                }
            }
            Ok(None) => tracing::debug!("Backend has no pairing code yet"),
            Err(e) => print_warning(&format!("Failed to fetch pairing code: {}", e)),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_state(&state);
        if state.needs_pairing_code() {
            print_info("Run 'pairsync watch' to wait for the code");
        }
    }

    Ok(())
}

/// Check that the backend answers on its root endpoint
pub async fn health_command(config: ClientConfig) -> Result<()> {
    let backend = HttpBackend::new(config.clone())?;

    let health = backend
        .health()
        .await
        .with_context(|| format!("Backend at {} is unreachable", config.api_url))?;

    let detail = health.message.clone().unwrap_or_default();
    if health.is_ok() {
        print_success(&format!("Backend is up ({}) {}", health.status, detail));
        Ok(())
    } else {
        print_error(&format!("Backend reported {} {}", health.status, detail));
        anyhow::bail!("Backend is unhealthy")
    }
}
