//! Watch command implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use ps_client::{HttpBackend, StatusSynchronizer};
use ps_core::config::ClientConfig;
use ps_core::TransportMode;

use crate::output::{format_mode, print_info, print_state, print_success};

/// Run the status synchronizer and print every applied state.
///
/// Returns when `shutdown` fires, or once paired if `until_paired` is set.
pub async fn watch_command(
    config: ClientConfig,
    until_paired: bool,
    save_code: Option<PathBuf>,
    shutdown: CancellationToken,
) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(config.clone())?);
    let mut sync = StatusSynchronizer::new(backend, &config);
    let mut states = sync.subscribe();
    let mut modes = sync.watch_mode();

    print_info(&format!("Watching pairing status at {}", config.api_url));
    sync.start();

    let mut saved: Option<String> = None;
    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),

            changed = modes.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let mode = *modes.borrow_and_update();
                if mode != TransportMode::None {
                    print_info(&format_mode(mode));
                }
            }

            received = states.recv() => match received {
                Ok(state) => {
                    print_state(&state);

                    if let (Some(path), Some(code)) = (&save_code, state.code_payload()) {
                        if saved.as_deref() != Some(code) {
                            if let Err(e) = write_code(path, code) {
                                break Err(e);
                            }
                            saved = Some(code.to_string());
                        }
                    }

                    if until_paired && state.is_paired() {
                        print_success("Device paired");
                        break Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Status output fell behind");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    sync.stop().await;
    outcome
}

fn write_code(path: &Path, code: &str) -> Result<()> {
    std::fs::write(path, code)
        .with_context(|| format!("Failed to write pairing code to {:?}", path))?;
    print_success(&format!("Saved pairing code to {:?}", path));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code.txt");
        write_code(&path, "data:image/png;base64,AAAA").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn test_write_code_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("code.txt");
        assert!(write_code(&path, "x").is_err());
    }
}
