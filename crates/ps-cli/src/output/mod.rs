//! Terminal output helpers
//!
//! Colored status lines and human-readable renderings of pairing state.

use std::io::Write;

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use ps_core::{ConnectionState, PairingStatus, TransportMode};

/// Longest code payload prefix shown inline
const CODE_PREVIEW_LEN: usize = 32;

fn print_tagged(mut out: impl Write, color: Color, symbol: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(symbol),
        Print(" "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    print_tagged(std::io::stdout(), Color::Green, "✓", msg);
}

/// Print an error message to stderr in red
pub fn print_error(msg: &str) {
    print_tagged(std::io::stderr(), Color::Red, "✗", msg);
}

/// Print a warning message to stderr in yellow
pub fn print_warning(msg: &str) {
    print_tagged(std::io::stderr(), Color::Yellow, "⚠", msg);
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    print_tagged(std::io::stdout(), Color::Cyan, "ℹ", msg);
}

/// Print one reply fragment without a trailing newline
pub fn print_fragment(fragment: &str) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(fragment.as_bytes());
    let _ = stdout.flush();
}

/// Print a pairing state with a status-colored marker
pub fn print_state(state: &ConnectionState) {
    let color = match state.status() {
        PairingStatus::Paired => Color::Green,
        PairingStatus::AwaitingPairing => Color::Yellow,
        PairingStatus::Initializing => Color::Cyan,
        PairingStatus::Error => Color::Red,
    };
    print_tagged(std::io::stdout(), color, "●", &format_state(state));
}

/// One-line summary of a pairing state
pub fn format_state(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Initializing { detail: Some(detail) } => {
            format!("Initializing: {}", detail)
        }
        ConnectionState::Initializing { detail: None } => "Initializing".to_string(),
        ConnectionState::AwaitingPairing {
            code_payload: Some(code),
        } => format!("Awaiting pairing, code {}", format_code(code)),
        ConnectionState::AwaitingPairing { code_payload: None } => {
            "Awaiting pairing, waiting for code".to_string()
        }
        ConnectionState::Paired => "Paired".to_string(),
        ConnectionState::Error { message } => format!("Error: {}", message),
    }
}

/// Short description of a transport mode switch
pub fn format_mode(mode: TransportMode) -> String {
    match mode {
        TransportMode::Push => "Receiving updates over the push channel".to_string(),
        TransportMode::Poll => "Push channel unavailable, polling".to_string(),
        TransportMode::None => "Transports stopped".to_string(),
    }
}

/// Truncated preview of an image-encoded pairing code.
///
/// Rendering the image is left to other front ends.
pub fn format_code(code: &str) -> String {
    match code.char_indices().nth(CODE_PREVIEW_LEN) {
        Some((cut, _)) => format!("{}... ({} bytes)", &code[..cut], code.len()),
        None => code.to_string(),
    }
}
