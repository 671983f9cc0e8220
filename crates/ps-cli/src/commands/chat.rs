//! Chat command implementation
//!
//! Streams replies over the chat channel by default. Interactive sessions
//! keep the conversation history and recreate the channel with backoff when
//! it drops between turns.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use ps_client::{ExponentialBackoff, HttpBackend, ReplyEvent, ReplyStreamConsumer, TurnHandle};
use ps_core::config::ClientConfig;
use ps_core::{Conversation, Message, ReplyStream, SyncError, TurnState};
use ps_protocol::ChatResponse;

use crate::output::{print_error, print_fragment, print_info, print_warning};

type Consumer = ReplyStreamConsumer<HttpBackend>;

/// Outcome of one turn as seen by the command
enum TurnOutcome {
    Replied(String),
    Failed(String),
    Interrupted,
}

/// Run one chat turn with `message`, or an interactive session without one
pub async fn chat_command(
    config: ClientConfig,
    message: Option<String>,
    no_stream: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(config.clone())?);
    let mut session = ChatSession {
        consumer: (!no_stream).then(|| ReplyStreamConsumer::new(Arc::clone(&backend), &config)),
        backend,
        backoff: ExponentialBackoff::from_config(&config.backoff),
        history: Conversation::new(),
        shutdown,
    };

    let result = match message {
        Some(message) => session.single(&message).await,
        None => session.interactive().await,
    };

    if let Some(consumer) = session.consumer.as_mut() {
        consumer.close();
    }
    result
}

struct ChatSession {
    backend: Arc<HttpBackend>,
    /// `None` when using the request/response endpoint
    consumer: Option<Consumer>,
    backoff: ExponentialBackoff,
    history: Conversation,
    shutdown: CancellationToken,
}

impl ChatSession {
    async fn single(&mut self, message: &str) -> Result<()> {
        let message = message.trim();
        if message.is_empty() {
            anyhow::bail!("Message is empty");
        }

        match self.turn(message).await? {
            TurnOutcome::Replied(_) | TurnOutcome::Interrupted => Ok(()),
            TurnOutcome::Failed(reason) => {
                print_error(&format!("Reply failed: {}", reason));
                anyhow::bail!("Chat turn failed")
            }
        }
    }

    async fn interactive(&mut self) -> Result<()> {
        print_info("Type a message and press Enter. Ctrl+D to quit.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print_fragment("> ");
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line.context("Failed to read from stdin")?,
            };
            let Some(line) = line else {
                break;
            };

            let message = line.trim();
            if message.is_empty() {
                continue;
            }

            match self.turn(message).await? {
                TurnOutcome::Replied(reply) => self.history.record_turn(message, reply),
                TurnOutcome::Failed(reason) => print_error(&format!("Reply failed: {}", reason)),
                TurnOutcome::Interrupted => break,
            }
        }

        println!();
        Ok(())
    }

    async fn turn(&mut self, message: &str) -> Result<TurnOutcome> {
        if self.consumer.is_none() {
            return self.request_response(message).await;
        }

        let handle = match self.start_turn(message).await {
            Ok(handle) => handle,
            Err(e) if e.is_channel_error() => {
                print_warning(&format!("Chat channel unavailable: {}", e));
                if !self.reconnect().await? {
                    return Ok(TurnOutcome::Interrupted);
                }
                self.start_turn(message)
                    .await
                    .context("Failed to start chat turn")?
            }
            Err(e) => return Err(e).context("Failed to start chat turn"),
        };

        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(TurnOutcome::Interrupted),
            stream = print_reply(handle) => stream,
        };
        Ok(match stream.state() {
            TurnState::Completed => TurnOutcome::Replied(stream.text()),
            _ => TurnOutcome::Failed(stream.error().unwrap_or("unknown error").to_string()),
        })
    }

    async fn start_turn(&mut self, message: &str) -> Result<TurnHandle, SyncError> {
        let history: &[Message] = self.history.messages();
        match self.consumer.as_mut() {
            Some(consumer) => consumer.start_turn(message, history).await,
            None => Err(SyncError::ChannelNotOpen),
        }
    }

    /// Recreate the chat channel, backing off between attempts.
    ///
    /// Returns `false` if interrupted by shutdown.
    async fn reconnect(&mut self) -> Result<bool> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Ok(true);
        };

        loop {
            let error = match consumer.reconnect().await {
                Ok(()) => {
                    self.backoff.reset();
                    print_info("Chat channel reconnected");
                    return Ok(true);
                }
                Err(e) => e,
            };

            let Some(delay) = self.backoff.next_delay() else {
                anyhow::bail!(
                    "Giving up on the chat channel after {} attempts: {}",
                    self.backoff.attempts(),
                    error
                );
            };
            print_warning(&format!(
                "Reconnect failed ({}), retrying in {:.1}s",
                error,
                delay.as_secs_f64()
            ));

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn request_response(&self, message: &str) -> Result<TurnOutcome> {
        let reply: ChatResponse = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(TurnOutcome::Interrupted),
            reply = self.backend.send_chat(message, self.history.messages()) => {
                reply.context("Chat request failed")?
            }
        };

        if !reply.success {
            return Ok(TurnOutcome::Failed(reply.response));
        }
        println!("{}", reply.response);
        Ok(TurnOutcome::Replied(reply.response))
    }
}

/// Print fragments as they arrive and return the finished stream
async fn print_reply(mut handle: TurnHandle) -> ReplyStream {
    while let Some(event) = handle.next_event().await {
        match event {
            ReplyEvent::Fragment(text) => print_fragment(&text),
            ReplyEvent::Completed(_) => println!(),
            ReplyEvent::Failed(_) => {
                if !handle.stream().fragments().is_empty() {
                    println!();
                }
            }
        }
    }
    handle.stream().clone()
}
