//! Dialogue engine
//!
//! Turns a user transcript into a stream of sentence-sized reply segments.
//! Checks exit phrases, then intent hooks, then asks the LLM (plain
//! streaming or function-calling per config). Segments go out as soon as
//! punctuation completes them so TTS can start before the LLM finishes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::intent::IntentRegistry;
use crate::protocol::strip_punctuation;
use crate::providers::{ChatMessage, LlmOutcome, Providers};
use crate::session::Session;

/// Canned reply when the LLM is unreachable
pub const APOLOGY_REPLY: &str = "抱歉，我现在有点走神了，请再说一遍。";

/// Reply used when an exit phrase closes the conversation
pub const GOODBYE_REPLY: &str = "好的，再见！";

/// What the engine produces for the speak pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// One sentence-sized slice of the reply
    Segment(String),
    /// The reply is complete; no more segments follow
    Done,
}

pub struct DialogueEngine {
    session: Arc<Session>,
    providers: Providers,
    intents: Arc<IntentRegistry>,
    /// user/assistant turns only; the system prompt is read from the
    /// session at call time so role switches take effect immediately
    history: Vec<ChatMessage>,
    max_turns: usize,
    exit_phrases: Vec<String>,
    function_mode: bool,
}

impl DialogueEngine {
    pub fn new(
        session: Arc<Session>,
        providers: Providers,
        intents: Arc<IntentRegistry>,
        config: &Config,
    ) -> Self {
        let exit_phrases = config
            .exit_commands
            .iter()
            .map(|p| strip_punctuation(p).to_lowercase())
            .collect();
        Self {
            session,
            providers,
            intents,
            history: Vec::new(),
            max_turns: config.max_history_turns,
            exit_phrases,
            function_mode: config.active_llm().mode == "function_call",
        }
    }

    pub fn is_exit_phrase(&self, text: &str) -> bool {
        let normalized = strip_punctuation(text).to_lowercase();
        !normalized.is_empty() && self.exit_phrases.iter().any(|p| p == &normalized)
    }

    /// Produce the reply for one transcript. Segments stream out on `tx`;
    /// a closed receiver means the reply was aborted and generation stops.
    pub async fn respond(&mut self, text: &str, tx: mpsc::Sender<ReplyEvent>) {
        if self.is_exit_phrase(text) {
            info!(session = %self.session.session_id, "exit phrase matched");
            self.session.close_after_reply.store(true, Ordering::SeqCst);
            let _ = tx.send(ReplyEvent::Segment(GOODBYE_REPLY.to_string())).await;
            let _ = tx.send(ReplyEvent::Done).await;
            return;
        }

        if let Some((hook, args)) = self.intents.claim(text) {
            info!(session = %self.session.session_id, "intent hook {:?} claimed transcript", hook.name());
            let reply = match hook.execute(&self.session, &args) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("intent hook failed: {e}");
                    APOLOGY_REPLY.to_string()
                }
            };
            self.push_turn(text, &reply);
            let _ = tx.send(ReplyEvent::Segment(reply)).await;
            let _ = tx.send(ReplyEvent::Done).await;
            return;
        }

        let reply = if self.function_mode && !self.intents.is_empty() {
            self.respond_with_functions(text, &tx).await
        } else {
            self.respond_plain(text, &tx).await
        };

        if let Some(reply) = reply {
            self.push_turn(text, &reply);
        }
        let _ = tx.send(ReplyEvent::Done).await;
    }

    /// Plain mode: stream deltas, emit segments as punctuation closes them
    async fn respond_plain(&mut self, text: &str, tx: &mpsc::Sender<ReplyEvent>) -> Option<String> {
        let messages = self.build_messages(text);
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(32);

        let llm = self.providers.llm.clone();
        let stream_task =
            tokio::spawn(async move { llm.chat_stream(&messages, delta_tx).await });

        let mut splitter = SentenceSplitter::new();
        while let Some(delta) = delta_rx.recv().await {
            for segment in splitter.push(&delta) {
                if tx.send(ReplyEvent::Segment(segment)).await.is_err() {
                    // reply aborted; let the stream task notice the closed
                    // delta channel and wind down
                    stream_task.abort();
                    return None;
                }
            }
        }

        match stream_task.await {
            Ok(Ok(full)) => {
                if let Some(tail) = splitter.finish() {
                    let _ = tx.send(ReplyEvent::Segment(tail)).await;
                }
                Some(full)
            }
            Ok(Err(e)) => {
                warn!("llm failure, sending apology: {e}");
                let _ = tx.send(ReplyEvent::Segment(APOLOGY_REPLY.to_string())).await;
                None
            }
            Err(e) => {
                warn!("llm task aborted: {e}");
                None
            }
        }
    }

    /// Function mode: one non-streamed turn; calls route through the
    /// intent registry and the hook's reply is spoken
    async fn respond_with_functions(
        &mut self,
        text: &str,
        tx: &mpsc::Sender<ReplyEvent>,
    ) -> Option<String> {
        let messages = self.build_messages(text);
        let schemas = self.intents.schemas();

        match self
            .providers
            .llm
            .chat_with_functions(&messages, &schemas)
            .await
        {
            Ok(LlmOutcome::Text(reply)) => {
                let mut splitter = SentenceSplitter::new();
                for segment in splitter.push(&reply).into_iter().chain(splitter.finish()) {
                    if tx.send(ReplyEvent::Segment(segment)).await.is_err() {
                        return None;
                    }
                }
                Some(reply)
            }
            Ok(LlmOutcome::FunctionCall { name, arguments }) => {
                let reply = match self.intents.get(&name) {
                    Some(hook) => match hook.execute(&self.session, &arguments) {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!("function {name:?} failed: {e}");
                            APOLOGY_REPLY.to_string()
                        }
                    },
                    None => {
                        warn!("llm called unknown function {name:?}");
                        APOLOGY_REPLY.to_string()
                    }
                };
                let _ = tx.send(ReplyEvent::Segment(reply.clone())).await;
                Some(reply)
            }
            Err(e) => {
                warn!("llm failure, sending apology: {e}");
                let _ = tx.send(ReplyEvent::Segment(APOLOGY_REPLY.to_string())).await;
                None
            }
        }
    }

    fn build_messages(&self, user_text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.session.system_prompt()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(user_text));
        messages
    }

    fn push_turn(&mut self, user: &str, assistant: &str) {
        self.history.push(ChatMessage::user(user));
        self.history.push(ChatMessage::assistant(assistant));
        while self.history.len() > self.max_turns {
            self.history.remove(0);
        }
    }

    #[cfg(test)]
    fn history(&self) -> &[ChatMessage] {
        &self.history
    }
}

/// Incremental sentence segmentation over streamed deltas
pub struct SentenceSplitter {
    buffer: String,
}

/// Flush at a pause mark once the pending segment is at least this long
const LONG_SEGMENT_CHARS: usize = 100;

impl SentenceSplitter {
    pub fn new() -> Self {
        Self { buffer: String::new() }
    }

    /// Feed a delta; returns the segments it completed
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut segments = Vec::new();
        for ch in delta.chars() {
            self.buffer.push(ch);
            let terminal = matches!(ch, '。' | '！' | '？' | '.' | '!' | '?');
            let pause = matches!(ch, '，' | ',' | '；' | ';');
            let long = self.buffer.chars().count() >= LONG_SEGMENT_CHARS;
            if terminal || (pause && long) {
                let segment = self.buffer.trim().to_string();
                self.buffer.clear();
                // a bare punctuation mark is not a sentence
                if segment.chars().count() > 1 {
                    segments.push(segment);
                }
            }
        }
        segments
    }

    /// Whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        let tail = self.buffer.trim().to_string();
        self.buffer.clear();
        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self::new()
    }
}
