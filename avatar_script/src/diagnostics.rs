use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::LoggingConfig;
use crate::error::{ScriptError, OVERRUN_MESSAGE};
use crate::lock;
use crate::participant::Participant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Blue,
    White,
    Red,
    DarkRed,
}

/// One run of text sharing a style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Span {
    pub text: String,
    pub color: Option<Color>,
    pub bold: bool,
    pub italic: bool,
}

impl Span {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: None,
            bold: false,
            italic: false,
        }
    }

    pub fn colored(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    pub fn italic(mut self) -> Self {
        self.italic = true;
        self
    }
}

/// A chat line as a sequence of styled spans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StyledText {
    pub spans: Vec<Span>,
}

impl StyledText {
    pub fn new(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    pub fn plain_text(&self) -> String {
        self.spans.iter().map(|span| span.text.as_str()).collect()
    }
}

impl From<Span> for StyledText {
    fn from(span: Span) -> Self {
        Self { spans: vec![span] }
    }
}

/// Host chat surface receiving user-visible diagnostics.
pub trait FeedbackSink: Send + Sync {
    fn emit(&self, text: StyledText);
}

impl fmt::Debug for dyn FeedbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FeedbackSink")
    }
}

/// Keeps every emitted line; used by tests and the session summary.
#[derive(Clone, Default)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<StyledText>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<StyledText> {
        lock(&self.lines).clone()
    }

    pub fn plain_lines(&self) -> Vec<String> {
        lock(&self.lines).iter().map(StyledText::plain_text).collect()
    }
}

impl FeedbackSink for RecordingSink {
    fn emit(&self, text: StyledText) {
        lock(&self.lines).push(text);
    }
}

/// Prints chat lines to stdout, prefixed with the chat tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl FeedbackSink for ConsoleSink {
    fn emit(&self, text: StyledText) {
        println!("[chat] {}", text.plain_text());
    }
}

fn lua_tag() -> Span {
    Span::plain("[lua] ").colored(Color::Blue).italic()
}

/// Routes script output and failures for one instance to chat and the developer log.
#[derive(Debug)]
pub struct Diagnostics {
    participant: Participant,
    config: LoggingConfig,
    sink: Arc<dyn FeedbackSink>,
}

impl Diagnostics {
    pub fn new(participant: Participant, config: LoggingConfig, sink: Arc<dyn FeedbackSink>) -> Self {
        Self {
            participant,
            config,
            sink,
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Whether script output from this instance is shown at all.
    pub fn should_log(&self) -> bool {
        self.participant.is_local || self.config.log_others
    }

    /// `log(value)` from a script.
    pub fn script_message(&self, message: &str) {
        if !self.should_log() {
            return;
        }
        let name = &self.participant.display_name;
        if self.config.script_log.to_developer_log() {
            log::info!("[lua] {name} > {message}");
        }
        if self.config.script_log.to_chat() {
            self.sink.emit(StyledText::new(vec![
                lua_tag(),
                Span::plain(name.clone()).colored(Color::White),
                Span::plain(format!(" > {message}")),
            ]));
        }
    }

    /// `logTableContent(table)`: a header followed by pre-rendered table lines.
    pub fn script_table(&self, lines: &[String]) {
        if !self.should_log() {
            return;
        }
        let name = &self.participant.display_name;
        if self.config.script_log.to_developer_log() {
            log::info!("[lua] {name} >");
        }
        if self.config.script_log.to_chat() {
            self.sink.emit(StyledText::new(vec![
                lua_tag(),
                Span::plain(name.clone()).colored(Color::White),
                Span::plain(" >"),
            ]));
        }
        for line in lines {
            if self.config.script_log.to_developer_log() {
                log::info!("{line}");
            }
            if self.config.script_log.to_chat() {
                self.sink.emit(Span::plain(line.clone()).italic().into());
            }
        }
    }

    /// Chat notice for an instruction budget overrun. The developer log always
    /// records it.
    pub fn budget_overrun(&self, limit: u64) {
        log::warn!(
            "[avatar_script] {} ({}) exceeded its instruction budget of {limit}",
            self.participant.display_name,
            self.participant.id
        );
        if !self.should_log() {
            return;
        }
        self.sink.emit(StyledText::new(vec![
            lua_tag(),
            Span::plain(self.participant.display_name.clone())
                .colored(Color::DarkRed)
                .bold(),
            Span::plain(format!(" > {OVERRUN_MESSAGE}")),
        ]));
    }

    /// Renders a script failure. Only the local participant sees it in chat.
    pub fn log_error(&self, error: &ScriptError) {
        if !self.participant.is_local {
            if error.is_fatal() {
                log::warn!("[avatar_script] {} aborted: {error}", self.participant.id);
            } else {
                log::debug!(
                    "[avatar_script] suppressed error from {}: {error}",
                    self.participant.id
                );
            }
            return;
        }
        if matches!(error, ScriptError::BudgetExceeded { .. }) {
            // The trap already posted the chat notice.
            log::error!("[avatar_script] {}: {error}", self.participant.display_name);
            return;
        }
        let message = error.chat_message().replace('\t', "   ");
        for line in message.split('\n') {
            self.sink
                .emit(Span::plain(line.to_string()).colored(Color::Red).into());
        }
        log::error!("[avatar_script] {}: {error:?}", self.participant.display_name);
    }
}
