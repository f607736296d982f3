//! In-band transfer directives.
//!
//! Client-to-backend units are inspected before they are forwarded. A unit
//! whose text parses as a directive is consumed here and never reaches the
//! backend; everything else passes through untouched.

use std::sync::Arc;

use crate::directory::{Backend, BackendDirectory};
use crate::session::SessionState;
use crate::transport::ApplicationUnit;

/// Default command word for transfers.
pub const DEFAULT_TRANSFER_COMMAND: &str = "/transfer";

/// A control instruction carried inside a client unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Move the session to the named backend.
    Transfer { target: Option<String> },
}

/// Lexical form of directives.
pub trait DirectiveParser: Send + Sync + 'static {
    /// Parse unit text into a directive, or `None` for ordinary traffic.
    fn parse(&self, text: &str) -> Option<Directive>;

    /// How the directive is written, for usage notices.
    fn usage(&self) -> String;
}

/// Parser for `<command> <server>` lines.
///
/// The first whitespace-separated token must equal the command word exactly,
/// so `/transferx` or `say /transfer` stay ordinary chat.
#[derive(Debug, Clone)]
pub struct SlashCommandParser {
    command: String,
}

impl SlashCommandParser {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Default for SlashCommandParser {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFER_COMMAND)
    }
}

impl DirectiveParser for SlashCommandParser {
    fn parse(&self, text: &str) -> Option<Directive> {
        let mut tokens = text.split_whitespace();
        if tokens.next()? != self.command {
            return None;
        }
        Some(Directive::Transfer {
            target: tokens.next().map(str::to_string),
        })
    }

    fn usage(&self) -> String {
        format!("{} <server>", self.command)
    }
}

/// What the session should do with an inspected unit.
#[derive(Debug)]
pub enum Interception<U> {
    /// Ordinary traffic: forward (or buffer) as-is.
    Forward(U),
    /// Start a transfer to this backend.
    Transfer(Backend),
    /// Answer the client with a notice and drop the unit.
    Reply(String),
}

/// Client-visible notice texts.
pub mod notice {
    pub fn not_found(name: &str) -> String {
        format!("Server {name} not found.")
    }

    pub fn usage(usage: &str) -> String {
        format!("Usage: {usage}")
    }

    pub fn in_progress() -> String {
        "Transfer already in progress.".to_string()
    }

    pub fn transferred(name: &str) -> String {
        format!("Transferred to server {name}")
    }

    pub fn transfer_failed(name: &str, cause: &dyn std::fmt::Display) -> String {
        format!("Transfer to server {name} failed: {cause}")
    }

    pub fn connect_failed(name: &str, cause: &dyn std::fmt::Display) -> String {
        format!("Could not connect to server {name}: {cause}")
    }

    pub fn no_backends() -> String {
        "No servers are configured.".to_string()
    }
}

/// Watches client-to-backend traffic for directives.
#[derive(Clone)]
pub struct CommandInterceptor {
    parser: Arc<dyn DirectiveParser>,
    directory: Arc<BackendDirectory>,
}

impl CommandInterceptor {
    pub fn new(parser: Arc<dyn DirectiveParser>, directory: Arc<BackendDirectory>) -> Self {
        Self { parser, directory }
    }

    /// Classify one client unit.
    ///
    /// Unknown targets, missing arguments and directives outside `Active`
    /// produce a reply and leave the session untouched.
    pub fn inspect<U: ApplicationUnit>(&self, unit: U, state: SessionState) -> Interception<U> {
        let directive = match unit.chat_text().and_then(|text| self.parser.parse(text)) {
            Some(directive) => directive,
            None => return Interception::Forward(unit),
        };

        let Directive::Transfer { target } = directive;
        let Some(target) = target else {
            return Interception::Reply(notice::usage(&self.parser.usage()));
        };

        if state != SessionState::Active {
            return Interception::Reply(notice::in_progress());
        }

        match self.directory.lookup(&target) {
            Some(backend) => Interception::Transfer(backend),
            None => Interception::Reply(notice::not_found(&target)),
        }
    }
}
