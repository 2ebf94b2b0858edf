//! Data-channel signalling.
//!
//! The session narrates itself to the client over a line-oriented text
//! protocol: `status <token>`, `transcript <role> <content>` and
//! `error <token>`. Sends are best-effort — signalling never fails a
//! session — and anything sent before a channel is attached is dropped
//! with a warning.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::types::{Message, Role};

/// Phase markers pushed at each turn-loop transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Hello,
    Loopstart,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Maxlen,
    Stop,
    Bye,
}

impl Status {
    pub fn token(&self) -> &'static str {
        match self {
            Status::Hello => "hello",
            Status::Loopstart => "loopstart",
            Status::Listening => "listening",
            Status::Transcribing => "transcribing",
            Status::Thinking => "thinking",
            Status::Speaking => "speaking",
            Status::Maxlen => "maxlen",
            Status::Stop => "stop",
            Status::Bye => "bye",
        }
    }
}

/// A writable signalling channel. Implementations must not block: the
/// orchestrator never awaits a send.
pub trait SignalChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Fire-and-forget one line of text.
    fn send(&self, line: &str);
}

/// The orchestrator's handle on its (at most one) signalling channel.
pub struct Signaller {
    channel: Mutex<Option<Arc<dyn SignalChannel>>>,
}

impl Signaller {
    pub fn new() -> Self {
        Self {
            channel: Mutex::new(None),
        }
    }

    /// Store the channel. A second attachment is logged and ignored.
    pub fn attach(&self, channel: Arc<dyn SignalChannel>) {
        let mut slot = self.channel.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            warn!(label = existing.label(), "signalling channel already attached, ignoring");
            return;
        }
        debug!(label = channel.label(), "signalling channel attached");
        *slot = Some(channel);
    }

    pub fn is_attached(&self) -> bool {
        self.channel.lock().unwrap().is_some()
    }

    pub fn send_status(&self, status: Status) {
        self.send_line(format!("status {}", status.token()));
    }

    pub fn send_error(&self, token: &str) {
        error!(token, "sending error to the client");
        self.send_line(format!("error {token}"));
    }

    /// Exactly one transcript line per completed message. System
    /// messages are never surfaced.
    pub fn send_transcript(&self, message: &Message) {
        if message.role == Role::System {
            warn!("refusing to surface a system message on the transcript channel");
            return;
        }
        self.send_line(format!("transcript {} {}", message.role, message.content));
    }

    fn send_line(&self, line: String) {
        let slot = self.channel.lock().unwrap();
        match slot.as_ref() {
            Some(channel) => {
                debug!(line = %line, "sending");
                channel.send(&line);
            }
            None => warn!(line = %line, "no signalling channel attached, dropping"),
        }
    }
}

impl Default for Signaller {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::CapturingChannel;
    use super::*;

    #[test]
    fn wire_format() {
        let signaller = Signaller::new();
        let channel = CapturingChannel::new();
        signaller.attach(channel.clone());

        signaller.send_status(Status::Hello);
        signaller.send_transcript(&Message::user("bonjour"));
        signaller.send_error("utttoolong");

        assert_eq!(
            channel.lines(),
            vec![
                "status hello".to_string(),
                "transcript user bonjour".to_string(),
                "error utttoolong".to_string(),
            ]
        );
    }

    #[test]
    fn sends_before_attach_are_dropped() {
        let signaller = Signaller::new();
        signaller.send_status(Status::Hello);
        let channel = CapturingChannel::new();
        signaller.attach(channel.clone());
        assert!(channel.lines().is_empty());
    }

    #[test]
    fn second_attach_is_ignored() {
        let signaller = Signaller::new();
        let first = CapturingChannel::new();
        let second = CapturingChannel::new();
        signaller.attach(first.clone());
        signaller.attach(second.clone());
        signaller.send_status(Status::Listening);
        assert_eq!(first.lines().len(), 1);
        assert!(second.lines().is_empty());
    }

    #[test]
    fn system_messages_never_reach_the_wire() {
        let signaller = Signaller::new();
        let channel = CapturingChannel::new();
        signaller.attach(channel.clone());
        signaller.send_transcript(&Message::system("hidden prompt"));
        assert!(channel.lines().is_empty());
    }

    #[test]
    fn status_tokens() {
        for (status, token) in [
            (Status::Hello, "hello"),
            (Status::Loopstart, "loopstart"),
            (Status::Listening, "listening"),
            (Status::Transcribing, "transcribing"),
            (Status::Thinking, "thinking"),
            (Status::Speaking, "speaking"),
            (Status::Maxlen, "maxlen"),
            (Status::Stop, "stop"),
            (Status::Bye, "bye"),
        ] {
            assert_eq!(status.token(), token);
        }
    }
}
