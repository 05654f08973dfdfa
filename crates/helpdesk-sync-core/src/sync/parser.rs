//! Raw RFC 822 bytes to `InboundMessage`

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::Message;
use regex::Regex;

use crate::error::{Error, Result};
use crate::models::{Address, InboundMessage, TicketPriority};

pub const NO_SUBJECT: &str = "(no subject)";
pub const EMPTY_BODY: &str = "(empty message)";
pub const UNPARSEABLE_SUBJECT: &str = "(unparseable message)";
pub const TRUNCATION_MARKER: &str = "\n\n[truncated]";

/// Leading reply/forward markers, possibly repeated ("Re: Fwd: RE:")
static REPLY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*((re|fwd?|enc)\s*(\[\d+\])?\s*:\s*)+").unwrap());

/// Ticket reference placed in outgoing subjects, e.g. "[#42]"
static TICKET_REFERENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[#(\d+)\]").unwrap());

static URGENT_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "urgent", "urgente", "emergency", "emergência", "critical", "crítico", "asap",
        "imediato", "parado", "offline", "outage",
    ])
});

static HIGH_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "important", "importante", "high priority", "alta prioridade", "error", "erro",
        "failure", "falha", "problem", "problema",
    ])
});

static LOW_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    keyword_regex(&[
        "low priority", "baixa prioridade", "minor", "question", "dúvida", "pergunta",
        "information", "informação",
    ])
});

/// Subject lines servers use for automatic replies
static AUTO_REPLY_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(auto(matic)?[ -]?reply|out of (the )?office|resposta autom[aá]tica|ausente|undeliverable|delivery status notification)",
    )
    .unwrap()
});

fn keyword_regex(words: &[&str]) -> Regex {
    let alternatives = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b({})\b", alternatives)).unwrap()
}

/// Strip reply/forward prefixes so "Re: Printer" threads with "Printer"
pub fn normalize_subject(subject: &str) -> String {
    REPLY_PREFIX.replace(subject, "").trim().to_string()
}

/// Ticket number referenced as `[#N]` in a subject
pub fn ticket_reference(subject: &str) -> Option<i64> {
    TICKET_REFERENCE
        .captures(subject)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Keyword-based priority, highest match wins
pub fn detect_priority(subject: &str, body: &str) -> TicketPriority {
    let haystacks = [subject, body];
    if haystacks.iter().any(|h| URGENT_KEYWORDS.is_match(h)) {
        TicketPriority::Urgent
    } else if haystacks.iter().any(|h| HIGH_KEYWORDS.is_match(h)) {
        TicketPriority::High
    } else if haystacks.iter().any(|h| LOW_KEYWORDS.is_match(h)) {
        TicketPriority::Low
    } else {
        TicketPriority::Medium
    }
}

/// Cut `text` at `max_chars` characters, appending a marker when anything was dropped
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}{}", text[..byte_index].trim_end(), TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

fn header_text<'a>(message: &'a Message<'a>, name: &str) -> Option<&'a str> {
    message
        .headers()
        .iter()
        .find(|h| h.name.as_str().eq_ignore_ascii_case(name))
        .and_then(|h| h.value.as_text())
        .map(str::trim)
}

fn is_auto_reply(message: &Message<'_>, subject: &str) -> bool {
    if let Some(value) = header_text(message, "Auto-Submitted") {
        if !value.eq_ignore_ascii_case("no") {
            return true;
        }
    }
    if let Some(value) = header_text(message, "Precedence") {
        if matches!(value.to_ascii_lowercase().as_str(), "bulk" | "junk" | "auto_reply" | "list") {
            return true;
        }
    }
    if header_text(message, "X-Autoreply").is_some() || header_text(message, "X-Autorespond").is_some() {
        return true;
    }
    AUTO_REPLY_SUBJECT.is_match(subject)
}

fn html_to_text(html: &str) -> String {
    html2text::config::plain()
        .string_from_read(html.as_bytes(), 100)
        .unwrap_or_else(|_| html.to_string())
}

/// Converts fetched message bytes into pipeline records
#[derive(Debug, Clone)]
pub struct InboundParser {
    max_description_chars: usize,
}

impl InboundParser {
    pub fn new(max_description_chars: usize) -> Self {
        Self {
            max_description_chars: max_description_chars.max(1),
        }
    }

    /// Parse raw bytes. Missing subject or body become placeholders, never empty.
    pub fn parse(&self, uid: u32, raw: &[u8]) -> Result<InboundMessage> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::Parse(format!("UID {} has an empty body", uid)));
        }

        let message = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Parse(format!("UID {} is not an RFC 822 message", uid)))?;
        if message.headers().is_empty() {
            return Err(Error::Parse(format!("UID {} has no header section", uid)));
        }

        let from = message
            .from()
            .and_then(|addrs| addrs.first())
            .and_then(|addr| {
                let email = addr.address()?.trim().to_string();
                Some(Address {
                    name: addr.name().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
                    email,
                })
            })
            .ok_or_else(|| Error::Parse(format!("UID {} has no sender address", uid)))?;

        let subject = message
            .subject()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(NO_SUBJECT)
            .to_string();

        let body_html = message.body_html(0).map(|s| s.to_string());
        let text = message
            .body_text(0)
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty())
            .or_else(|| body_html.as_deref().map(html_to_text))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let body = match text {
            Some(text) => truncate(&text, self.max_description_chars),
            None => EMPTY_BODY.to_string(),
        };

        let date = message
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now);

        let references: Vec<String> = message
            .references()
            .as_text_list()
            .map(|list| list.into_iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        let is_auto_reply = is_auto_reply(&message, &subject);

        Ok(InboundMessage {
            uid,
            message_id: message.message_id().map(|s| s.to_string()),
            in_reply_to: message.in_reply_to().as_text().map(|s| s.to_string()),
            references,
            from,
            subject,
            body,
            body_html,
            date,
            is_auto_reply,
            attachment_count: message.attachment_count(),
            parse_failed: false,
        })
    }

    /// Best-effort record for bytes that could not be parsed
    pub fn placeholder(&self, uid: u32, reason: &str) -> InboundMessage {
        InboundMessage {
            uid,
            message_id: None,
            in_reply_to: None,
            references: Vec::new(),
            from: Address::new("unknown@invalid"),
            subject: UNPARSEABLE_SUBJECT.to_string(),
            body: format!(
                "Mailbox message UID {} could not be parsed and needs manual review.\n\nReason: {}",
                uid, reason
            ),
            body_html: None,
            date: Utc::now(),
            is_auto_reply: false,
            attachment_count: 0,
            parse_failed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> InboundParser {
        InboundParser::new(5000)
    }

    #[test]
    fn test_parse_plain_message() {
        let raw = b"From: Ana Souza <ana@example.com>\r\n\
To: support@example.com\r\n\
Subject: Printer jammed\r\n\
Message-ID: <m1@example.com>\r\n\
Date: Mon, 6 Oct 2025 10:00:00 +0000\r\n\
\r\n\
The printer on floor 2 is jammed again.\r\n";

        let message = parser().parse(101, raw).unwrap();
        assert_eq!(message.uid, 101);
        assert_eq!(message.from.email, "ana@example.com");
        assert_eq!(message.from.name.as_deref(), Some("Ana Souza"));
        assert_eq!(message.subject, "Printer jammed");
        assert_eq!(message.body, "The printer on floor 2 is jammed again.");
        assert_eq!(message.message_id.as_deref(), Some("m1@example.com"));
        assert!(!message.is_auto_reply);
        assert!(!message.parse_failed);
    }

    #[test]
    fn test_missing_subject_and_body_get_placeholders() {
        let raw = b"From: bob@example.com\r\nMessage-ID: <m2@example.com>\r\n\r\n   \r\n";
        let message = parser().parse(7, raw).unwrap();
        assert_eq!(message.subject, NO_SUBJECT);
        assert_eq!(message.body, EMPTY_BODY);
        assert_eq!(message.from.display_name(), "bob");
    }

    #[test]
    fn test_html_only_body_is_converted() {
        let raw = b"From: carol@example.com\r\n\
Subject: HTML\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Hello <b>team</b></p></body></html>\r\n";
        let message = parser().parse(8, raw).unwrap();
        assert!(message.body.contains("Hello"));
        assert!(message.body.contains("team"));
        assert!(!message.body.contains("<p>"));
        assert!(message.body_html.is_some());
    }

    #[test]
    fn test_empty_bytes_fail_to_parse() {
        let err = parser().parse(104, b"").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
        assert!(parser().parse(104, b"  \r\n ").is_err());
    }

    #[test]
    fn test_auto_reply_headers() {
        let raw = b"From: bob@example.com\r\n\
Subject: Re: Printer jammed\r\n\
Auto-Submitted: auto-replied\r\n\
\r\n\
I am on vacation.\r\n";
        assert!(parser().parse(9, raw).unwrap().is_auto_reply);

        let raw = b"From: bob@example.com\r\n\
Subject: Printer jammed\r\n\
Auto-Submitted: no\r\n\
\r\n\
Still jammed.\r\n";
        assert!(!parser().parse(10, raw).unwrap().is_auto_reply);

        let raw = b"From: bob@example.com\r\nSubject: Out of Office: back Monday\r\n\r\nAway.\r\n";
        assert!(parser().parse(11, raw).unwrap().is_auto_reply);
    }

    #[test]
    fn test_long_body_truncated() {
        let long = "a".repeat(50);
        let raw = format!("From: dan@example.com\r\nSubject: Long\r\n\r\n{}\r\n", long);
        let message = InboundParser::new(10).parse(12, raw.as_bytes()).unwrap();
        assert_eq!(message.body, format!("{}{}", "a".repeat(10), TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("ação", 10), "ação");
        assert_eq!(truncate("ação rápida", 3), format!("açã{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("Re: Printer"), "Printer");
        assert_eq!(normalize_subject("RE: Fwd: ENC: Printer"), "Printer");
        assert_eq!(normalize_subject("Fw: Re[2]: Printer"), "Printer");
        assert_eq!(normalize_subject("Regarding invoices"), "Regarding invoices");
    }

    #[test]
    fn test_ticket_reference() {
        assert_eq!(ticket_reference("Re: [#42] Printer jammed"), Some(42));
        assert_eq!(ticket_reference("Printer #42"), None);
    }

    #[test]
    fn test_priority_keywords() {
        assert_eq!(detect_priority("URGENT: site offline", ""), TicketPriority::Urgent);
        assert_eq!(detect_priority("Login", "I get an error when saving"), TicketPriority::High);
        assert_eq!(detect_priority("Quick question", "where is the manual?"), TicketPriority::Low);
        assert_eq!(detect_priority("Hello", "please reset my password"), TicketPriority::Medium);
        // Word boundaries: "download" must not match "down"-style keywords
        assert_eq!(detect_priority("Download link", "errors-free"), TicketPriority::Medium);
    }

    #[test]
    fn test_placeholder_is_flagged() {
        let message = parser().placeholder(104, "empty body");
        assert!(message.parse_failed);
        assert_eq!(message.subject, UNPARSEABLE_SUBJECT);
        assert!(message.body.contains("104"));
    }
}
