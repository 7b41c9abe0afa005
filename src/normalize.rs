//! Message normalizer: flattens a raw MIME message into an `EmailRecord`.
//!
//! Body selection for multipart messages:
//! - parts with `Content-Disposition: attachment` only contribute a filename
//! - the first remaining `text/plain` part wins
//! - otherwise the first `text/html` part, run through [`strip_tags`]
//! - inline `message/rfc822` parts are walked in place, in order
//!
//! Charset decoding is done by mail-parser, which substitutes undecodable
//! bytes instead of failing.

use std::ops::Range;

use mail_parser::{HeaderValue, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::error::{MailboxError, NormalizeError};
use crate::mailbox::{MailboxReader, MessageUid, RawMessage};

/// Flat view of one inbound email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailRecord {
    pub uid: MessageUid,
    /// `Message-ID` header, may be empty.
    pub message_id: String,
    /// `From` header as `Name <addr>` or bare address.
    pub from: String,
    pub subject: String,
    /// Best-effort plain text. Never absent; empty when no body decodes.
    pub content: String,
    /// True iff `In-Reply-To` is non-empty.
    pub is_reply: bool,
    pub in_reply_to: String,
    pub attachments: Vec<String>,
}

/// Fetch `uids[range]` in one mailbox session and decode each message.
///
/// Messages that fail to decode are logged and dropped; only a mailbox
/// failure aborts the call.
pub async fn decode_range(
    mailbox: &dyn MailboxReader,
    uids: &[MessageUid],
    range: Range<usize>,
) -> Result<Vec<EmailRecord>, MailboxError> {
    let end = range.end.min(uids.len());
    let start = range.start.min(end);
    if start == end {
        return Ok(Vec::new());
    }
    let raw = mailbox.fetch_raw(&uids[start..end]).await?;
    Ok(decode_all(&raw))
}

/// Decode a batch, skipping (and logging) messages that cannot be parsed.
pub fn decode_all(raw: &[RawMessage]) -> Vec<EmailRecord> {
    let mut records = Vec::with_capacity(raw.len());
    for message in raw {
        match decode(message) {
            Ok(record) => records.push(record),
            Err(e) => warn!(uid = message.uid, error = %e, "Skipping undecodable message"),
        }
    }
    records
}

/// Decode one raw message.
pub fn decode(raw: &RawMessage) -> Result<EmailRecord, NormalizeError> {
    if raw.bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(NormalizeError::Unparseable { uid: raw.uid });
    }
    let message = MessageParser::default()
        .parse(&raw.bytes)
        .ok_or(NormalizeError::Unparseable { uid: raw.uid })?;
    let root = message
        .parts
        .first()
        .ok_or(NormalizeError::Empty { uid: raw.uid })?;

    let in_reply_to = header_text(message.in_reply_to()).unwrap_or_default();
    let mut attachments = Vec::new();

    let content = if matches!(root.body, PartType::Multipart(_) | PartType::Message(_)) {
        let mut found = BodyParts::default();
        collect_parts(&message.parts, &mut found);
        attachments = found.attachments;
        match (found.plain, found.html) {
            (Some(text), _) => text.to_string(),
            (None, Some(markup)) => strip_tags(markup),
            (None, None) => String::new(),
        }
    } else {
        single_part_text(root)
    };

    let record = EmailRecord {
        uid: raw.uid,
        message_id: message.message_id().unwrap_or_default().to_string(),
        from: sender(&message),
        subject: message.subject().unwrap_or_default().to_string(),
        content,
        is_reply: !in_reply_to.trim().is_empty(),
        in_reply_to,
        attachments,
    };
    debug!(
        uid = record.uid,
        is_reply = record.is_reply,
        attachments = record.attachments.len(),
        "Decoded message"
    );
    Ok(record)
}

#[derive(Default)]
struct BodyParts<'a> {
    plain: Option<&'a str>,
    html: Option<&'a str>,
    attachments: Vec<String>,
}

fn collect_parts<'a>(parts: &'a [MessagePart<'_>], found: &mut BodyParts<'a>) {
    for part in parts {
        if is_attachment(part) {
            if let Some(name) = part.attachment_name() {
                found.attachments.push(name.to_string());
            }
            continue;
        }
        match &part.body {
            PartType::Text(text) if found.plain.is_none() && is_plain(part) => {
                found.plain = Some(text.as_ref())
            }
            PartType::Html(markup) if found.html.is_none() => found.html = Some(markup.as_ref()),
            PartType::Message(inner) => collect_parts(&inner.parts, found),
            _ => {}
        }
    }
}

fn single_part_text(part: &MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) => text.to_string(),
        PartType::Html(markup) => strip_tags(markup),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        _ => String::new(),
    }
}

fn is_attachment(part: &MessagePart<'_>) -> bool {
    part.content_disposition()
        .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("attachment"))
}

/// A part with no Content-Type header is implicitly `text/plain`.
fn is_plain(part: &MessagePart<'_>) -> bool {
    part.content_type().is_none_or(|ct| {
        ct.ctype().eq_ignore_ascii_case("text")
            && ct.subtype().is_none_or(|s| s.eq_ignore_ascii_case("plain"))
    })
}

fn header_text(value: &HeaderValue<'_>) -> Option<String> {
    match value {
        HeaderValue::Text(s) => Some(s.to_string()),
        HeaderValue::TextList(list) => list.first().map(|s| s.to_string()),
        _ => None,
    }
}

/// Render the first `From` address as `Name <addr>`, or just `addr`.
fn sender(message: &mail_parser::Message<'_>) -> String {
    let Some(first) = message.from().and_then(|addr| addr.first()) else {
        return message
            .header_raw("From")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
    };
    match (first.name(), first.address()) {
        (Some(name), Some(address)) if !name.trim().is_empty() => format!("{name} <{address}>"),
        (_, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

// ── HTML to text ────────────────────────────────────────────────────

/// Strip markup and keep only text nodes.
///
/// Scanner states: outside a tag (text is kept, entities decoded), inside a
/// tag (quoted attribute values may contain `>`), inside a comment, and
/// inside `<script>`/`<style>` bodies, which are dropped. A `<` that cannot
/// start a tag is kept as text. Blank-line runs are collapsed.
pub fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        push_text(&mut text, &rest[..open]);
        rest = &rest[open..];

        if rest.starts_with("<!--") {
            rest = rest.find("-->").map_or("", |end| &rest[end + 3..]);
            continue;
        }
        let starts_tag = rest[1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));
        if !starts_tag {
            text.push('<');
            rest = &rest[1..];
            continue;
        }
        let Some(close) = tag_end(rest) else {
            // Unterminated tag: nothing after it is a text node.
            rest = "";
            break;
        };
        let tag = &rest[1..close];
        rest = &rest[close + 1..];
        if let Some(name) = raw_text_element(tag) {
            rest = skip_element_body(rest, name);
        }
    }
    push_text(&mut text, rest);

    tidy_lines(&text)
}

/// Index of the `>` closing the tag that starts at `s[0]`.
fn tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, b) in s.bytes().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

/// `script` and `style` hold raw text that is not document content.
fn raw_text_element(tag: &str) -> Option<&'static str> {
    if tag.starts_with('/') || tag.ends_with('/') {
        return None;
    }
    let name: String = tag
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match name.as_str() {
        "script" => Some("script"),
        "style" => Some("style"),
        _ => None,
    }
}

fn skip_element_body<'a>(rest: &'a str, name: &str) -> &'a str {
    let lower = rest.to_ascii_lowercase();
    let Some(start) = lower.find(&format!("</{name}")) else {
        return "";
    };
    let after = &rest[start..];
    after.find('>').map_or("", |end| &after[end + 1..])
}

fn push_text(out: &mut String, raw: &str) {
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        match decode_entity(rest) {
            Some((ch, len)) => {
                out.push(ch);
                rest = &rest[len..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
}

/// Decode an entity at the start of `s`, returning the char and bytes consumed.
fn decode_entity(s: &str) -> Option<(char, usize)> {
    let (semi, _) = s.char_indices().take(12).find(|&(_, c)| c == ';')?;
    let name = &s[1..semi];
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)?
        }
    };
    Some((ch, semi + 1))
}

fn tidy_lines(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.trim().is_empty() && lines.last().is_none_or(|l| l.trim().is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
