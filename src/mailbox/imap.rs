//! Minimal blocking IMAP4rev1 client over rustls.
//!
//! Only what the reader needs: LOGIN, EXAMINE, UID SEARCH, UID FETCH and
//! LOGOUT. Run it from `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{debug, warn};

use super::{MessageUid, RawMessage, SearchCriteria, Searcher, search_with_fallback};
use crate::config::MailboxConfig;
use crate::error::MailboxError;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Largest `{n}` literal we will buffer. Exceeding either cap leaves the
/// stream mid-response, so the session is abandoned without LOGOUT.
const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

/// Longest response line, literals excluded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// A response line plus any literals (`{n}` payloads) embedded in it.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// An authenticated-or-not IMAP session. Logs out on drop.
pub struct ImapSession<S: Read + Write> {
    reader: BufReader<S>,
    tag: u32,
    closed: bool,
}

impl<S: Read + Write> ImapSession<S> {
    /// Wrap an established stream and consume the server greeting.
    pub fn handshake(stream: S) -> Result<Self, MailboxError> {
        let mut session = Self {
            reader: BufReader::new(stream),
            tag: 0,
            closed: false,
        };
        let greeting = session.read_response()?;
        if !(greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH")) {
            session.closed = true;
            return Err(MailboxError::Command {
                command: "GREETING".into(),
                reason: greeting.text.trim_end().to_string(),
            });
        }
        Ok(session)
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        match self.command(&cmd) {
            Ok(_) => Ok(()),
            Err(MailboxError::Command { .. }) => Err(MailboxError::AuthFailed {
                username: username.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Select a mailbox read-only.
    pub fn examine(&mut self, mailbox: &str) -> Result<(), MailboxError> {
        self.command(&format!("EXAMINE {}", quote(mailbox)))?;
        Ok(())
    }

    pub fn uid_search(&mut self, query: &str) -> Result<Vec<MessageUid>, MailboxError> {
        let lines = self.command(&format!("UID SEARCH {query}"))?;
        Ok(lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|n| n.parse().ok())
            .collect())
    }

    /// Full message source without setting `\Seen`.
    pub fn fetch_body(&mut self, uid: MessageUid) -> Result<Option<Vec<u8>>, MailboxError> {
        let lines = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(lines
            .into_iter()
            .filter(|l| l.text.starts_with("* ") && l.text.contains("FETCH"))
            .find_map(|l| l.literals.into_iter().next()))
    }

    pub fn logout(&mut self) -> Result<(), MailboxError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.command("LOGOUT")?;
        Ok(())
    }

    /// Send one tagged command and collect untagged lines until its completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseLine>, MailboxError> {
        self.tag += 1;
        let tag = format!("A{:04}", self.tag);
        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_response()?;
            if let Some(status) = line.text.strip_prefix(&tag) {
                let status = status.trim();
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                return Err(MailboxError::Command {
                    command: command_name(cmd),
                    reason: status.to_string(),
                });
            }
            lines.push(line);
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Err(MailboxError::Closed);
        }
        if read == MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
            self.closed = true;
            return Err(MailboxError::Oversized {
                what: "response line",
                limit: MAX_LINE_BYTES,
            });
        }
        Ok(buf)
    }

    /// Read a logical response line, pulling in every literal it announces.
    fn read_response(&mut self) -> Result<ResponseLine, MailboxError> {
        let mut response = ResponseLine::default();
        loop {
            let raw = self.read_line()?;
            let text = String::from_utf8_lossy(&raw).into_owned();
            let literal_len = literal_length(&text);
            response.text.push_str(&text);
            let Some(len) = literal_len else {
                return Ok(response);
            };
            if len > MAX_LITERAL_BYTES {
                self.closed = true;
                return Err(MailboxError::Oversized {
                    what: "literal",
                    limit: MAX_LITERAL_BYTES,
                });
            }
            let mut literal = vec![0u8; len];
            self.reader.read_exact(&mut literal)?;
            response.literals.push(literal);
        }
    }
}

impl<S: Read + Write> Searcher for ImapSession<S> {
    fn search(&mut self, criteria: SearchCriteria) -> Result<Vec<MessageUid>, MailboxError> {
        self.uid_search(criteria.imap_query())
    }
}

impl<S: Read + Write> Drop for ImapSession<S> {
    fn drop(&mut self) {
        if let Err(e) = self.logout() {
            debug!(error = %e, "IMAP logout on drop failed");
        }
    }
}

/// `{123}\r\n` at the end of a line announces a 123-byte literal.
fn literal_length(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\r', '\n']);
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Quote an IMAP string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Command verb for error messages; never includes arguments (passwords).
fn command_name(cmd: &str) -> String {
    let mut words = cmd.split_whitespace();
    match words.next() {
        Some("UID") => format!("UID {}", words.next().unwrap_or_default()),
        Some(verb) => verb.to_string(),
        None => String::new(),
    }
}

// ── TLS connection ──────────────────────────────────────────────────

fn connect_tls(config: &MailboxConfig) -> Result<TlsStream, MailboxError> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
        MailboxError::Connect {
            host: config.host.clone(),
            port: config.port,
            reason: e.to_string(),
        }
    })?;
    tcp.set_read_timeout(Some(config.read_timeout))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| MailboxError::Tls(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::Tls(e.to_string()))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

/// Connect and authenticate without selecting a mailbox.
fn authenticate(config: &MailboxConfig) -> Result<ImapSession<TlsStream>, MailboxError> {
    let mut session = ImapSession::handshake(connect_tls(config)?)?;
    session.login(&config.username, config.password.expose_secret())?;
    Ok(session)
}

/// Connect, authenticate and open the configured mailbox read-only.
pub fn open(config: &MailboxConfig) -> Result<ImapSession<TlsStream>, MailboxError> {
    let mut session = authenticate(config)?;
    session.examine(&config.mailbox)?;
    debug!(host = %config.host, mailbox = %config.mailbox, "IMAP mailbox opened read-only");
    Ok(session)
}

pub fn candidate_ids(config: &MailboxConfig) -> Result<Vec<MessageUid>, MailboxError> {
    let mut session = open(config)?;
    search_with_fallback(&mut session)
}

pub fn fetch_raw(config: &MailboxConfig, uids: &[MessageUid]) -> Result<Vec<RawMessage>, MailboxError> {
    let mut session = open(config)?;
    fetch_each(&mut session, uids)
}

pub fn verify_login(config: &MailboxConfig) -> Result<(), MailboxError> {
    authenticate(config)?.logout()
}

fn fetch_each<S: Read + Write>(
    session: &mut ImapSession<S>,
    uids: &[MessageUid],
) -> Result<Vec<RawMessage>, MailboxError> {
    let mut messages = Vec::with_capacity(uids.len());
    for &uid in uids {
        match session.fetch_body(uid) {
            Ok(Some(bytes)) => messages.push(RawMessage { uid, bytes }),
            Ok(None) => warn!(uid, "Server returned no body, skipping"),
            Err(MailboxError::Command { reason, .. }) => {
                warn!(uid, %reason, "Fetch rejected, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    use super::*;

    /// Replays canned server output and records what the client wrote.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        written: Rc<RefCell<Vec<u8>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn scripted(server: &str) -> (Scripted, Rc<RefCell<Vec<u8>>>) {
        let written = Rc::new(RefCell::new(Vec::new()));
        let stream = Scripted {
            input: Cursor::new(server.as_bytes().to_vec()),
            written: Rc::clone(&written),
        };
        (stream, written)
    }

    fn sent(written: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&written.borrow()).into_owned()
    }

    #[test]
    fn literal_length_parses_sync_and_nonsync() {
        assert_eq!(literal_length("* 1 FETCH (BODY[] {42}\r\n"), Some(42));
        assert_eq!(literal_length("* 1 FETCH (BODY[] {7+}\r\n"), Some(7));
        assert_eq!(literal_length("* OK ready\r\n"), None);
        assert_eq!(literal_length("* OK {not}\r\n"), None);
    }

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn command_name_hides_arguments() {
        assert_eq!(command_name("LOGIN \"me\" \"secret\""), "LOGIN");
        assert_eq!(command_name("UID SEARCH UNSEEN"), "UID SEARCH");
    }

    #[test]
    fn full_session_runs_fallback_and_logs_out_on_drop() {
        let (stream, written) = scripted(concat!(
            "* OK IMAP ready\r\n",
            "A0001 OK LOGIN completed\r\n",
            "* 3 EXISTS\r\n",
            "A0002 OK [READ-ONLY] EXAMINE completed\r\n",
            "A0003 BAD Unknown search key X-GM-RAW\r\n",
            "* SEARCH\r\n",
            "A0004 OK SEARCH completed\r\n",
            "* SEARCH 3 7 5\r\n",
            "A0005 OK SEARCH completed\r\n",
            "* BYE logging out\r\n",
            "A0006 OK LOGOUT completed\r\n",
        ));

        {
            let mut session = ImapSession::handshake(stream).unwrap();
            session.login("me@example.com", "pw").unwrap();
            session.examine("INBOX").unwrap();
            assert_eq!(search_with_fallback(&mut session).unwrap(), vec![7, 5, 3]);
        }

        let out = sent(&written);
        assert!(out.contains("A0002 EXAMINE \"INBOX\"\r\n"));
        assert!(out.contains("A0003 UID SEARCH X-GM-RAW \"category:primary\" UNSEEN\r\n"));
        assert!(out.contains("A0004 UID SEARCH UNSEEN\r\n"));
        assert!(out.contains("A0005 UID SEARCH ALL\r\n"));
        assert!(out.ends_with("A0006 LOGOUT\r\n"));
        assert!(!out.contains("SELECT"));
    }

    #[test]
    fn rejected_login_is_auth_failure() {
        let (stream, written) = scripted(concat!(
            "* OK IMAP ready\r\n",
            "A0001 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n",
        ));
        let mut session = ImapSession::handshake(stream).unwrap();
        let err = session.login("me@example.com", "wrong").unwrap_err();
        assert!(matches!(err, MailboxError::AuthFailed { ref username } if username == "me@example.com"));
        drop(session);
        // Logout is still attempted; the server has gone away so it fails quietly.
        assert!(sent(&written).contains("A0002 LOGOUT"));
    }

    #[test]
    fn fetch_reads_literal_by_byte_count() {
        let body = "Subject: hi\r\n\r\nline one\r\nA0002 OK inside\r\n";
        let script = format!(
            "* OK ready\r\n* 1 FETCH (UID 9 BODY[] {{{}}}\r\n{})\r\nA0001 OK FETCH completed\r\n",
            body.len(),
            body
        );
        let (stream, written) = scripted(&script);
        let mut session = ImapSession::handshake(stream).unwrap();
        let fetched = session.fetch_body(9).unwrap().unwrap();
        assert_eq!(fetched, body.as_bytes());
        assert!(sent(&written).contains("UID FETCH 9 BODY.PEEK[]"));
    }

    #[test]
    fn fetch_each_skips_missing_and_rejected() {
        let script = concat!(
            "* OK ready\r\n",
            "A0001 OK FETCH completed\r\n",
            "A0002 NO no such message\r\n",
            "* 2 FETCH (UID 4 BODY[] {5}\r\n",
            "hello)\r\n",
            "A0003 OK FETCH completed\r\n",
        );
        let (stream, _written) = scripted(script);
        let mut session = ImapSession::handshake(stream).unwrap();
        let messages = fetch_each(&mut session, &[1, 2, 4]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].uid, 4);
        assert_eq!(messages[0].bytes, b"hello");
    }

    #[test]
    fn fetch_each_stops_on_connection_loss() {
        let (stream, _written) = scripted("* OK ready\r\n");
        let mut session = ImapSession::handshake(stream).unwrap();
        assert!(matches!(
            fetch_each(&mut session, &[1, 2]),
            Err(MailboxError::Closed)
        ));
    }

    #[test]
    fn huge_literal_is_refused_before_allocation() {
        let script = concat!(
            "* OK ready\r\n",
            "* 1 FETCH (UID 9 BODY[] {999999999999}\r\n",
            "short)\r\n",
            "A0001 OK FETCH completed\r\n",
        );
        let (stream, written) = scripted(script);
        let mut session = ImapSession::handshake(stream).unwrap();
        assert!(matches!(
            fetch_each(&mut session, &[9, 10]),
            Err(MailboxError::Oversized { what: "literal", .. })
        ));
        drop(session);
        let out = sent(&written);
        assert!(!out.contains("UID FETCH 10"));
        assert!(!out.contains("LOGOUT"));
    }

    #[test]
    fn unterminated_line_is_capped() {
        let script = format!("* OK {}", "x".repeat(MAX_LINE_BYTES + 10));
        let (stream, _written) = scripted(&script);
        assert!(matches!(
            ImapSession::handshake(stream),
            Err(MailboxError::Oversized { what: "response line", .. })
        ));
    }

    #[test]
    fn bad_greeting_is_rejected() {
        let (stream, _written) = scripted("* BYE too busy\r\n");
        assert!(ImapSession::handshake(stream).is_err());
    }
}
