//! Incremental XML tokenizer for XMPP streams.
//!
//! An XMPP session is a single long-lived XML document whose root element
//! (`<stream:stream>`) is never closed until the session ends, so the
//! tokenizer cannot demand well-formed input. Instead it accumulates bytes
//! and scans for complete top-level elements, handling the stream opener and
//! the lone `</stream:stream>` closer out of band. Complete stanzas are
//! parsed into [`minidom::Element`] under a synthetic root that supplies the
//! `jabber:client` default namespace (legacy peers omit it on the wire).

use minidom::Element;

use crate::XmppError;

/// Namespace URIs used on the wire.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// XMPP ping namespace
    pub const PING: &str = "urn:xmpp:ping";
    /// Appliance control namespace
    pub const CTL: &str = "com:ctl";
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// Raw text of the opening tag
    pub raw: String,
}

impl StreamHeader {
    /// Parse a stream header from the raw opening tag.
    ///
    /// The tag is intentionally unclosed XML, so attributes are extracted
    /// by scanning rather than by a document parser.
    pub fn parse(tag: &str) -> Self {
        StreamHeader {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            version: extract_attribute(tag, "version"),
            raw: tag.to_string(),
        }
    }

    /// Device class announced by a bot, if the header targets the bot domain.
    ///
    /// A `to` of `xyz.ecorobot.net` yields `Some("xyz")`; anything else is a
    /// controller and yields `None`.
    pub fn devclass(&self) -> Option<String> {
        self.to
            .as_deref()?
            .strip_suffix(crate::BOT_DOMAIN_SUFFIX)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Extract an attribute value from an XML tag string.
pub(crate) fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    // Try both single and double quotes
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// One logical element yielded by the tokenizer, in arrival order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A `<stream:stream …>` opening tag (no matching close expected)
    StreamOpen(StreamHeader),
    /// `<starttls/>` request
    StartTls,
    /// `<auth mechanism='…'>base64</auth>`
    SaslAuth { mechanism: String, data: String },
    /// Complete `<iq>` element; raw text is preserved because routing
    /// inspects substrings the parsed tree does not surface uniformly
    Iq { element: Element, raw: String },
    /// Complete `<presence>` element
    Presence(Element),
    /// Lone `</stream:stream>` close tag
    StreamClose,
    /// Bytes that form a complete token but no recognizable element
    Invalid { raw: String },
}

/// Incremental tokenizer over one connection's byte stream.
pub struct XmlParser {
    buffer: Vec<u8>,
}

impl XmlParser {
    /// Create a new tokenizer.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
        }
    }

    /// Feed inbound bytes into the buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop all buffered state. Called after a TLS upgrade, which restarts
    /// the stream from scratch.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Return the next complete event in buffer order, or `None` if the
    /// buffered bytes do not yet form one (recoverable; feed more bytes).
    pub fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            let data = String::from_utf8_lossy(&self.buffer).to_string();
            let trimmed = data.trim_start();
            if trimmed.is_empty() {
                self.buffer.clear();
                return None;
            }
            if trimmed.len() != data.len() {
                self.buffer = trimmed.as_bytes().to_vec();
                continue;
            }

            // Consume an XML prolog silently.
            if data.starts_with("<?xml") {
                match data.find("?>") {
                    Some(end) => {
                        self.buffer = data.as_bytes()[end + 2..].to_vec();
                        continue;
                    }
                    None => return None,
                }
            }

            // Earliest match wins so events are delivered in arrival order.
            let candidates = [
                "</stream:stream>",
                "<stream:stream",
                "<stream ",
                "<starttls",
                "<auth",
                "<iq",
                "<presence",
            ];
            let found = candidates
                .iter()
                .filter_map(|p| data.find(p).map(|pos| (pos, *p)))
                .min_by_key(|(pos, _)| *pos);

            let (start, pattern) = match found {
                Some(hit) => hit,
                None => {
                    // A complete-looking token we do not recognize is garbage;
                    // a partial one may still grow into a known element.
                    if data.contains('>') {
                        self.buffer.clear();
                        return Some(StreamEvent::Invalid { raw: data });
                    }
                    return None;
                }
            };

            match pattern {
                "</stream:stream>" => {
                    let end = start + pattern.len();
                    self.buffer = data.as_bytes()[end..].to_vec();
                    return Some(StreamEvent::StreamClose);
                }
                "<stream:stream" | "<stream " => {
                    // The opener has no matching close; the '>' ends it.
                    let end = match data[start..].find('>') {
                        Some(i) => start + i + 1,
                        None => return None,
                    };
                    let header = StreamHeader::parse(&data[start..end]);
                    self.buffer = data.as_bytes()[end..].to_vec();
                    return Some(StreamEvent::StreamOpen(header));
                }
                "<starttls" => {
                    let end = find_element_end(&data, start, "starttls")?;
                    self.buffer = data.as_bytes()[end..].to_vec();
                    return Some(StreamEvent::StartTls);
                }
                "<auth" => {
                    let end = find_element_end(&data, start, "auth")?;
                    let raw = &data[start..end];
                    let mechanism = extract_attribute(raw, "mechanism").unwrap_or_default();
                    let content = element_text(raw, "auth");
                    self.buffer = data.as_bytes()[end..].to_vec();
                    return Some(StreamEvent::SaslAuth {
                        mechanism,
                        data: content,
                    });
                }
                "<iq" => {
                    let end = find_element_end(&data, start, "iq")?;
                    let raw = data[start..end].to_string();
                    self.buffer = data.as_bytes()[end..].to_vec();
                    return match parse_element(&raw) {
                        Ok(element) => Some(StreamEvent::Iq { element, raw }),
                        Err(_) => Some(StreamEvent::Invalid { raw }),
                    };
                }
                "<presence" => {
                    let end = find_element_end(&data, start, "presence")?;
                    let raw = data[start..end].to_string();
                    self.buffer = data.as_bytes()[end..].to_vec();
                    return match parse_element(&raw) {
                        Ok(element) => Some(StreamEvent::Presence(element)),
                        Err(_) => Some(StreamEvent::Invalid { raw }),
                    };
                }
                _ => unreachable!("pattern list and match arms are in sync"),
            }
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the end position of an element (after its closing or self-closing
/// tag), or `None` when the buffered data is still incomplete.
fn find_element_end(data: &str, start: usize, tag_name: &str) -> Option<usize> {
    let after_start = &data[start..];

    // Self-closing tag
    if let Some(gt_pos) = after_start.find('>') {
        if gt_pos > 0 && after_start.as_bytes()[gt_pos - 1] == b'/' {
            return Some(start + gt_pos + 1);
        }
    }

    // Closing tag
    let close_tag = format!("</{}", tag_name);
    if let Some(close_start) = after_start.find(&close_tag) {
        if let Some(close_end) = after_start[close_start..].find('>') {
            return Some(start + close_start + close_end + 1);
        }
    }

    None
}

/// Extract the text content between an element's open and close tags.
fn element_text(raw: &str, tag_name: &str) -> String {
    let content_start = raw.find('>').map(|i| i + 1).unwrap_or(0);
    let content_end = raw
        .find(&format!("</{}", tag_name))
        .unwrap_or(raw.len());
    if content_start < content_end {
        raw[content_start..content_end].trim().to_string()
    } else {
        String::new()
    }
}

/// Parse a stanza string into a minidom Element.
///
/// Legacy peers send stanzas without any namespace declaration, which
/// minidom rejects, so the stanza is parsed under a synthetic root carrying
/// the `jabber:client` default namespace.
pub fn parse_element(data: &str) -> Result<Element, XmppError> {
    let wrapped = format!("<root xmlns='{}'>{}</root>", ns::JABBER_CLIENT, data);
    let root: Element = wrapped
        .parse()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse stanza: {}", e)))?;
    root.children()
        .next()
        .cloned()
        .ok_or_else(|| XmppError::xml_parse("Empty stanza"))
}
