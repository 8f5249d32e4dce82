//! SIP message abstraction.
//!
//! The wire-format parser is an external collaborator: it turns bytes into
//! the structured [`Request`]/[`Response`] values defined here and back.
//! This module only models the parsed form plus the handful of builders the
//! signaling core needs (responses within a transaction, ACK).

use std::fmt;

/// A SIP request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Update,
    Message,
    Notify,
    Options,
    Subscribe,
    Register,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Update => "UPDATE",
            Method::Message => "MESSAGE",
            Method::Notify => "NOTIFY",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Register => "REGISTER",
            Method::Other(m) => m,
        }
    }

    pub fn from_token(token: &str) -> Method {
        match token.to_ascii_uppercase().as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "UPDATE" => Method::Update,
            "MESSAGE" => Method::Message,
            "NOTIFY" => Method::Notify,
            "OPTIONS" => Method::Options,
            "SUBSCRIBE" => Method::Subscribe,
            "REGISTER" => Method::Register,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered header list with case-insensitive name lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((name.to_string(), value.into()));
    }

    /// Replaces the first header with the given name, or appends one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            entry.1 = value.into();
        } else {
            self.push(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A parsed SIP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Request {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn from(&self) -> Option<&str> {
        self.headers.get("From")
    }

    pub fn to(&self) -> Option<&str> {
        self.headers.get("To")
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from().and_then(address_tag)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to().and_then(address_tag)
    }

    /// URI taken from the Contact header, without brackets or parameters.
    pub fn contact_uri(&self) -> Option<String> {
        self.headers
            .get("Contact")
            .map(|c| address_uri(c).to_string())
    }

    /// URI of the From header, without display name or parameters.
    pub fn from_uri(&self) -> Option<String> {
        self.from().map(|f| address_uri(f).to_string())
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        let value = self.headers.get("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        Some((seq, method))
    }

    /// Record-Route header values, in arrival order.
    pub fn record_routes(&self) -> Vec<String> {
        self.headers
            .get_all("Record-Route")
            .map(|v| v.to_string())
            .collect()
    }
}

/// A parsed SIP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl Response {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Response {
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("To").and_then(address_tag)
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Either side of the SIP exchange.
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            SipMessage::Request(r) => r.call_id(),
            SipMessage::Response(r) => r.call_id(),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(r: Request) -> Self {
        SipMessage::Request(r)
    }
}

impl From<Response> for SipMessage {
    fn from(r: Response) -> Self {
        SipMessage::Response(r)
    }
}

/// Builds a response within the transaction of `request`.
///
/// Copies Via, Record-Route, Call-ID, From, To and CSeq from the request.
/// A UAS must add a tag to To on any non-100 response; `local_tag` supplies
/// it when the request's To has none yet.
pub fn response_to(
    request: &Request,
    status_code: u16,
    reason: &str,
    local_tag: Option<&str>,
) -> Response {
    let mut response = Response::new(status_code, reason);

    for via in request.headers.get_all("Via") {
        response.headers.push("Via", via);
    }
    for rr in request.headers.get_all("Record-Route") {
        response.headers.push("Record-Route", rr);
    }
    if let Some(call_id) = request.call_id() {
        response.headers.push("Call-ID", call_id);
    }
    if let Some(from) = request.from() {
        response.headers.push("From", from);
    }
    if let Some(to) = request.to() {
        if address_tag(to).is_none() && status_code > 100 {
            if let Some(tag) = local_tag {
                response.headers.push("To", format!("{};tag={}", to, tag));
            } else {
                response.headers.push("To", to);
            }
        } else {
            response.headers.push("To", to);
        }
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        response.headers.push("CSeq", cseq);
    }

    response
}

/// Extracts the `tag` parameter of a From/To header value.
pub fn address_tag(value: &str) -> Option<&str> {
    let (_, rest) = value.split_once(";tag=")?;
    Some(rest.split(';').next().unwrap_or(rest).trim())
}

/// Extracts the bare URI of a name-addr or addr-spec header value.
pub fn address_uri(value: &str) -> &str {
    if let Some(start) = value.find('<') {
        if let Some(end) = value[start..].find('>') {
            return &value[start + 1..start + end];
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// Generates a random tag for From/To headers.
pub fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Generates a random Call-ID.
pub fn generate_call_id() -> String {
    format!("{:016x}@rcsip", rand::random::<u64>())
}
