use std::{collections::BTreeMap, fmt::Display, time::Instant};

use thiserror::Error;

use crate::{
    constants::{DEFAULT_PORT, HEADER_LENGTH, MAX_TOKEN_LENGTH, PAYLOAD_MARKER, PROTOCOL_VERSION},
    types::{
        decode_uint, encode_uint, BlockOption, Code, ContentFormat, Endpoint, Header, MessageType,
        OptionError, OptionNumber,
    },
};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Datagram shorter than declared contents")]
    UnexpectedEnd,

    #[error("Unsupported protocol version ({0})")]
    InvalidVersion(u8),

    #[error("Invalid token length ({0})")]
    InvalidTokenLength(usize),

    #[error("Option header uses the reserved nibble 15")]
    ReservedOptionNibble,

    #[error("Option delta walks past the option number range")]
    OptionNumberOverflow,

    #[error("Payload marker not followed by payload")]
    MissingPayload,

    #[error("Empty-code message carries options or a payload")]
    EmptyMessageContent,

    #[error("Invalid Uri-Port ({0})")]
    InvalidUriPort(u16),

    #[error("Invalid length ({length}) for option {number}")]
    InvalidOptionLength { number: OptionNumber, length: usize },

    #[error("Option {0} is not repeatable")]
    UnrepeatableOption(OptionNumber),

    #[error("Unknown critical option ({0}) in a response")]
    UnknownCriticalOption(u16),

    #[error("Invalid option value: {0}")]
    InvalidOptionValue(#[from] OptionError),

    #[error("Invalid CoAP URI: {0}")]
    InvalidUri(String),

    #[error("URI host is not an address literal: {0}")]
    UnresolvedHost(String),

    #[error("Message has no remote endpoint")]
    NoEndpoint,
}

/// Reliability scope of a single confirmable message:
/// one remote endpoint plus one message ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub endpoint: Endpoint,
    pub message_id: u16,
}

impl Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.endpoint, self.message_id)
    }
}

/// Scope of a logical operation: one remote endpoint plus one token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    pub endpoint: Endpoint,
    pub token: Vec<u8>,
}

impl Display for ExchangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|", self.endpoint)?;
        for byte in &self.token {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Deduplication scope: transaction key plus message type, so an ACK and a
/// CON reusing a message ID do not shadow each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub endpoint: Endpoint,
    pub message_id: u16,
    pub mtype: MessageType,
}

impl Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}|{}", self.endpoint, self.message_id, self.mtype)
    }
}

/// A complete CoAP message: fixed header, token, ordered options, payload,
/// and (for received or addressed messages) the remote endpoint.
///
/// Options are stored under their numeric number in ascending order, with
/// insertion order preserved within a number; serialization therefore always
/// produces a sorted option list with minimal deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    token: Vec<u8>,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
    payload: Vec<u8>,
    remote: Option<Endpoint>,
    received_at: Option<Instant>,
}

impl Message {
    pub fn new(mtype: MessageType, code: Code) -> Self {
        Self {
            header: Header::new(mtype, code),
            token: Vec::new(),
            options: BTreeMap::new(),
            payload: Vec::new(),
            remote: None,
            received_at: None,
        }
    }

    pub fn mtype(&self) -> MessageType {
        self.header.mtype
    }

    pub fn code(&self) -> Code {
        self.header.code
    }

    pub fn message_id(&self) -> u16 {
        self.header.message_id
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn set_token(&mut self, token: Vec<u8>) -> Result<(), MessageError> {
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(MessageError::InvalidTokenLength(token.len()));
        }
        self.token = token;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn remote(&self) -> Option<Endpoint> {
        self.remote
    }

    pub fn set_remote(&mut self, remote: Endpoint) {
        self.remote = Some(remote);
    }

    pub fn received_at(&self) -> Option<Instant> {
        self.received_at
    }

    pub fn stamp_received(&mut self, at: Instant) {
        self.received_at = Some(at);
    }

    // Option plumbing. Setters enforce the length and repeatability rules
    // of the static option definitions; unknown numbers pass through
    // unchecked.

    fn validate_option(number: OptionNumber, length: usize) -> Result<(), MessageError> {
        if let Some(def) = number.definition() {
            if length < def.min_length || length > def.max_length {
                return Err(MessageError::InvalidOptionLength { number, length });
            }
        }
        Ok(())
    }

    pub fn add_option(&mut self, number: OptionNumber, value: Vec<u8>) -> Result<(), MessageError> {
        Self::validate_option(number, value.len())?;
        if let Some(def) = number.definition() {
            if !def.repeatable && self.has_option(number) {
                return Err(MessageError::UnrepeatableOption(number));
            }
        }

        self.options.entry(number.into()).or_default().push(value);
        Ok(())
    }

    /// Replace all occurrences of an option with a single value.
    pub fn set_option(&mut self, number: OptionNumber, value: Vec<u8>) -> Result<(), MessageError> {
        Self::validate_option(number, value.len())?;
        self.options.insert(number.into(), vec![value]);
        Ok(())
    }

    pub fn clear_option(&mut self, number: OptionNumber) {
        self.options.remove(&number.into());
    }

    pub fn has_option(&self, number: OptionNumber) -> bool {
        self.options.contains_key(&number.into())
    }

    pub fn option_values(&self, number: OptionNumber) -> &[Vec<u8>] {
        self.options
            .get(&number.into())
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_option(&self, number: OptionNumber) -> Option<&[u8]> {
        self.option_values(number).first().map(|v| v.as_slice())
    }

    /// All options in serialization order.
    pub fn options(&self) -> impl Iterator<Item = (OptionNumber, &[u8])> + '_ {
        self.options.iter().flat_map(|(number, values)| {
            values
                .iter()
                .map(|value| (OptionNumber::from(*number), value.as_slice()))
        })
    }

    pub fn option_count(&self) -> usize {
        self.options.values().map(Vec::len).sum()
    }

    /// The first option number the peer marked critical that this
    /// implementation does not know. Such a message cannot be handled
    /// faithfully; the client treats it as a protocol error.
    pub fn unknown_critical_option(&self) -> Option<u16> {
        self.options.keys().copied().find(|&raw| {
            let number = OptionNumber::from(raw);
            matches!(number, OptionNumber::Unknown(_)) && number.is_critical()
        })
    }

    fn uint_option(&self, number: OptionNumber) -> Option<u64> {
        self.first_option(number)
            .and_then(|value| decode_uint(value).ok())
    }

    fn set_uint_option(&mut self, number: OptionNumber, value: u64) -> Result<(), MessageError> {
        self.set_option(number, encode_uint(value))
    }

    fn string_option(&self, number: OptionNumber) -> Option<String> {
        self.first_option(number)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    // Typed accessors.

    pub fn uri_host(&self) -> Option<String> {
        self.string_option(OptionNumber::UriHost)
    }

    pub fn set_uri_host(&mut self, host: &str) -> Result<(), MessageError> {
        self.set_option(OptionNumber::UriHost, host.as_bytes().to_vec())
    }

    pub fn uri_port(&self) -> Option<u16> {
        self.uint_option(OptionNumber::UriPort).map(|v| v as u16)
    }

    pub fn set_uri_port(&mut self, port: u16) -> Result<(), MessageError> {
        if port == 0 {
            return Err(MessageError::InvalidUriPort(port));
        }
        self.set_uint_option(OptionNumber::UriPort, u64::from(port))
    }

    /// The request path assembled from the Uri-Path options, with a leading
    /// slash. An absent option list is the root path.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(OptionNumber::UriPath) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    pub fn set_uri_path(&mut self, path: &str) -> Result<(), MessageError> {
        self.clear_option(OptionNumber::UriPath);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(OptionNumber::UriPath, segment.as_bytes().to_vec())?;
        }
        Ok(())
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.option_values(OptionNumber::UriQuery)
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn set_uri_query(&mut self, query: &str) -> Result<(), MessageError> {
        self.clear_option(OptionNumber::UriQuery);
        for arg in query.split('&').filter(|s| !s.is_empty()) {
            self.add_option(OptionNumber::UriQuery, arg.as_bytes().to_vec())?;
        }
        Ok(())
    }

    pub fn location_path(&self) -> String {
        let mut path = String::new();
        for segment in self.option_values(OptionNumber::LocationPath) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        path
    }

    pub fn location_query(&self) -> Vec<String> {
        self.option_values(OptionNumber::LocationQuery)
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.uint_option(OptionNumber::ContentFormat)
            .map(|v| ContentFormat::from(v as u16))
    }

    pub fn set_content_format(&mut self, format: ContentFormat) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::ContentFormat, u64::from(u16::from(format)))
    }

    pub fn accept(&self) -> Option<ContentFormat> {
        self.uint_option(OptionNumber::Accept)
            .map(|v| ContentFormat::from(v as u16))
    }

    pub fn set_accept(&mut self, format: ContentFormat) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::Accept, u64::from(u16::from(format)))
    }

    pub fn max_age(&self) -> Option<u32> {
        self.uint_option(OptionNumber::MaxAge).map(|v| v as u32)
    }

    pub fn set_max_age(&mut self, seconds: u32) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::MaxAge, u64::from(seconds))
    }

    pub fn etags(&self) -> &[Vec<u8>] {
        self.option_values(OptionNumber::ETag)
    }

    pub fn add_etag(&mut self, etag: Vec<u8>) -> Result<(), MessageError> {
        self.add_option(OptionNumber::ETag, etag)
    }

    pub fn if_none_match(&self) -> bool {
        self.has_option(OptionNumber::IfNoneMatch)
    }

    pub fn set_if_none_match(&mut self, value: bool) -> Result<(), MessageError> {
        if value {
            self.set_option(OptionNumber::IfNoneMatch, Vec::new())
        } else {
            self.clear_option(OptionNumber::IfNoneMatch);
            Ok(())
        }
    }

    /// The Observe value; an empty option value reads as 0.
    pub fn observe(&self) -> Option<u32> {
        self.uint_option(OptionNumber::Observe).map(|v| v as u32)
    }

    /// Register-style Observe: 0 is carried as the empty value, positive
    /// sequence numbers in their minimal encoding. Sequence numbers live in
    /// a 24-bit space, so the value is reduced modulo 2^24.
    pub fn set_observe(&mut self, value: u32) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::Observe, u64::from(value & 0x00FF_FFFF))
    }

    pub fn remove_observe(&mut self) {
        self.clear_option(OptionNumber::Observe);
    }

    pub fn block1(&self) -> Option<Result<BlockOption, OptionError>> {
        self.block_option(OptionNumber::Block1)
    }

    pub fn block2(&self) -> Option<Result<BlockOption, OptionError>> {
        self.block_option(OptionNumber::Block2)
    }

    fn block_option(&self, number: OptionNumber) -> Option<Result<BlockOption, OptionError>> {
        let value = self.first_option(number)?;
        Some(decode_uint(value).and_then(BlockOption::from_value))
    }

    pub fn set_block1(&mut self, block: BlockOption) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::Block1, u64::from(block.value()))
    }

    pub fn set_block2(&mut self, block: BlockOption) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::Block2, u64::from(block.value()))
    }

    pub fn size1(&self) -> Option<u32> {
        self.uint_option(OptionNumber::Size1).map(|v| v as u32)
    }

    pub fn set_size1(&mut self, size: u32) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::Size1, u64::from(size))
    }

    pub fn size2(&self) -> Option<u32> {
        self.uint_option(OptionNumber::Size2).map(|v| v as u32)
    }

    pub fn set_size2(&mut self, size: u32) -> Result<(), MessageError> {
        self.set_uint_option(OptionNumber::Size2, u64::from(size))
    }

    pub fn proxy_uri(&self) -> Option<String> {
        self.string_option(OptionNumber::ProxyUri)
    }

    pub fn set_proxy_uri(&mut self, uri: &str) -> Result<(), MessageError> {
        self.set_option(OptionNumber::ProxyUri, uri.as_bytes().to_vec())
    }

    pub fn proxy_scheme(&self) -> Option<String> {
        self.string_option(OptionNumber::ProxyScheme)
    }

    pub fn set_proxy_scheme(&mut self, scheme: &str) -> Result<(), MessageError> {
        self.set_option(OptionNumber::ProxyScheme, scheme.as_bytes().to_vec())
    }

    // URI composition.

    /// Synthesize the request URI from the remote endpoint and the
    /// Uri-Path/Uri-Query options. `None` without a remote endpoint.
    pub fn uri(&self) -> Option<String> {
        let remote = self.remote?;

        let mut uri = format!("coap://{}", remote.host());
        if remote.port() != DEFAULT_PORT {
            uri.push_str(&format!(":{}", remote.port()));
        }
        uri.push_str(&self.uri_path());

        let query = self.uri_query();
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query.join("&"));
        }

        Some(uri)
    }

    /// Parse an absolute (`coap://host[:port]/path?query`) or relative
    /// (`/path?query`) URI. Absolute URIs set the remote endpoint and
    /// require an address-literal host; name resolution is the caller's
    /// business.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), MessageError> {
        if uri.starts_with("coap://") {
            let parsed = url::Url::parse(uri)
                .map_err(|err| MessageError::InvalidUri(format!("{}: {}", uri, err)))?;

            let host = parsed
                .host_str()
                .ok_or_else(|| MessageError::InvalidUri(format!("{}: missing host", uri)))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let addr = host
                .parse()
                .map_err(|_| MessageError::UnresolvedHost(host.to_string()))?;

            self.set_remote(Endpoint::new(addr, parsed.port().unwrap_or(DEFAULT_PORT)));
            self.set_uri_path(parsed.path())?;
            match parsed.query() {
                Some(query) => self.set_uri_query(query)?,
                None => self.clear_option(OptionNumber::UriQuery),
            }
            Ok(())
        } else {
            let (path, query) = match uri.split_once('?') {
                Some((path, query)) => (path, Some(query)),
                None => (uri, None),
            };

            self.set_uri_path(path)?;
            match query {
                Some(query) => self.set_uri_query(query)?,
                None => self.clear_option(OptionNumber::UriQuery),
            }
            Ok(())
        }
    }

    // Keys.

    pub fn transaction_key(&self) -> Option<TransactionKey> {
        Some(TransactionKey {
            endpoint: self.remote?,
            message_id: self.header.message_id,
        })
    }

    pub fn exchange_key(&self) -> Option<ExchangeKey> {
        Some(ExchangeKey {
            endpoint: self.remote?,
            token: self.token.clone(),
        })
    }

    pub fn message_key(&self) -> Option<MessageKey> {
        Some(MessageKey {
            endpoint: self.remote?,
            message_id: self.header.message_id,
            mtype: self.header.mtype,
        })
    }

    // Wire codec.

    /// Decode a datagram. The remote endpoint and receive timestamp are not
    /// part of the wire form and are stamped by the receiver.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < HEADER_LENGTH {
            return Err(MessageError::UnexpectedEnd);
        }

        let version = data[0] >> 6;
        if version != PROTOCOL_VERSION {
            return Err(MessageError::InvalidVersion(version));
        }

        let mtype = MessageType::from_wire(data[0] >> 4);
        let token_length = (data[0] & 0x0F) as usize;
        if token_length > MAX_TOKEN_LENGTH {
            return Err(MessageError::InvalidTokenLength(token_length));
        }

        let code = Code::from(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        if data.len() < HEADER_LENGTH + token_length {
            return Err(MessageError::UnexpectedEnd);
        }
        let token = data[HEADER_LENGTH..HEADER_LENGTH + token_length].to_vec();

        let mut options: BTreeMap<u16, Vec<Vec<u8>>> = BTreeMap::new();
        let mut payload = Vec::new();
        let mut number = 0u32;
        let mut idx = HEADER_LENGTH + token_length;

        while idx < data.len() {
            let byte = data[idx];
            idx += 1;

            if byte == PAYLOAD_MARKER {
                if idx == data.len() {
                    return Err(MessageError::MissingPayload);
                }
                payload = data[idx..].to_vec();
                break;
            }

            let delta_nibble = byte >> 4;
            let length_nibble = byte & 0x0F;
            if delta_nibble == 15 || length_nibble == 15 {
                return Err(MessageError::ReservedOptionNibble);
            }

            let delta = read_extended(delta_nibble, data, &mut idx)?;
            let length = read_extended(length_nibble, data, &mut idx)? as usize;

            number += u32::from(delta);
            if number > u32::from(u16::MAX) {
                return Err(MessageError::OptionNumberOverflow);
            }

            if data.len() < idx + length {
                return Err(MessageError::UnexpectedEnd);
            }
            let value = data[idx..idx + length].to_vec();
            idx += length;

            options.entry(number as u16).or_default().push(value);
        }

        if code.is_empty() && (!options.is_empty() || !payload.is_empty()) {
            return Err(MessageError::EmptyMessageContent);
        }

        Ok(Self {
            header: Header {
                mtype,
                code,
                message_id,
            },
            token,
            options,
            payload,
            remote: None,
            received_at: None,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        if self.token.len() > MAX_TOKEN_LENGTH {
            return Err(MessageError::InvalidTokenLength(self.token.len()));
        }
        if self.header.code.is_empty() && (!self.options.is_empty() || !self.payload.is_empty()) {
            return Err(MessageError::EmptyMessageContent);
        }

        let mut buf = Vec::with_capacity(HEADER_LENGTH + self.token.len() + self.payload.len() + 8);

        buf.push(
            PROTOCOL_VERSION << 6 | u8::from(self.header.mtype) << 4 | self.token.len() as u8,
        );
        buf.push(self.header.code.into());
        buf.extend_from_slice(&self.header.message_id.to_be_bytes());
        buf.extend_from_slice(&self.token);

        let mut previous = 0u16;
        for (number, values) in &self.options {
            for value in values {
                let delta = number - previous;
                previous = *number;

                let (delta_nibble, delta_ext) = split_extended(delta);
                let (length_nibble, length_ext) = split_extended(value.len() as u16);

                buf.push(delta_nibble << 4 | length_nibble);
                buf.extend_from_slice(&delta_ext);
                buf.extend_from_slice(&length_ext);
                buf.extend_from_slice(value);
            }
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }

        Ok(buf)
    }
}

/// Resolve a 4-bit delta/length nibble into its full value, consuming
/// extension bytes for the 13/14 escapes.
fn read_extended(nibble: u8, data: &[u8], idx: &mut usize) -> Result<u16, MessageError> {
    match nibble {
        13 => {
            let byte = *data.get(*idx).ok_or(MessageError::UnexpectedEnd)?;
            *idx += 1;
            Ok(u16::from(byte) + 13)
        }
        14 => {
            if data.len() < *idx + 2 {
                return Err(MessageError::UnexpectedEnd);
            }
            let value = u16::from_be_bytes([data[*idx], data[*idx + 1]]);
            *idx += 2;
            value
                .checked_add(269)
                .ok_or(MessageError::OptionNumberOverflow)
        }
        nibble => Ok(u16::from(nibble)),
    }
}

/// Split a delta or length into its nibble and extension bytes.
fn split_extended(value: u16) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, (value - 269).to_be_bytes().to_vec())
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} token={:02x?} options={} payload={}B",
            self.header,
            self.token,
            self.option_count(),
            self.payload.len()
        )
    }
}
