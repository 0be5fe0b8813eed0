use std::fmt::Display;

/// Value format of a registered option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFormat {
    Empty,
    Uint,
    String,
    Opaque,
}

/// Static properties of a registered option number.
#[derive(Debug, Clone, Copy)]
pub struct OptionDefinition {
    pub name: &'static str,
    pub format: OptionFormat,
    pub min_length: usize,
    pub max_length: usize,
    pub repeatable: bool,
    pub default: Option<u32>,
}

/// Registered option numbers. Numbers this implementation does not know are
/// retained as [`OptionNumber::Unknown`] and serialized back unchanged.
///
/// See [RFC 7252 - Section 5.10](https://datatracker.ietf.org/doc/html/rfc7252#section-5.10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionNumber {
    /// #### If-Match
    ///
    /// Makes a request conditional on the current existence or value of an
    /// ETag. May be repeated.
    IfMatch,

    /// #### Uri-Host
    ///
    /// The host component of the request URI when it differs from the
    /// destination address.
    UriHost,

    /// #### ETag
    ///
    /// An opaque resource-local entity tag. May be repeated in requests.
    ETag,

    /// #### If-None-Match
    ///
    /// Makes a request conditional on the non-existence of the target
    /// resource. Carries no value.
    IfNoneMatch,

    /// #### Observe
    ///
    /// Registers interest in a resource (value 0 in requests) and orders
    /// notifications (24-bit sequence number in responses).
    ///
    /// See [RFC 7641](https://datatracker.ietf.org/doc/html/rfc7641)
    Observe,

    /// #### Uri-Port
    ///
    /// The transport-layer port of the request URI. Legal values are
    /// 1 to 65535.
    UriPort,

    /// #### Location-Path
    ///
    /// One segment of the location of a created resource. May be repeated.
    LocationPath,

    /// #### Uri-Path
    ///
    /// One segment of the request path. May be repeated.
    UriPath,

    /// #### Content-Format
    ///
    /// Numeric identifier of the payload representation, see
    /// [`crate::types::ContentFormat`].
    ContentFormat,

    /// #### Max-Age
    ///
    /// Freshness horizon of a response in seconds. Defaults to 60 when
    /// absent; observers re-arm their exchange timer from it.
    MaxAge,

    /// #### Uri-Query
    ///
    /// One query argument of the request URI. May be repeated.
    UriQuery,

    /// #### Accept
    ///
    /// The content format acceptable to the client.
    Accept,

    /// #### Location-Query
    ///
    /// One query argument of the location of a created resource. May be
    /// repeated.
    LocationQuery,

    /// #### Block2
    ///
    /// Response-direction block transfer state.
    ///
    /// See [RFC 7959](https://datatracker.ietf.org/doc/html/rfc7959)
    Block2,

    /// #### Block1
    ///
    /// Request-direction block transfer state.
    ///
    /// See [RFC 7959](https://datatracker.ietf.org/doc/html/rfc7959)
    Block1,

    /// #### Size2
    ///
    /// Total size of a block-wise response body, when the server chooses to
    /// advertise it.
    Size2,

    /// #### Proxy-Uri
    ///
    /// The absolute request URI when the request travels through a
    /// forward proxy.
    ProxyUri,

    /// #### Proxy-Scheme
    ///
    /// Scheme to use when a proxy reconstructs the request URI from the
    /// Uri-* options.
    ProxyScheme,

    /// #### Size1
    ///
    /// Total size of a block-wise request body.
    Size1,

    /// Unregistered option numbers, retained opaque.
    Unknown(u16),
}

impl OptionNumber {
    /// Static definition for registered numbers; `None` for unknown ones.
    pub fn definition(&self) -> Option<OptionDefinition> {
        let def = match self {
            OptionNumber::IfMatch => OptionDefinition {
                name: "If-Match",
                format: OptionFormat::Opaque,
                min_length: 0,
                max_length: 8,
                repeatable: true,
                default: None,
            },
            OptionNumber::UriHost => OptionDefinition {
                name: "Uri-Host",
                format: OptionFormat::String,
                min_length: 1,
                max_length: 255,
                repeatable: false,
                default: None,
            },
            OptionNumber::ETag => OptionDefinition {
                name: "ETag",
                format: OptionFormat::Opaque,
                min_length: 1,
                max_length: 8,
                repeatable: true,
                default: None,
            },
            OptionNumber::IfNoneMatch => OptionDefinition {
                name: "If-None-Match",
                format: OptionFormat::Empty,
                min_length: 0,
                max_length: 0,
                repeatable: false,
                default: None,
            },
            OptionNumber::Observe => OptionDefinition {
                name: "Observe",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 3,
                repeatable: false,
                default: None,
            },
            OptionNumber::UriPort => OptionDefinition {
                name: "Uri-Port",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 2,
                repeatable: false,
                default: None,
            },
            OptionNumber::LocationPath => OptionDefinition {
                name: "Location-Path",
                format: OptionFormat::String,
                min_length: 0,
                max_length: 255,
                repeatable: true,
                default: None,
            },
            OptionNumber::UriPath => OptionDefinition {
                name: "Uri-Path",
                format: OptionFormat::String,
                min_length: 0,
                max_length: 255,
                repeatable: true,
                default: None,
            },
            OptionNumber::ContentFormat => OptionDefinition {
                name: "Content-Format",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 2,
                repeatable: false,
                default: None,
            },
            OptionNumber::MaxAge => OptionDefinition {
                name: "Max-Age",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 4,
                repeatable: false,
                default: Some(60),
            },
            OptionNumber::UriQuery => OptionDefinition {
                name: "Uri-Query",
                format: OptionFormat::String,
                min_length: 0,
                max_length: 255,
                repeatable: true,
                default: None,
            },
            OptionNumber::Accept => OptionDefinition {
                name: "Accept",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 2,
                repeatable: false,
                default: None,
            },
            OptionNumber::LocationQuery => OptionDefinition {
                name: "Location-Query",
                format: OptionFormat::String,
                min_length: 0,
                max_length: 255,
                repeatable: true,
                default: None,
            },
            OptionNumber::Block2 => OptionDefinition {
                name: "Block2",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 3,
                repeatable: false,
                default: None,
            },
            OptionNumber::Block1 => OptionDefinition {
                name: "Block1",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 3,
                repeatable: false,
                default: None,
            },
            OptionNumber::Size2 => OptionDefinition {
                name: "Size2",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 4,
                repeatable: false,
                default: None,
            },
            OptionNumber::ProxyUri => OptionDefinition {
                name: "Proxy-Uri",
                format: OptionFormat::String,
                min_length: 1,
                max_length: 1034,
                repeatable: false,
                default: None,
            },
            OptionNumber::ProxyScheme => OptionDefinition {
                name: "Proxy-Scheme",
                format: OptionFormat::String,
                min_length: 1,
                max_length: 255,
                repeatable: false,
                default: None,
            },
            OptionNumber::Size1 => OptionDefinition {
                name: "Size1",
                format: OptionFormat::Uint,
                min_length: 0,
                max_length: 4,
                repeatable: false,
                default: None,
            },
            OptionNumber::Unknown(_) => return None,
        };

        Some(def)
    }

    /// Critical options must be understood by the receiver.
    pub fn is_critical(&self) -> bool {
        u16::from(*self) & 0x01 != 0
    }

    /// Unsafe options must not be forwarded blindly by a proxy.
    pub fn is_unsafe(&self) -> bool {
        u16::from(*self) & 0x02 != 0
    }

    /// NoCacheKey options do not take part in cache-key computation.
    pub fn is_no_cache_key(&self) -> bool {
        u16::from(*self) & 0x1E == 0x1C
    }

    /// Case-insensitive lookup by registered name, e.g. `"uri-path"`.
    pub fn from_name(name: &str) -> Option<Self> {
        let number = match name.to_ascii_lowercase().as_str() {
            "if-match" => OptionNumber::IfMatch,
            "uri-host" => OptionNumber::UriHost,
            "etag" => OptionNumber::ETag,
            "if-none-match" => OptionNumber::IfNoneMatch,
            "observe" => OptionNumber::Observe,
            "uri-port" => OptionNumber::UriPort,
            "location-path" => OptionNumber::LocationPath,
            "uri-path" => OptionNumber::UriPath,
            "content-format" => OptionNumber::ContentFormat,
            "max-age" => OptionNumber::MaxAge,
            "uri-query" => OptionNumber::UriQuery,
            "accept" => OptionNumber::Accept,
            "location-query" => OptionNumber::LocationQuery,
            "block2" => OptionNumber::Block2,
            "block1" => OptionNumber::Block1,
            "size2" => OptionNumber::Size2,
            "proxy-uri" => OptionNumber::ProxyUri,
            "proxy-scheme" => OptionNumber::ProxyScheme,
            "size1" => OptionNumber::Size1,
            _ => return None,
        };

        Some(number)
    }

    /// Lookup by a `CoAP-`-prefixed HTTP header name, as used by the
    /// HTTP-to-CoAP proxy mapping (`CoAP-Uri-Path` selects Uri-Path).
    pub fn from_proxy_header(header: &str) -> Option<Self> {
        let lower = header.to_ascii_lowercase();
        let name = lower.strip_prefix("coap-")?;
        Self::from_name(name)
    }
}

impl From<u16> for OptionNumber {
    fn from(number: u16) -> Self {
        match number {
            1 => OptionNumber::IfMatch,
            3 => OptionNumber::UriHost,
            4 => OptionNumber::ETag,
            5 => OptionNumber::IfNoneMatch,
            6 => OptionNumber::Observe,
            7 => OptionNumber::UriPort,
            8 => OptionNumber::LocationPath,
            11 => OptionNumber::UriPath,
            12 => OptionNumber::ContentFormat,
            14 => OptionNumber::MaxAge,
            15 => OptionNumber::UriQuery,
            16 => OptionNumber::Accept,
            20 => OptionNumber::LocationQuery,
            23 => OptionNumber::Block2,
            27 => OptionNumber::Block1,
            28 => OptionNumber::Size2,
            35 => OptionNumber::ProxyUri,
            39 => OptionNumber::ProxyScheme,
            60 => OptionNumber::Size1,
            _ => OptionNumber::Unknown(number),
        }
    }
}

impl From<OptionNumber> for u16 {
    fn from(number: OptionNumber) -> Self {
        match number {
            OptionNumber::IfMatch => 1,
            OptionNumber::UriHost => 3,
            OptionNumber::ETag => 4,
            OptionNumber::IfNoneMatch => 5,
            OptionNumber::Observe => 6,
            OptionNumber::UriPort => 7,
            OptionNumber::LocationPath => 8,
            OptionNumber::UriPath => 11,
            OptionNumber::ContentFormat => 12,
            OptionNumber::MaxAge => 14,
            OptionNumber::UriQuery => 15,
            OptionNumber::Accept => 16,
            OptionNumber::LocationQuery => 20,
            OptionNumber::Block2 => 23,
            OptionNumber::Block1 => 27,
            OptionNumber::Size2 => 28,
            OptionNumber::ProxyUri => 35,
            OptionNumber::ProxyScheme => 39,
            OptionNumber::Size1 => 60,
            OptionNumber::Unknown(number) => number,
        }
    }
}

impl Display for OptionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.definition() {
            Some(def) => write!(f, "{}", def.name),
            None => write!(f, "Unknown({})", u16::from(*self)),
        }
    }
}
