use std::fmt::Display;

/// Registered content-format identifiers, the lookup table consumers use to
/// pretty-print payloads. Unregistered identifiers are retained.
///
/// See [RFC 7252 - Section 12.3](https://datatracker.ietf.org/doc/html/rfc7252#section-12.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain,
    LinkFormat,
    ApplicationXml,
    ApplicationOctetStream,
    ApplicationExi,
    ApplicationJson,
    ApplicationCbor,
    Unknown(u16),
}

impl ContentFormat {
    pub fn name(&self) -> Option<&'static str> {
        let name = match self {
            ContentFormat::TextPlain => "text/plain;charset=utf-8",
            ContentFormat::LinkFormat => "application/link-format",
            ContentFormat::ApplicationXml => "application/xml",
            ContentFormat::ApplicationOctetStream => "application/octet-stream",
            ContentFormat::ApplicationExi => "application/exi",
            ContentFormat::ApplicationJson => "application/json",
            ContentFormat::ApplicationCbor => "application/cbor",
            ContentFormat::Unknown(_) => return None,
        };

        Some(name)
    }
}

impl From<u16> for ContentFormat {
    fn from(id: u16) -> Self {
        match id {
            0 => ContentFormat::TextPlain,
            40 => ContentFormat::LinkFormat,
            41 => ContentFormat::ApplicationXml,
            42 => ContentFormat::ApplicationOctetStream,
            47 => ContentFormat::ApplicationExi,
            50 => ContentFormat::ApplicationJson,
            60 => ContentFormat::ApplicationCbor,
            _ => ContentFormat::Unknown(id),
        }
    }
}

impl From<ContentFormat> for u16 {
    fn from(format: ContentFormat) -> Self {
        match format {
            ContentFormat::TextPlain => 0,
            ContentFormat::LinkFormat => 40,
            ContentFormat::ApplicationXml => 41,
            ContentFormat::ApplicationOctetStream => 42,
            ContentFormat::ApplicationExi => 47,
            ContentFormat::ApplicationJson => 50,
            ContentFormat::ApplicationCbor => 60,
            ContentFormat::Unknown(id) => id,
        }
    }
}

impl Display for ContentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "content-format/{}", u16::from(*self)),
        }
    }
}
