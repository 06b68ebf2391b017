//! The CPIM header block prepended once to every outbound message body.

use bytes::Bytes;

use crate::message::MsrpUri;

pub const CPIM_CONTENT_TYPE: &str = "message/cpim";

/// Addressing and content metadata recovered from a message's CPIM header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub from: Option<String>,
    pub to: Option<String>,
    pub content_type: Option<String>,
}

/// Render the header block: message headers, a blank line, content headers, a blank line.
pub fn header_block(from: &MsrpUri, to: &MsrpUri, content_type: &str) -> Bytes {
    Bytes::from(format!(
        "From: <{from}>\r\nTo: <{to}>\r\n\r\nContent-Type: {content_type}\r\n\r\n"
    ))
}

/// Parse a header block produced by [`header_block`]. Unknown headers are ignored.
pub fn parse_header(block: &[u8]) -> MessageMetadata {
    let text = String::from_utf8_lossy(block);
    let mut metadata = MessageMetadata::default();

    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_start_matches('<').trim_end_matches('>');
        match name.trim().to_ascii_lowercase().as_str() {
            "from" => metadata.from = Some(value.to_string()),
            "to" => metadata.to = Some(value.to_string()),
            "content-type" => metadata.content_type = Some(value.to_string()),
            _ => {}
        }
    }

    metadata
}
