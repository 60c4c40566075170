//! Binary wire format for the distributed tier

pub mod payload;
pub mod varint;

pub use payload::{try_parse, write_payload, ParsedFields, PayloadParse, PROTOCOL_VERSION, SENTINEL};
pub use varint::{read_varint, write_varint, MAX_VARINT_LEN};
