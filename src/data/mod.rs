pub mod parser;
pub mod store;
pub mod types;

pub use parser::{format_digest_line, parse_digest, parse_digest_line, MalformedRowPolicy, ParseError, ParsedDigest};
pub use store::{ArtifactStore, DigestOptions, StoreError, TimeBase};
pub use types::{DigestRow, Side, TradeRecord};
