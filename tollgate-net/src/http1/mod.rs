mod parser;
mod types;

pub use parser::{ParseStatus, RequestParser, ResponseParser};
pub use types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine,
};
