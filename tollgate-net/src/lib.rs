mod http1;
mod target;
mod tunnel;

pub use http1::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseStatus, ParseWarning,
    ParseWarningKind, RequestHead, RequestLine, RequestParser, ResponseHead, ResponseParser,
    StatusLine,
};

pub use target::{Target, TargetError, resolve_target, split_host_port};

pub use tunnel::{
    CONNECTION_ESTABLISHED, ProxyCredentials, RequestForm, build_connect_request,
    forward_request_head, is_success_status, status_response,
};
