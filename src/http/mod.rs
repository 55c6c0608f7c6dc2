//! HTTP/1.1 types and incremental parsing.

pub mod headers;
pub mod request;
pub mod response;
pub mod status;
pub mod tokenizer;

pub use headers::HeaderMap;
pub use request::Request;
pub use response::Response;
pub use status::reason_phrase;
pub use tokenizer::{HttpEvent, HttpTokenizer, RequestHead, Tokenizer};
