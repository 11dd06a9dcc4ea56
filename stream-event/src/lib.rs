//! Anthropic stream event protocol: event types + SSE framing.
//!
//! This crate defines the wire shape of a single Anthropic streaming event and
//! the SSE frame writer. It does not depend on HTTP or on the proxy core; the
//! core's stream translator produces `StreamEvent`s and the server calls
//! [`frame`] to turn each one into bytes on the response body.

pub mod event;
pub mod frame;

pub use event::{
    normalize_stop_reason, ContentBlock, ContentDelta, ErrorPayload, MessageDelta, MessageShell,
    StreamEvent, Usage,
};
pub use frame::{frame, keepalive_comment};
