//! anyclaude core: a protocol-translating reverse proxy library.
//!
//! Accepts Anthropic Messages requests and dispatches them to the upstream
//! Anthropic API (pass-through), an OpenAI-compatible endpoint, or a cluster
//! of OpenAI-compatible inference nodes with cache-affinity routing. On the
//! response side it converts chat-completions chunk streams back into
//! Anthropic SSE events.
//!
//! # Architecture
//!
//! The library is the middle of a three-layer split:
//!
//! - [`stream-event`](stream_event) owns the Anthropic SSE wire shape;
//! - this crate owns translation and the long-lived services (circuit
//!   breaker, cluster router, cache monitor, tool bridge);
//! - the `serve` crate owns HTTP, backpressure, and keepalive.
//!
//! Services are explicitly constructed and passed into handlers; there are
//! no hidden singletons. Each has an init/shutdown lifecycle driven by the
//! CLI.
//!
//! # Request pipeline
//!
//! ```text
//! MessagesRequest
//!   └─ translate::to_neutral        (blocks, tool ids, orphan results)
//!   └─ context::truncate_messages   (window management)
//!   └─ optimizer::optimize          (system prompt)
//!   └─ toolbridge::prepare          (schemas, stubs, skills)
//!   └─ translate::to_openai_messages
//!   └─ backend call → sse::StreamTranslator → Anthropic SSE events
//! ```

pub mod anthropic;
pub mod backend;
pub mod breaker;
pub mod cluster;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod monitor;
pub mod openai;
pub mod optimizer;
pub mod sse;
pub mod toolbridge;
pub mod translate;

pub use backend::{ChatBackend, ChunkStream, HttpChatBackend};
pub use breaker::{BreakerConfig, BreakerMetrics, BreakerState, CircuitBreaker};
pub use cluster::{ClusterCallbacks, ClusterRouter, NodeStatus, RoutingStrategy, SelectedNode};
pub use context::{native_context_limit, usable_context_limit, TokenEstimator};
pub use error::ProxyError;
pub use fingerprint::prompt_fingerprint;
pub use monitor::{CacheMonitor, CacheUsage};
pub use optimizer::{OptimizeOutcome, OptimizerConfig, Strategy};
pub use sse::{StreamTranslator, TranslatorOptions};
pub use toolbridge::{BridgeConfig, SkillStore, ToolBridge};
pub use translate::{to_neutral, to_openai_messages, TranslatedRequest};
