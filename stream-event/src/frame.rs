//! SSE framing: `event: <name>\ndata: <json>\n\n` plus keepalive comments.

use crate::event::StreamEvent;

/// Serializes one event to a full SSE frame.
///
/// Serialization of these derive-built payloads cannot fail; a failure would
/// be a programming error, so it degrades to an error frame rather than
/// panicking on the response path.
pub fn frame(event: &StreamEvent) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("event: {}\ndata: {}\n\n", event.name(), json),
        Err(_) => {
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"api_error\",\"message\":\"event serialization failed\"}}\n\n"
                .to_string()
        }
    }
}

/// An SSE comment used to keep intermediaries from closing an idle stream:
/// `: keepalive N\n\n`.
pub fn keepalive_comment(n: u64) -> String {
    format!(": keepalive {}\n\n", n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ContentDelta, MessageShell, StreamEvent};

    /// **Scenario**: a frame has the event line, the data line, and the
    /// blank-line terminator, in that order.
    #[test]
    fn frame_layout() {
        let ev = StreamEvent::MessageStart {
            message: MessageShell::assistant("msg_1", "m"),
        };
        let f = frame(&ev);
        assert!(f.starts_with("event: message_start\ndata: {"));
        assert!(f.ends_with("}\n\n"));
        // data payload parses back to the same event type
        let data = f
            .lines()
            .find(|l| l.starts_with("data: "))
            .and_then(|l| l.strip_prefix("data: "))
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(v["type"], "message_start");
    }

    /// **Scenario**: keepalive comments are SSE comments, not events.
    #[test]
    fn keepalive_is_a_comment() {
        assert_eq!(keepalive_comment(3), ": keepalive 3\n\n");
        assert!(keepalive_comment(0).starts_with(':'));
    }

    /// **Scenario**: delta frames round-trip through the SSE data payload.
    #[test]
    fn delta_frame_round_trip() {
        let ev = StreamEvent::ContentBlockDelta {
            index: 2,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "\"SF\"}".into(),
            },
        };
        let f = frame(&ev);
        let data = f.strip_prefix("event: content_block_delta\ndata: ").unwrap();
        let parsed: StreamEvent = serde_json::from_str(data.trim()).unwrap();
        match parsed {
            StreamEvent::ContentBlockDelta { index, delta } => {
                assert_eq!(index, 2);
                match delta {
                    ContentDelta::InputJsonDelta { partial_json } => {
                        assert_eq!(partial_json, "\"SF\"}")
                    }
                    _ => panic!("expected input_json_delta"),
                }
            }
            _ => panic!("expected content_block_delta"),
        }
    }
}
