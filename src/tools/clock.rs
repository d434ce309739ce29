use chrono::{SecondsFormat, Utc};
use serde_json::json;

use super::{ToolDescriptor, ToolOutput};

pub fn current_time_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn(
        "current_time",
        "Returns the current UTC time as RFC 3339 text and unix seconds.",
        |_params, _state| async {
            let now = Utc::now();
            ToolOutput::ok(json!({
                "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "unix_utc_seconds": now.timestamp(),
            }))
        },
    )
}
