use serde_json::json;

use super::{ToolDescriptor, ToolOutput};

pub const EXIT_LOOP_TOOL_NAME: &str = "exit_loop";

/// Signals the enclosing loop to stop after the current iteration.
pub fn exit_loop_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn(
        EXIT_LOOP_TOOL_NAME,
        "Call this tool when you are fully satisfied with the result of your review and no \
         further improvements are necessary. It ends the current review loop.",
        |_params, _state| async { ToolOutput::escalate(json!({ "exited": true })) },
    )
}
