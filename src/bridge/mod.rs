//! Bridging MCP capabilities into the host's tool and context model.
//!
//! - `tool`: discovered tools → [`BridgedTool`]s whose results are always
//!   wrapped as untrusted
//! - `resource`: server resources → one untrusted context block
//! - `schema`: JSON-Schema → host parameter types
//! - `untrusted`: the boundary format and injection indicator scan

pub mod resource;
pub mod schema;
pub mod tool;
pub mod untrusted;

pub use resource::{compose_resource_context, server_resource_block, RESOURCE_CONTEXT_HEADER};
pub use schema::{ParamType, Parameter, ToolParameters};
pub use tool::{
    bridge_tools, bridged_tool_name, BridgedTool, ExternalAttachment, FunctionDefinition,
    ToolDefinition, ToolOutput,
};
pub use untrusted::{
    scan_for_injection, wrap_untrusted, END_MARKER, START_MARKER, UNTRUSTED_WARNING,
};
