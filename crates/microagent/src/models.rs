//! These models represent the objects passed around by the agent
//!
//! There are a few related formats we need to interact with:
//! - openai chat-completions messages/tools, sent from the model client to the LLM
//! - MCP tool listings and call results, received from the tool servers
//! - the transcript records handed to a record sink at the end of a run
//!
//! We always immediately convert those data models into the internal structs using to/from
//! helpers, so the internal models are not an exact match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
