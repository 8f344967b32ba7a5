//! mxagent shared library: identifiers, Matrix wire types, and the error taxonomy used by the agent.

pub mod api;
pub mod constants;
pub mod error;
pub mod ids;
