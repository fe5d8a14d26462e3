//! The privileged side: request wire format, request validation and the
//! operations run as root on behalf of the controller.

pub mod archive;
pub mod exec;
pub mod mounts;
pub mod ops;
pub mod protocol;
pub mod server;

pub use ops::RootCommand;
pub use protocol::{AgentRequest, OpType, Status};
pub use server::{Dispatcher, RequestHandler};
