//! Local development server for AWS Lambda handlers.
//!
//! Serves HTTP routes through lambda handlers with API Gateway style events, answers Cognito calls
//! made by those handlers with canned responses, feeds DynamoDB Local stream records to stream handlers
//! and runs cron handlers on fixed intervals.

pub mod config;
pub mod cron;
pub mod error;
pub mod event;
pub mod handlers;
pub mod lambda;
pub mod mocks;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod stream;

pub use config::{Cli, Config, HandlerSpec};
pub use error::{EmulatorError, EmulatorResult, StreamError};
pub use lambda::{handler_fn, invoke, CommandResolver, Handler, InvocationContext, Registry, Resolver};
pub use server::Engine;
pub use shutdown::{Shutdown, ShutdownTrigger};
