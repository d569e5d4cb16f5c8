//! yues-bridge Library
//!
//! This library drives a `yues` server process over two named pipes:
//!
//! - `ipc` - line framing and the request/notification multiplexer
//! - `protocol` - wire message types and correlation keys
//! - `remote_func` - lazily registered server-side function proxies
//! - `server` - child process lifecycle and escalating shutdown
//! - `fifo` - named pipe allocation and cleanup
//! - `config` - session configuration
//!
//! # Server Module
//!
//! `Server` is the entry point for most applications:
//!
//! ```ignore
//! use yues_bridge::{Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::from_env());
//! server.start().await?;
//! server.on_notification(|value| println!("{}", value))?;
//! let add = server.create_function("return a + b", &["a".into(), "b".into()]).await?;
//! let three = add.invoke(vec![1.into(), 2.into()]).await?;
//! server.shutdown().await?;
//! ```

pub mod config;
pub mod error;
pub mod fifo;
pub mod ipc;
pub mod protocol;
pub mod remote_func;
pub mod server;

pub use config::{ServerConfig, ShutdownAction, ShutdownPolicy, ShutdownTier};
pub use error::{BridgeError, Result};
pub use remote_func::RemoteFunction;
pub use server::{Server, ServerState, ShutdownOutcome, StoppedBy};
