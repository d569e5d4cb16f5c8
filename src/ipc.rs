//! Pipe messaging layer between the client and the yues server.
//!
//! The server reads requests from one named pipe and writes results and
//! notifications to another. Both directions carry newline-delimited JSON.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐    inbound FIFO (requests)     ┌──────────────┐
//! │  MessagingInterface  │ ─────────────────────────────► │              │
//! │  (correlation table, │                                │ yues server  │
//! │   reader task)       │ ◄───────────────────────────── │              │
//! └──────────────────────┘  outbound FIFO (results, INIT, └──────────────┘
//!                                          POSTMESSAGE)
//! ```
//!
//! # Protocol
//!
//! ```text
//! {"type":"IIFE","id":"…","body":"return a","argNames":["a"],"args":[1]}
//! {"type":"IIFE_R","id":"…","res":1}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use yues_bridge::ipc::MessagingInterface;
//!
//! let messaging = MessagingInterface::open(&in_fifo, &out_fifo).await?;
//! messaging.await_ready().await?;
//! let value = messaging.iife("return 40 + 2", &[], vec![]).await?;
//! ```

mod client;
mod framing;

pub use client::{MessagingInterface, NotificationHandler, Subscription};
pub use framing::{decode_line, encode_line, write_message, LineDecoder, MAX_LINE_SIZE};
