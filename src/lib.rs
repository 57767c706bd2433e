#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod framing;
pub mod poller;
pub mod pool;
pub mod promise;
pub mod transport;

pub use codec::{BreakToken, Codec, Incoming, MessageId};
pub use config::EngineConfig;
pub use connection::{Connection, Operation};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use poller::Backend;
pub use pool::{Execution, ThreadPool};
pub use promise::{Outcome, Promise, PromiseState};
