//! Paced DNS query load generation.
//!
//! A [`dns::PacketTemplate`] is built once and refreshed in place for every
//! query. A [`generator::LoadGenerator`] drives any [`caller::Caller`] at a
//! target rate with bounded concurrency, per-call timeouts and panic
//! recovery, and a [`stats::StatsAggregator`] turns the outcomes into a
//! [`stats::Report`].

pub mod caller;
pub mod config;
pub mod dns;
pub mod dns_caller;
pub mod domains;
pub mod error;
pub mod generator;
pub mod json_tcp;
pub mod rcode;
pub mod stats;
pub mod ticket;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use caller::{CallResult, Caller, RawRequest, RawResponse, ResultCode};
pub use config::JobConfig;
pub use dns::{PacketTemplate, Protocol, QueryOptions};
pub use dns_caller::{DnsCaller, DnsCallerOptions, ReadMode};
pub use error::{LoaderError, Result};
pub use generator::{LoadGenerator, RunSpec, Status};
pub use json_tcp::{ArithServer, JsonTcpCaller};
pub use rcode::Rcode;
pub use stats::{Report, StatsAggregator};
pub use ticket::{Ticket, TicketPool};
