//! IP intelligence and abuse-decision resolution for a multiplayer
//! pixel-canvas server.
//!
//! The crate answers one question: may the client behind this address
//! (and optionally this user account) place pixels and chat? Answering
//! it well means knowing who owns the address (whois), whether it is a
//! proxy or VPN exit (a reputation API), and what bans moderators have
//! recorded against the address, its ownership block, or the account.
//!
//! The layers, outermost first:
//!
//! - [`resolver::AllowanceResolver`] - the entry point; combines all of
//!   the below into an [`resolver::AllowanceVerdict`] and never errors,
//!   degrading toward fail-open placeholders instead.
//! - [`cache`] - short-TTL volatile verdict cache, keyed by address or
//!   user id.
//! - [`store`] - durable SQLite store of ranges, proxy records, referral
//!   hints, bans, and a rate-limit whitelist.
//! - [`shard`] - routes external lookups over an inter-process bus so
//!   that only the elected primary shard talks to the network.
//! - [`whois`] / [`proxycheck`] - the network clients themselves, with
//!   referral chasing and registry-quirk handling.
//! - [`dedup`] - collapses concurrent identical lookups into one.
//! - [`addr`] / [`range`] - address coarsening and CIDR range algebra.

pub mod addr;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod proxycheck;
pub mod range;
pub mod resolver;
pub mod shard;
pub mod store;
pub mod whois;

pub use addr::{Address, Family};
pub use cache::{MemoryVerdictCache, VerdictCache, VerdictKey};
pub use config::IntelConfig;
pub use error::{IntelError, IntelResult};
pub use resolver::{AllowanceResolver, AllowanceVerdict, RangeInfo};
pub use shard::{AlwaysPrimary, IntelBus, LocalBus, ShardForwarder, ShardRole};
pub use store::{Database, spawn_expiry_sweep};
