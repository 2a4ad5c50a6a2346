//! Completion tracking and event fan-out for transfers.
//!
//! Given a transfer's file list, piece grid, and live piece-completion
//! feed, [`TransferTracker`] derives which pieces belong to which files and
//! detects when each file, the whole download, and the seeding target
//! complete, exposing every condition as a one-shot
//! [`Latch`](tidemark_events::Latch). [`EventStream`] projects one
//! tracker's lifecycle into an ordered, cancellable event sequence for a
//! single subscriber, and [`FanoutRegistry`] multiplexes an open-ended set
//! of trackers into one such stream per subscriber, replaying current
//! membership to late joiners.
//!
//! Events are ephemeral and at most once per subscriber; a subscriber that
//! disconnects does not replay what it missed.

mod config;
mod error;
mod fanout;
mod index;
mod stream;
mod tracker;

pub use config::TrackerConfig;
pub use error::GeometryError;
pub use fanout::FanoutRegistry;
pub use stream::EventStream;
pub use tracker::TransferTracker;
