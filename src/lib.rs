//! relaychat - multi-persona chat relay
//!
//! Several chat personas, each bound to its own platform connection, share a
//! conversation.  For every inbound message each persona decides on its own
//! whether to answer, and a persona's group reply can prompt the others to
//! answer in turn, up to a bounded chain depth.
//!
//! The host framework plugs in through traits: [`relay::EventSink`] for
//! re-submitting synthetic chain events, [`generation::ReplyGenerator`] for
//! producing replies, [`relay::ReplyTransport`] for sending them and
//! [`history::HistoryStore`] for conversation history.

pub mod bus;
pub mod cli;
pub mod config;
pub mod generation;
pub mod history;
pub mod persona;
pub mod relay;
pub mod telemetry;
