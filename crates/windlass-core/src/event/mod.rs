//! Streaming notifier: fire-and-forget event distribution for live
//! observers.

pub mod bus;
