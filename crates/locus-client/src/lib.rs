//! Client library for the Locus directory.
//!
//! A [`Client`] keeps a mobile device registered with the cluster:
//! it registers with its initial server, follows `WrongServer`
//! redirects to the right authority, migrates when the server hands it
//! off after a move, and keeps its metadata synchronized. Failures are
//! retried with a fixed cap before the session gives up.

mod client;

pub use client::{Client, Phase};
