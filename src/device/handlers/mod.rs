//! Receive-side handlers for the device pipeline.

mod control;
mod crypto;
mod forwarding;
mod handshake;
mod rx_loop;
mod sequential;
mod super_node;

pub(crate) use crypto::{DecryptJob, EncryptJob};
