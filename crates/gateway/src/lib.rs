//! Gateway: HTTP control surface over messaging sessions and the inbound
//! relay pipeline.
//!
//! Lifecycle:
//! 1. Connect the dedup store (fatal when unreachable)
//! 2. Wire session store, login orchestrator, supervisor and relays
//! 3. Serve HTTP (register, send, QR page, static files, health)
//! 4. On SIGINT/SIGTERM stop accepting requests, then disconnect and persist
//!    every live session within the grace period
//!
//! The messaging network itself sits behind [`wapi_channels::Connector`].

pub mod dedup;
pub mod error;
pub mod login;
pub mod qr;
pub mod relay;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    dedup::{DedupLedger, DedupStoreError, RedisLedger},
    error::ApiError,
    login::{LoginError, LoginOrchestrator, LoginStart},
    relay::{InboundRelay, MessageRelay, RelayOutcome, SendError},
    server::{build_gateway_app, start_gateway},
    state::{GatewaySettings, GatewayState},
    supervisor::{ShutdownReport, Supervisor},
    webhook::{RelayDeliveryError, WebhookClient},
};
