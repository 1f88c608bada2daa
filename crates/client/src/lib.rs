//! Client-side tracking of long-running server jobs.
//!
//! A [`JobWatcher`] starts one [`JobHandle`] per job. The handle runs a
//! polling transport, a push-channel transport, or both, funnels everything
//! they report through the [`reducer`], and hands the resulting
//! [`JobSnapshot`]s to subscribers in application order.
//!
//! ```no_run
//! # async fn demo() -> jobwatch_client::Result<()> {
//! use jobwatch_client::{JobWatcher, TrackOptions, WatchConfig};
//!
//! let watcher = JobWatcher::new(WatchConfig::from_env()?)?;
//! let handle = watcher.start("gen-42", TrackOptions::hybrid())?;
//! let mut updates = handle.subscribe();
//! while let Some(snapshot) = updates.next().await {
//!     println!("{} {:.0}%", snapshot.status, snapshot.progress * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod normalize;
pub mod reconnect;
pub mod reducer;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{PollConfig, ProgressScale, StreamConfig, WatchConfig};
pub use error::{Result, TrackError};
pub use handle::{JobHandle, JobWatcher, Listener, Subscription, TrackOptions};
pub use jobwatch_types::{
    ConnectionState, FailureKind, JobFailure, JobId, JobSnapshot, JobStatus, ProgressUpdate,
    RemoteStatus,
};
pub use reconnect::{Backoff, CloseKind, ReconnectPolicy};
pub use transport::{
    EventSink, HttpStatusSource, PollTransport, StatusSource, StreamTransport, TransportEvent,
};

/// reqwest and tokio-tungstenite can pull in different rustls backends;
/// pick aws-lc-rs unless the embedding application already chose one.
pub fn install_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        // Losing the race to another installer is fine.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}
