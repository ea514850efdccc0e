//! msd-core: safety-gated flashing core for BMW MSD80/MSD81 controllers.
//!
//! Consumes a candidate calibration image and, over a CAN bus, unlocks the
//! controller, erases its calibration sectors, streams the new bytes,
//! verifies them, and recomputes the embedded integrity codes.
//!
//! # Architecture
//!
//! The crate is organized into layers, leaves first:
//!
//! - **Transport**: narrow CAN abstraction (socketcan, mock)
//! - **ISO-TP**: ISO 15765-2 segmentation and flow control
//! - **UDS**: diagnostic client, seed/key unlock, service encodings
//! - **Integrity**: CRC zones and slot refresh
//! - **Validate**: the seven-layer pre-flash safety gate
//! - **Session**: the orchestrator driving phases A through G
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use msd_core::config::FlashConfig;
//! use msd_core::session::{FlashRequest, FlashSession};
//! use msd_core::transport::SocketCanTransport;
//!
//! let config = FlashConfig::default();
//! let transport = SocketCanTransport::open(&config.transport.channel).unwrap();
//! let mut session = FlashSession::new(transport, config);
//! let result = session.flash(FlashRequest {
//!     candidate: std::fs::read("tuned.bin").unwrap(),
//!     stock: Some(std::fs::read("stock.bin").unwrap()),
//!     acknowledge_warnings: false,
//!     source_ecu_id: "I8A0S".into(),
//! });
//! ```

pub mod backup;
pub mod config;
pub mod events;
pub mod image;
pub mod integrity;
pub mod isotp;
pub mod oplog;
pub mod session;
pub mod transport;
pub mod uds;
pub mod validate;
pub mod variant;

// Re-exports for convenience
pub use backup::{BackupRecord, BackupStore};
pub use config::FlashConfig;
pub use events::{FlashEvent, FlashObserver, NullObserver, Phase, TracingObserver};
pub use image::CalibrationImage;
pub use integrity::{refresh_all_crcs, verify_all_crcs};
pub use session::{
    CancelToken, FlashError, FlashFailure, FlashRequest, FlashSession, FlashSummary,
    RollbackOutcome,
};
pub use transport::{CanFrame, CanTransport, MockTransport, SocketCanTransport, TransportError};
pub use uds::{DiagClient, DiagError, SeedKeyAlgorithm};
pub use validate::{ValidationLayer, ValidationRefused, validate};
pub use variant::EcuVariant;
