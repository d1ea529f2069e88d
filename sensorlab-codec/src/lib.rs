//! SensorLab Event Codec Library
//!
//! Encoding and decoding of the SensorLab binary event protocol, and the
//! PCAP-compatible capture container that carries it.
//!
//! # Architecture
//!
//! - Encoder: one pure function per event kind, building the event body
//! - Decoder: stateful; remembers declarations so later references resolve
//!   to fully described properties (node → entities → links/frames → properties)
//! - Capture container: global header plus timestamped, length-prefixed records
//!
//! The library does NOT:
//! - Drive hardware or schedule experiments
//! - Deliver records anywhere
//!
//! Both live in the observer application (sensorlab-observer).
//!
//! # Example Usage
//!
//! ```no_run
//! use sensorlab_codec::{CaptureReader, Decoder, DecoderConfig, DecodedOutput};
//! use std::fs::File;
//!
//! let reader = CaptureReader::new(File::open("experiment.pcap").unwrap()).unwrap();
//! let mut decoder = Decoder::with_config(DecoderConfig::new().with_node_filter(vec![1]));
//!
//! for output in decoder.decode_capture(reader) {
//!     match output {
//!         Ok(DecodedOutput::Record(record)) => println!("{} at {}", record.event.kind(), record.timestamp),
//!         Ok(DecodedOutput::Error(report)) => eprintln!("Bad record: {}", report.error),
//!         Err(e) => eprintln!("Capture error: {}", e),
//!     }
//! }
//! ```

// Public modules
pub mod capture;
pub mod config;
pub mod declarations;
pub mod decoder;
pub mod encoder;
pub mod event;
pub mod types;
pub mod units;

// Re-export main types for convenience
pub use capture::{CaptureError, CaptureReader, CaptureRecord, CaptureWriter, LINK_TYPE_SENSORLAB};
pub use config::DecoderConfig;
pub use declarations::{DeclarationStats, Declarations, FrameKey};
pub use decoder::{DecodedOutput, Decoder, ErrorRecord, Record};
pub use event::{Event, EventKind};
pub use types::{
    node_properties, DecodeError, EncodeError, IdScope, Property, PropertyValue, Result, Timestamp,
};
pub use units::{DataType, Unit, UnitPrefix};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: a fresh decoder only knows the current monitor properties
        let decoder = Decoder::new();
        let stats = decoder.stats();
        assert_eq!(stats.node_properties, 5);
        assert_eq!(stats.entities, 0);
    }
}
