//! Fragment engine for adaptive HTTP streaming.
//!
//! A [`StreamSession`] opens a flat playlist or a hierarchical manifest,
//! picks the representation closest to a [`Preference`], and exposes the
//! fragments as one continuous byte stream through [`std::io::Read`] and
//! [`std::io::Seek`]. Live streams keep going through URL bumping, manifest
//! refresh or wall-clock fragment numbering.

pub mod clock;
pub mod config;
pub mod error;
pub mod index;
pub mod live;
pub mod locator;
pub mod manifest;
pub mod select;
pub mod session;
pub mod testing;
pub mod transport;

pub use clock::{Clock, SystemClock};
pub use config::{LiveConfig, Preference, SessionConfig};
pub use error::{Result, SluiceError};
pub use index::{FragmentIndex, FragmentStart};
pub use manifest::{ContentKind, Manifest, ManifestFormat, Representation, parse_manifest};
pub use select::select_representation;
pub use session::{Capabilities, Mode, SessionState, StreamSession};
pub use transport::{FileTransport, SchemeTransport, SubStream, Transport};
#[cfg(feature = "http")]
pub use transport::{HttpTransport, HttpTransportConfig};
