//! # crossflash
//!
//! A Rust library for low-level flashing and recovery of Android devices
//! across vendors.
//!
//! Three device-side wire protocols are spoken natively: Google Fastboot
//! over USB bulk endpoints, and the MediaTek BROM and Download Agent (DA)
//! protocols over USB-CDC serial. On top of those sit two container codecs
//! (Android Sparse images and Chrome OS update_engine `payload.bin`) plus a
//! range-reading HTTP client that can pull a single partition out of a
//! multi-gigabyte OTA ZIP without downloading the rest of it.
//!
//! ## Main Features
//!
//! - Fastboot: variable queries, chunked `download`/`flash` bounded by the
//!   device's `max-download-size`, erase, A/B slot control, lock state
//! - MediaTek: BROM handshake and chip identification, two-stage DA upload
//!   with mid-flow USB re-enumeration, partition I/O over the XML (V6) and
//!   XFlash (V5) wire variants
//! - Sparse images: full reader/writer plus a transfer chunker that splits
//!   any image into standalone pieces below a byte budget
//! - OTA payloads: manifest parsing and partition extraction from local
//!   files, local ZIPs, or remote ZIPs via HTTP range requests
//! - Progress reporting and event callbacks
//!
//! ## Usage Example
//!
//! ```no_run
//! use crossflash::{fastboot::FastbootSession, Event};
//! use std::{path::Path, sync::Arc};
//!
//! let callback = Arc::new(|event: Event| {
//!     if let Event::FlashProgress(progress) = event {
//!         println!("{}: {:.1}%", progress.partition, progress.percent);
//!     }
//! });
//!
//! let mut session = FastbootSession::open_first(Some(callback)).unwrap();
//! session.flash_file("boot_a", Path::new("boot.img")).unwrap();
//! session.reboot().unwrap();
//! ```
//!
//! ## Device Connection
//!
//! Fastboot devices must be in the bootloader (or fastbootd); MediaTek
//! devices must be caught in BROM or Preloader mode, usually by holding a
//! volume key while plugging in. On Linux, [`host_setup`] installs udev
//! rules for the supported vendor IDs.

mod device;
mod setup;
mod watchdog;

pub mod fastboot;
pub mod mtk;
pub mod payload;
pub mod remote;
pub mod sparse;
pub mod transport;

use std::sync::Arc;

pub use device::{list_usb_devices, DeviceInfo, UsbVendor};
pub use fastboot::{FastbootSession, FlashPhase, FlashProgress};
pub use mtk::loader::LoaderState;
pub use setup::host_setup;
pub use transport::CancelToken;

/// Callback type for receiving library events
///
/// This is used to observe the flashing process: progress updates, device
/// connection status, and protocol state transitions.
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Events emitted during device operations
///
/// These events are sent to the callback function to notify about
/// the progress and status of the current operation.
#[derive(Debug)]
pub enum Event {
  /// Indicates the tool is searching for a connected device
  FindingDevice,
  /// Indicates a device was found and reports its descriptor
  DeviceFound(DeviceInfo),
  /// Indicates the tool is attempting to connect to the device
  Connecting,
  /// Indicates a successful connection to the device
  Connected,
  /// An `INFO`/`TEXT` line received from a fastboot device
  FastbootInfo(String),
  /// Provides progress information for the current transfer
  FlashProgress(FlashProgress),
  /// The MediaTek loader pipeline moved to a new state
  LoaderState(LoaderState),
  /// The device dropped off the bus and is being waited for
  Reenumerating,
  /// The device is being rebooted or shut down
  Resetting,
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during flashing and recovery operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// Error from the USB subsystem
  #[error("USB error: {0}")]
  Usb(#[from] rusb::Error),

  /// Error from the serial-port subsystem
  #[error("serial port error: {0}")]
  Serial(#[from] serialport::Error),

  /// I/O related error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// Error converting slices
  #[error("slice conversion error: {0}")]
  Bytes(#[from] std::array::TryFromSliceError),

  /// UTF-8 conversion error
  #[error("UTF8 conversion error: {0}")]
  Utf8(#[from] std::string::FromUtf8Error),

  /// JSON serialization error
  #[error("failed to serialize json: {0}")]
  Json(#[from] serde_json::Error),

  /// Zip archive error
  #[error("zip error: {0}")]
  Zip(#[from] zip::result::ZipError),

  /// HTTP client error
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  /// Error retrieving host system information
  #[error("whoami error: {0}")]
  Whoami(#[from] whoami::Error),

  /// Error when no matching device is found
  #[error("device not found!")]
  NotFound,

  /// Error when an operation requires a connected transport
  #[error("transport is not connected")]
  NotConnected,

  /// Error when a wire operation exceeds its time budget
  #[error("I/O timed out after {0:?}")]
  IoTimeout(std::time::Duration),

  /// Error when the transport closed underneath an operation
  #[error("transport closed")]
  IoClosed,

  /// Error when the operation was cancelled by the caller
  #[error("operation cancelled")]
  Cancelled,

  /// Error when the device did not reappear after re-enumeration
  #[error("device did not re-enumerate within {0:?}")]
  ReenumerationFailed(std::time::Duration),

  /// Error when an argument value is outside the accepted set
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// Fastboot reply with an unknown 4-byte prefix
  #[error("unexpected fastboot response prefix: {0:?}")]
  UnexpectedPrefix(String),

  /// Fastboot `DATA` phase length disagreement
  #[error("fastboot size mismatch: host queued {host} bytes, device declared {device}")]
  SizeMismatch { host: u64, device: u64 },

  /// Fastboot `FAIL` reply; the payload is the device's message
  #[error("device replied FAIL: {0}")]
  DeviceFail(String),

  /// MediaTek BROM handshake never completed
  #[error("BROM handshake failed after {0} attempts")]
  HandshakeFailed(usize),

  /// MediaTek chip missing from both the chip table and the alias table
  #[error("unknown MediaTek chip: hw_code {0:#06x}")]
  UnknownChip(u16),

  /// MediaTek device refused an operation due to its security configuration
  #[error("device security locked (target config {0:#010x})")]
  SecurityLocked(u32),

  /// DA image rejected by checksum comparison
  #[error("DA checksum mismatch: host {host:#06x}, device {device:#06x}")]
  DaSignatureMismatch { host: u16, device: u16 },

  /// DA or BROM replied with a non-success status word
  #[error("device rejected command with status {0:#010x}")]
  DaRejected(u32),

  /// Exploit preconditions were not met for this chip or session
  #[error("exploit not applicable: {0}")]
  ExploitNotApplicable(String),

  /// DA refused the runtime-parameter exchange
  #[error("DA refused runtime parameters (status {0:#010x})")]
  RuntimeParametersRefused(u32),

  /// Malformed Android Sparse image
  #[error("invalid sparse image: {0}")]
  SparseInvalid(String),

  /// Payload file does not begin with the `CrAU` magic
  #[error("payload magic mismatch")]
  PayloadMagicMismatch,

  /// Payload major version below the supported minimum
  #[error("unsupported payload version: {0}")]
  UnsupportedVersion(u64),

  /// Structurally invalid payload manifest
  #[error("malformed payload manifest: {0}")]
  ManifestMalformed(String),

  /// Install operation type with no registered handler
  #[error("unsupported install operation type: {0}")]
  UnsupportedOperation(u32),

  /// Compressed install operation hit with no decompressor configured
  #[error("no decompressor available for operation type {0}")]
  DecompressorUnavailable(u32),

  /// Structurally invalid ZIP container
  #[error("malformed zip: {0}")]
  ZipMalformed(String),

  /// `payload.bin` entry missing from the archive
  #[error("payload.bin not found in archive")]
  PayloadBinNotFound,

  /// `payload.bin` stored with an unsupported compression method
  #[error("unsupported zip compression method: {0}")]
  ZipMethodUnsupported(u16),
}

/// Default budget for a single command round-trip.
pub(crate) const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Budget for data-phase transfers (bulk streaming, erase).
pub(crate) const DATA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
/// Per-attempt budget for the MediaTek BROM handshake.
pub(crate) const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);
/// How long a device may take to come back after re-enumeration.
pub(crate) const RECONNECT_WINDOW: std::time::Duration = std::time::Duration::from_secs(15);

/// Block size streamed over the wire in one write.
pub(crate) const STREAM_BLOCK_SIZE: usize = 64 * 1024;
/// `max-download-size` assumed when a device does not report one.
pub(crate) const DEFAULT_MAX_DOWNLOAD: u64 = 512 * 1024 * 1024;
