//! XCP bootloader implementation: the host side loader and the target side flash block
//! manager.

pub mod constants;
pub mod device;
pub mod firmware;
pub mod flashing;
pub mod format;
pub mod loader;
pub mod protect;
pub mod protocol;
pub mod target;
pub mod transport;

pub use self::device::{Target, TargetDB};
pub use self::firmware::{FirmwareData, Segment};
pub use self::flashing::Flashing;
pub use self::loader::{LoaderSettings, XcpLoader};
pub use self::protocol::{Command, Response};
pub use self::transport::Transport;
