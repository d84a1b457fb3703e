//! Slave side of the bootloader: the flash block manager and the activation detector.

pub mod activation;
pub mod flash;

pub use self::activation::{ActivationDetector, ByteReceiver, UartDetector};
pub use self::flash::{ChecksumConfig, FlashBlockManager, FlashDevice, FlashError, FlashLayout, Sector};

/// Keep-alive hook for long running loops.
///
/// Called on every iteration of the erase loop, the block copy loop and the CONNECT retry
/// loop. Hosted builds pass a no-op closure.
pub trait Watchdog {
    fn service(&mut self);
}

impl<F: FnMut()> Watchdog for F {
    fn service(&mut self) {
        self()
    }
}
