pub mod device;
pub mod regs;
pub mod sim;

pub use device::{BlitDevice, DmaDirection};
pub use sim::SimDevice;
