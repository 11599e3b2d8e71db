//! Core emulator primitives and traits.

pub mod cpu_6502;
pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// A completed frame of palette indices.
    ///
    /// Each pixel is an index into the console's palette RAM; turning it into
    /// RGB is left to whoever presents the frame.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u8>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }

        pub fn from_pixels(width: u32, height: u32, pixels: &[u8]) -> Self {
            debug_assert_eq!(pixels.len(), (width * height) as usize);
            Self {
                width,
                height,
                pixels: pixels.to_vec(),
            }
        }

        pub fn pixel(&self, x: u32, y: u32) -> u8 {
            self.pixels[(y * self.width + x) as usize]
        }
    }
}

use serde_json::Value;

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Emulate until a frame is produced and return a framebuffer.
    fn step_frame(&mut self) -> Result<types::Frame, Self::Error>;

    /// Return a JSON snapshot of registers and timing for debugging.
    fn debug_state(&self) -> Value;
}
