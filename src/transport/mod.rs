//! Streaming transport: wire frames, decoding, and the WebSocket session.

pub mod frames;
pub mod session;

pub use frames::{EmotionSignal, FrameDecoder, FrameEnvelope, StreamEvent};
pub use session::{SessionHandle, StreamSession};
