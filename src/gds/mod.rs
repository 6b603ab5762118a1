// ABOUTME: Generic Data Stream protocol support: frame model, wire codec, and fragment reassembly
// ABOUTME: Public surface re-exports the pieces a pipeline handler or client needs directly

pub mod codec;
pub mod frame;
pub mod reassembly;

pub use codec::{decode_frame, encode_frame, GdsCodecError};
pub use frame::{FrameType, GdsFrame, GdsHeaders};
pub use reassembly::GdsReassembler;
