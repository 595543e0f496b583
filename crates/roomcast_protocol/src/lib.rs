#![forbid(unsafe_code)]

pub mod frames;

pub use frames::{
	BrokerFrame, ChatEnvelope, ClientFrame, DEFAULT_MAX_FRAME_BYTES, FrameError, decode_broker_frame, decode_client_frame,
	encode_envelope,
};
