//! Core data types for the WaveCast audio engine
//!
//! This crate defines the units of data that move through the engine:
//! tagged audio packets on the ingest side and processed audio chunks
//! on the mix side, together with the wire codecs that matter for
//! compatibility (Scream headers, RTP, SAP/SDP) and the bounded lanes
//! components use to hand data to each other.

pub mod chunk;
pub mod error;
pub mod format;
pub mod ids;
pub mod packet;
pub mod ring;
pub mod rtp;
pub mod sap;
pub mod scream;

pub use chunk::{PlayoutStamp, ProcessedChunk};
pub use error::{PacketError, Result};
pub use format::{AudioFormat, BitDepth};
pub use ids::{InstanceId, SinkId, SourceTag};
pub use packet::{StreamItem, TaggedPacket};
pub use ring::{chunk_ring, packet_lane, ChunkRx, ChunkTx, PacketLaneRx, PacketLaneTx, SinkRingSet};
