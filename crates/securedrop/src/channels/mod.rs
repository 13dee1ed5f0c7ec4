//! Data channel protocol: control frames, file chunks and transfer assembly

#[cfg(feature = "rtc")]
pub mod data_channel;
pub mod frame;
pub mod transfer;

#[cfg(feature = "rtc")]
pub use data_channel::RtcDataChannel;
pub use frame::{
    decode_payload, decode_tagged_chunk, encode_tagged_chunk, ChannelPayload, ControlFrame,
    FileMeta, InboundFrame,
};
pub use transfer::{stream_file, OutgoingFile, ReceivedFile, TransferAssembler, TransferProgress};
