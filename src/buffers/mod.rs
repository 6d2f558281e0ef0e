//! Reusable fixed-capacity packet buffers. Every outbound datagram is staged
//!  in a [fixed_buffer::FixedBuf] sized for the configured payload plus the
//!  envelope trailer, and buffers cycle through a [buffer_pool::PacketBufferPool]
//!  so the datagram hot path does not allocate.

pub mod buffer_pool;
pub mod fixed_buffer;
