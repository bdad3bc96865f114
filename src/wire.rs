//! Fixed 68-byte binary wire format for best-effort sample egress to an external
//! consumer (e.g. an ML scoring engine), plus the `AF_UNIX SOCK_DGRAM` transport.
//!
//! Grounded on `ipc_socket.c`'s `ipc_sample_wire_t` / `ipc_socket_send`: each field is
//! encoded individually in a fixed (little-endian, host-implicit) order rather than by
//! reinterpreting the in-memory `Sample` struct, so the wire layout cannot silently
//! drift if `Sample`'s field order or padding ever changes.

use std::io;
use std::os::unix::net::UnixDatagram;

use crate::sample::Sample;

pub const WIRE_SAMPLE_LEN: usize = 68;

/// Encodes `sample` into the fixed 68-byte wire format.
pub fn encode(sample: &Sample) -> [u8; WIRE_SAMPLE_LEN] {
    let mut buf = [0u8; WIRE_SAMPLE_LEN];
    let mut off = 0;

    macro_rules! put {
        ($val:expr) => {{
            let bytes = $val.to_le_bytes();
            buf[off..off + bytes.len()].copy_from_slice(&bytes);
            off += bytes.len();
        }};
    }

    put!(sample.timestamp_ns);
    put!(sample.cache_references);
    put!(sample.cache_misses);
    put!(sample.branch_instructions);
    put!(sample.branch_misses);
    put!(sample.cycles);
    put!(sample.instructions);
    put!(sample.cache_miss_rate);
    put!(sample.branch_miss_rate);
    put!(sample.ipc);

    debug_assert_eq!(off, WIRE_SAMPLE_LEN);
    buf
}

/// Decodes a 68-byte wire buffer back into a [`Sample`]. Used by tests to verify the
/// encoding round-trips; the production path is encode-only (egress never reads back).
pub fn decode(buf: &[u8; WIRE_SAMPLE_LEN]) -> Sample {
    let mut off = 0;

    macro_rules! take {
        ($ty:ty) => {{
            const N: usize = std::mem::size_of::<$ty>();
            let value = <$ty>::from_le_bytes(buf[off..off + N].try_into().unwrap());
            off += N;
            value
        }};
    }

    let timestamp_ns = take!(u64);
    let cache_references = take!(u64);
    let cache_misses = take!(u64);
    let branch_instructions = take!(u64);
    let branch_misses = take!(u64);
    let cycles = take!(u64);
    let instructions = take!(u64);
    let cache_miss_rate = take!(f32);
    let branch_miss_rate = take!(f32);
    let ipc = take!(f32);

    Sample {
        timestamp_ns,
        cycles,
        instructions,
        cache_references,
        cache_misses,
        branch_instructions,
        branch_misses,
        cache_miss_rate,
        branch_miss_rate,
        ipc,
    }
}

/// Best-effort egress socket: a non-blocking, connected `AF_UNIX SOCK_DGRAM` that
/// silently drops samples when the peer is slow, absent, or refuses the connection.
pub struct Egress {
    socket: UnixDatagram,
}

impl Egress {
    /// Connects to `path`. Failure here just means no ML engine is listening yet,
    /// callers should treat it as non-fatal and keep running detection-only.
    pub fn connect(path: &str) -> io::Result<Egress> {
        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        socket.connect(path)?;
        Ok(Egress { socket })
    }

    /// Sends one sample. Transient failures (peer not ready, buffer full, or gone) are
    /// swallowed; only truly unexpected errors are surfaced for one-time logging by the
    /// caller.
    pub fn send(&self, sample: &Sample) {
        let buf = encode(sample);
        if let Err(e) = self.socket.send(&buf) {
            match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionRefused => {}
                _ => tracing::debug!(error = %e, "egress send failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        Sample {
            timestamp_ns: 123_456_789,
            cycles: 5_000,
            instructions: 10_000,
            cache_references: 900,
            cache_misses: 42,
            branch_instructions: 600,
            branch_misses: 12,
            cache_miss_rate: 0.0466,
            branch_miss_rate: 0.02,
            ipc: 2.0,
        }
    }

    #[test]
    fn encoded_length_is_fixed_68_bytes() {
        let buf = encode(&sample());
        assert_eq!(buf.len(), WIRE_SAMPLE_LEN);
    }

    #[test]
    fn encode_decode_round_trips() {
        let s = sample();
        let buf = encode(&s);
        let decoded = decode(&buf);
        assert_eq!(decoded, s);
    }

    #[test]
    fn field_order_matches_timestamp_first() {
        let buf = encode(&sample());
        let ts = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        assert_eq!(ts, 123_456_789);
    }
}
