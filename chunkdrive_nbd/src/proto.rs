//! NBD wire protocol framing. All fields are big-endian.

use chunkdrive_core::ChunkError;

pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_DISC: u32 = 2;

pub const REQUEST_LEN: usize = 28;
pub const REPLY_LEN: usize = 16;

/// A request header as read off the kernel socket:
/// `magic(4) | cmd(4) | handle(8) | offset(8) | length(4)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub cmd: u32,
    pub handle: [u8; 8],
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub fn parse(buf: &[u8; REQUEST_LEN]) -> Result<Self, ChunkError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != NBD_REQUEST_MAGIC {
            return Err(ChunkError::Protocol(format!(
                "bad request magic {magic:#010x}"
            )));
        }
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        Ok(Request {
            cmd: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            handle,
            offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            length: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle);
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }
}

/// A reply header: `magic(4) | error(4) | handle(8)`, followed by the
/// payload on success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    pub error: u32,
    pub handle: [u8; 8],
}

impl Reply {
    pub fn ok(handle: [u8; 8]) -> Self {
        Reply { error: 0, handle }
    }

    pub fn error(handle: [u8; 8], error: u32) -> Self {
        Reply { error, handle }
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let mut buf = [0u8; REPLY_LEN];
        buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle);
        buf
    }
}
