//! Serves a [`TreeReader`] through the Linux NBD kernel interface.
//!
//! Two cooperating workers: worker A hands the kernel one end of a
//! socket pair and then blocks inside the kernel's do-it loop until
//! disconnect; worker B reads request headers off the other end,
//! serves READs via the reader, and writes replies strictly in
//! request order.

pub mod device;
pub mod proto;

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chunkdrive_core::{ChunkError, TreeReader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use device::NbdDevice;
use proto::{NBD_CMD_DISC, NBD_CMD_READ, REQUEST_LEN, Reply, Request};

/// Attaches `reader` to the NBD device at `device_path` and serves
/// requests until the kernel disconnects. Returns on clean
/// disconnect; protocol violations abort with an error.
pub async fn serve(device_path: &Path, reader: Arc<TreeReader>) -> anyhow::Result<()> {
    let block_size = u64::from(reader.block_size());
    // Rounds down: a tail smaller than one block is not addressable
    // through the device.
    let block_count = reader.total_size() / block_size;

    let (kernel_sock, server_sock) = std::os::unix::net::UnixStream::pair()
        .context("failed to create the NBD socket pair")?;

    let device = NbdDevice::open(device_path)
        .with_context(|| format!("failed to open NBD device {}", device_path.display()))?;
    device.set_block_size(block_size)?;
    device.set_block_count(block_count)?;
    device.set_read_only()?;
    device.set_socket(kernel_sock.as_raw_fd())?;
    info!(
        device = %device_path.display(),
        block_size,
        block_count,
        "NBD device configured"
    );

    // Worker A: the kernel owns this thread until disconnect.
    let do_it = tokio::task::spawn_blocking(move || {
        let result = device.run();
        let _ = device.clear_queue();
        let _ = device.clear_socket();
        drop(kernel_sock);
        result
    });

    // Worker B: the request loop.
    server_sock.set_nonblocking(true)?;
    let sock = tokio::net::UnixStream::from_std(server_sock)?;
    let served = request_loop(sock, &reader).await;

    do_it
        .await
        .context("NBD kernel worker panicked")?
        .context("NBD do-it loop failed")?;
    served
}

/// Serves NBD requests from `sock` until disconnect or end of stream.
/// Split from [`serve`] so it can be exercised without a kernel.
pub async fn request_loop<S>(mut sock: S, reader: &TreeReader) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; REQUEST_LEN];
    loop {
        match sock.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("request socket closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let request = Request::parse(&header)?;
        match request.cmd {
            NBD_CMD_READ => {
                debug!(offset = request.offset, length = request.length, "read");
                match reader.read_at(request.offset, u64::from(request.length)).await {
                    Ok(payload) => {
                        sock.write_all(&Reply::ok(request.handle).encode()).await?;
                        sock.write_all(&payload).await?;
                    }
                    Err(err) => {
                        warn!(
                            offset = request.offset,
                            length = request.length,
                            error = %err,
                            "read failed"
                        );
                        sock.write_all(&Reply::error(request.handle, errno_for(&err)).encode())
                            .await?;
                    }
                }
            }
            NBD_CMD_DISC => {
                info!("disconnect requested");
                return Ok(());
            }
            other => {
                return Err(ChunkError::Protocol(format!("unknown NBD command {other}")).into());
            }
        }
    }
}

fn errno_for(err: &ChunkError) -> u32 {
    match err {
        ChunkError::NotFound(_) => libc::ENOENT as u32,
        ChunkError::OutOfRange { .. } => libc::EINVAL as u32,
        ChunkError::Shared(inner) => errno_for(inner),
        _ => libc::EIO as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chunkdrive_core::{BlobStore, ImportOptions, Section, import};
    use chunkdrive_store_memory::MemoryStore;
    use proto::{NBD_REPLY_MAGIC, REPLY_LEN};

    async fn serve_device(content: &[u8]) -> (tokio::io::DuplexStream, Arc<TreeReader>) {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let options = ImportOptions {
            chunk_size: 10,
            block_size: 512,
            compress: true,
        };
        let receipt = import(
            store.clone(),
            b"repo key",
            b"unlock",
            options,
            vec![Ok(Section::Data(Bytes::copy_from_slice(content)))],
            |_| {},
        )
        .await
        .unwrap();
        let reader = Arc::new(
            TreeReader::open(store, receipt.intro_address, b"unlock", 8)
                .await
                .unwrap(),
        );
        let (client, server) = tokio::io::duplex(1 << 20);
        let loop_reader = reader.clone();
        tokio::spawn(async move {
            let _ = request_loop(server, &loop_reader).await;
        });
        (client, reader)
    }

    async fn read_reply(client: &mut tokio::io::DuplexStream, payload_len: usize) -> (Reply, Vec<u8>) {
        let mut header = [0u8; REPLY_LEN];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], &NBD_REPLY_MAGIC.to_be_bytes());
        let error = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&header[8..16]);
        let mut payload = vec![0u8; if error == 0 { payload_len } else { 0 }];
        client.read_exact(&mut payload).await.unwrap();
        (Reply { error, handle }, payload)
    }

    #[tokio::test]
    async fn read_requests_are_served_in_order() {
        let content: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let (mut client, _reader) = serve_device(&content).await;

        for (i, offset) in [0u64, 1024, 512].iter().enumerate() {
            let request = Request {
                cmd: NBD_CMD_READ,
                handle: [i as u8; 8],
                offset: *offset,
                length: 256,
            };
            client.write_all(&request.encode()).await.unwrap();
        }
        for (i, offset) in [0usize, 1024, 512].iter().enumerate() {
            let (reply, payload) = read_reply(&mut client, 256).await;
            assert_eq!(reply.error, 0);
            assert_eq!(reply.handle, [i as u8; 8]);
            assert_eq!(payload, content[*offset..offset + 256]);
        }
    }

    #[tokio::test]
    async fn failed_read_returns_error_and_keeps_serving() {
        let content = vec![7u8; 2048];
        let (mut client, _reader) = serve_device(&content).await;

        // Past the end of the device.
        let bad = Request {
            cmd: NBD_CMD_READ,
            handle: *b"badread0",
            offset: 1 << 32,
            length: 512,
        };
        client.write_all(&bad.encode()).await.unwrap();
        let (reply, _) = read_reply(&mut client, 0).await;
        assert_eq!(reply.error, libc::EINVAL as u32);

        // The connection is still alive.
        let good = Request {
            cmd: NBD_CMD_READ,
            handle: *b"goodread",
            offset: 0,
            length: 512,
        };
        client.write_all(&good.encode()).await.unwrap();
        let (reply, payload) = read_reply(&mut client, 512).await;
        assert_eq!(reply.error, 0);
        assert_eq!(payload, vec![7u8; 512]);
    }

    #[tokio::test]
    async fn disconnect_ends_the_loop() {
        let (mut client, _reader) = serve_device(&[1u8; 512]).await;
        let disc = Request {
            cmd: NBD_CMD_DISC,
            handle: [0; 8],
            offset: 0,
            length: 0,
        };
        client.write_all(&disc.encode()).await.unwrap();
        // The serving task exits; the peer closes without replying.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
