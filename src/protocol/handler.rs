//! Server side of the transfer state machine.
//!
//! One call to [`handle_connection`] serves exactly one command:
//!
//! ```text
//! WRITE: command -> READY | ERROR -> frames -> end marker -> ack
//! GET:   command -> READY frames end marker | ERROR
//! RM:    command -> SUCCESS | ERROR
//! ```

use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};
use crate::protocol::framing::{self, Framing};
use crate::protocol::parser::{Command, Parser, Permission, Response};
use crate::protocol::session::Session;
use crate::storage::{self, FileTree, PartFile};

/// Serve one command on `stream`, then return. The caller closes the stream.
pub async fn handle_connection<S>(
    stream: S,
    tree: Arc<FileTree>,
    transfer: TransferConfig,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(stream, transfer.io_timeout);

    // Reference clients send the command without a terminator
    let unterminated = transfer.framing == Framing::Sentinel;
    let Some(line) = session.read_command(unterminated).await? else {
        debug!("Connection closed before a command arrived");
        return Ok(());
    };

    let command = match Parser::parse(&line) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Parse error");
            session.send(&Response::for_parse_error(&e)).await?;
            return Err(e.into());
        }
    };
    info!(%command, "Received command");

    match command {
        Command::Write {
            remote, permission, ..
        } => handle_write(&mut session, &tree, transfer, &remote, permission).await,
        Command::Get { remote, .. } => handle_get(&mut session, &tree, transfer, &remote).await,
        Command::Rm { remote } => handle_rm(&mut session, &tree, &remote).await,
    }
}

async fn handle_write<S>(
    session: &mut Session<S>,
    tree: &FileTree,
    transfer: TransferConfig,
    remote: &str,
    permission: Permission,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dest = match tree.resolve(remote) {
        Ok(dest) => dest,
        Err(e) => return reject(session, &Response::error(&e.to_string()), e.into()).await,
    };
    let _guard = tree.lock_exclusive(&dest).await;

    if let Err(e) = tree.prepare_parent(&dest).await {
        return reject(session, &Response::error(&e.to_string()), e.into()).await;
    }
    if storage::is_directory(&dest).await {
        let err = TransferError::resource(
            &dest,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "destination is a directory"),
        );
        return reject(session, &Response::error("Destination is a directory"), err).await;
    }
    if storage::is_read_only(&dest).await {
        let err = TransferError::resource(
            &dest,
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "file is read-only"),
        );
        return reject(session, Response::read_only(), err).await;
    }

    let part = PartFile::beside(&dest);
    let mut file = match File::create(&part.path).await {
        Ok(file) => file,
        Err(e) => {
            let err = TransferError::resource(&part.path, e);
            return reject(session, &Response::error("Failed to open file"), err).await;
        }
    };
    debug!(path = %dest.display(), "Receiving upload");

    session.send(Response::ready()).await?;
    let stored = async {
        let bytes = framing::recv_payload(
            session,
            transfer.framing,
            &mut file,
            &part.path,
            transfer.chunk_size,
        )
        .await?;

        file.sync_all()
            .await
            .map_err(|e| TransferError::resource(&part.path, e))?;
        drop(file);
        storage::apply_permission(&part.path, permission)
            .await
            .map_err(|e| TransferError::resource(&part.path, e))?;
        part.commit(&dest)
            .await
            .map_err(|e| TransferError::resource(&dest, e))?;
        Ok::<_, TransferError>(bytes)
    }
    .await;

    match stored {
        Ok(bytes) => {
            info!(remote, bytes, %permission, "Upload complete");
            session.send(Response::transfer_complete()).await
        }
        // The peer is still connected and waiting for an acknowledgment
        Err(e @ TransferError::Resource { .. }) => {
            reject(session, &Response::error("Failed to store file"), e).await
        }
        Err(e) => Err(e),
    }
}

async fn handle_get<S>(
    session: &mut Session<S>,
    tree: &FileTree,
    transfer: TransferConfig,
    remote: &str,
) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = match tree.resolve(remote) {
        Ok(path) => path,
        Err(e) => return reject(session, &Response::error(&e.to_string()), e.into()).await,
    };
    let _guard = tree.lock_shared(&path).await;

    let source = match tree.confine_existing(&path).await {
        Ok(source) => source,
        Err(e) => return reject(session, &Response::error(&e.to_string()), e.into()).await,
    };
    let mut file = match open_regular_file(&source).await {
        Ok(file) => file,
        Err(e) => {
            let err = TransferError::resource(&source, e);
            return reject(session, Response::not_found(), err).await;
        }
    };

    session.send(Response::ready()).await?;
    let bytes = framing::send_payload(
        session,
        transfer.framing,
        &mut file,
        &source,
        transfer.chunk_size,
    )
    .await?;
    session.shutdown().await?;

    info!(remote, bytes, "Download complete");
    Ok(())
}

async fn open_regular_file(path: &Path) -> std::io::Result<File> {
    let file = File::open(path).await?;
    if !file.metadata().await?.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    Ok(file)
}

async fn handle_rm<S>(session: &mut Session<S>, tree: &FileTree, remote: &str) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = match tree.resolve(remote) {
        Ok(path) => path,
        Err(e) => return reject(session, Response::delete_failed(), e.into()).await,
    };
    let _guard = tree.lock_exclusive(&path).await;

    if let Err(e) = tree.confine_parent(&path).await {
        return reject(session, Response::delete_failed(), e.into()).await;
    }
    match tree.delete(&path).await {
        Ok(()) => {
            info!(remote, "Deleted");
            session.send(Response::deleted()).await
        }
        Err(e) => {
            reject(
                session,
                Response::delete_failed(),
                TransferError::resource(&path, e),
            )
            .await
        }
    }
}

/// Send an error line, then end the session with `err`.
async fn reject<S>(session: &mut Session<S>, line: &[u8], err: TransferError) -> TransferResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(error = %err, "Request refused");
    session.send(line).await?;
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::{Frame, SENTINEL};
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    async fn tree() -> (TempDir, Arc<FileTree>) {
        let dir = TempDir::new().unwrap();
        let tree = FileTree::open(dir.path(), 0o755, false).await.unwrap();
        (dir, tree)
    }

    fn transfer(framing: Framing) -> TransferConfig {
        TransferConfig {
            framing,
            ..TransferConfig::default()
        }
    }

    #[tokio::test]
    async fn test_write_length_prefixed() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"WRITE local.txt sub/dir/remote.txt -rw\n")
            .write(b"READY\n")
            .read(b"\x00\x00\x00\x05hello\x00\x00\x00\x00")
            .write(b"File transfer complete\n")
            .build();

        handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed))
            .await
            .unwrap();

        let stored = tree.root().join("sub/dir/remote.txt");
        assert_eq!(std::fs::read(&stored).unwrap(), b"hello");
        assert!(!tree.root().join("sub/dir/.remote.txt.part").exists());
    }

    #[tokio::test]
    async fn test_write_empty_file() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"WRITE a empty.bin\n")
            .write(b"READY\n")
            .read(b"\x00\x00\x00\x00")
            .write(b"File transfer complete\n")
            .build();

        handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed))
            .await
            .unwrap();
        assert_eq!(
            std::fs::metadata(tree.root().join("empty.bin")).unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn test_write_sentinel_unterminated_command() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"WRITE local.txt legacy.txt")
            .write(b"READY\n")
            .read(b"some data")
            .read(SENTINEL)
            .write(b"File transfer complete\n")
            .build();

        handle_connection(mock, Arc::clone(&tree), transfer(Framing::Sentinel))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(tree.root().join("legacy.txt")).unwrap(),
            b"some data"
        );
    }

    #[tokio::test]
    async fn test_write_read_only_flag() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"WRITE a locked.txt -r\n")
            .write(b"READY\n")
            .read(b"\x00\x00\x00\x01x\x00\x00\x00\x00")
            .write(b"File transfer complete\n")
            .build();
        handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed))
            .await
            .unwrap();

        let stored = tree.root().join("locked.txt");
        assert!(storage::is_read_only(&stored).await);

        // A second upload to the same name is refused and leaves the file alone
        let mock = Builder::new()
            .read(b"WRITE a locked.txt -rw\n")
            .write(b"ERROR: File is read-only\n")
            .build();
        let result =
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed)).await;
        assert!(matches!(result, Err(TransferError::Resource { .. })));
        assert_eq!(std::fs::read(&stored).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_write_interrupted_keeps_previous_content() {
        let (_dir, tree) = tree().await;
        std::fs::write(tree.root().join("keep.txt"), b"original").unwrap();

        let mock = Builder::new()
            .read(b"WRITE a keep.txt\n")
            .write(b"READY\n")
            .read(b"\x00\x00\x00\x03new")
            .build();
        let result =
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed)).await;

        assert!(matches!(result, Err(TransferError::ProtocolViolation(_))));
        assert_eq!(
            std::fs::read(tree.root().join("keep.txt")).unwrap(),
            b"original"
        );
        assert!(!tree.root().join(".keep.txt.part").exists());
    }

    #[tokio::test]
    async fn test_write_onto_directory_refused() {
        let (_dir, tree) = tree().await;
        std::fs::create_dir(tree.root().join("target")).unwrap();

        let mock = Builder::new()
            .read(b"WRITE a target\n")
            .write(b"ERROR: Destination is a directory\n")
            .build();
        let result =
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed)).await;
        assert!(matches!(result, Err(TransferError::Resource { .. })));
        assert!(tree.root().join("target").is_dir());
    }

    #[tokio::test]
    async fn test_write_store_failure_after_ready() {
        let (_dir, tree) = tree().await;
        let (client, server) = duplex(64 * 1024);
        let handler = tokio::spawn(handle_connection(
            server,
            Arc::clone(&tree),
            transfer(Framing::LengthPrefixed),
        ));

        let mut session = Session::new(client, None);
        session.send(b"WRITE a target\n").await.unwrap();
        assert_eq!(&session.read_line().await.unwrap()[..], b"READY\n");

        // The destination turns into a directory while the payload is in flight
        std::fs::create_dir(tree.root().join("target")).unwrap();
        framing::send_frame(&mut session, Framing::LengthPrefixed, b"payload")
            .await
            .unwrap();
        framing::send_end(&mut session, Framing::LengthPrefixed)
            .await
            .unwrap();

        assert_eq!(
            &session.read_line().await.unwrap()[..],
            b"ERROR: Failed to store file\n"
        );
        assert!(matches!(
            handler.await.unwrap(),
            Err(TransferError::Resource { .. })
        ));
        assert!(tree.root().join("target").is_dir());
        assert!(!tree.root().join(".target.part").exists());
    }

    #[tokio::test]
    async fn test_write_sentinel_marker_coalesced() {
        let (_dir, tree) = tree().await;
        let (client, server) = duplex(64 * 1024);
        let handler = tokio::spawn(handle_connection(
            server,
            Arc::clone(&tree),
            transfer(Framing::Sentinel),
        ));

        let mut session = Session::new(client, None);
        session.send(b"WRITE a joined.txt -rw\n").await.unwrap();
        assert_eq!(&session.read_line().await.unwrap()[..], b"READY\n");
        session.send(b"payload then markerDONE\n").await.unwrap();
        session.shutdown().await.unwrap();

        assert_eq!(
            &session.read_line().await.unwrap()[..],
            b"File transfer complete\n"
        );
        handler.await.unwrap().unwrap();
        assert_eq!(
            std::fs::read(tree.root().join("joined.txt")).unwrap(),
            b"payload then marker"
        );
    }

    #[tokio::test]
    async fn test_write_escape_refused() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"WRITE a ../../etc/evil\n")
            .write(b"ERROR: remote path escapes the server root: ../../etc/evil\n")
            .build();
        let result =
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed)).await;
        assert!(matches!(result, Err(TransferError::Path(_))));
    }

    #[tokio::test]
    async fn test_write_too_few_tokens() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"WRITE lonely\n")
            .write(b"Invalid command format. Use: WRITE <local-file> <remote-file> [-r|-rw]\n")
            .build();
        let result =
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed)).await;
        assert!(matches!(result, Err(TransferError::Parse(_))));
        // Nothing was resolved or created
        assert_eq!(std::fs::read_dir(tree.root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"LIST /\n")
            .write(b"ERROR: Unsupported command\n")
            .build();
        let result = handle_connection(mock, tree, transfer(Framing::LengthPrefixed)).await;
        assert!(matches!(result, Err(TransferError::Parse(_))));
    }

    #[tokio::test]
    async fn test_get_streams_file() {
        let (_dir, tree) = tree().await;
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(tree.root().join("big.bin"), &content).unwrap();

        let (client, server) = duplex(64 * 1024);
        let handler = tokio::spawn(handle_connection(
            server,
            Arc::clone(&tree),
            transfer(Framing::LengthPrefixed),
        ));

        let mut session = Session::new(client, None);
        session.send(b"GET big.bin out.bin\n").await.unwrap();
        assert_eq!(&session.read_line().await.unwrap()[..], b"READY\n");

        let mut received = Vec::new();
        let mut frames = 0;
        loop {
            match framing::recv_frame(&mut session, Framing::LengthPrefixed, 8192)
                .await
                .unwrap()
            {
                Some(Frame::Data(data)) => {
                    assert!(data.len() <= 8192);
                    received.extend_from_slice(&data);
                    frames += 1;
                }
                Some(Frame::End) => break,
                None => panic!("stream ended early"),
            }
        }
        handler.await.unwrap().unwrap();
        assert_eq!(received, content);
        assert_eq!(frames, 3);
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"GET nope.txt local.txt\n")
            .write(b"ERROR: File not found\n")
            .build();
        let result = handle_connection(mock, tree, transfer(Framing::LengthPrefixed)).await;
        assert!(matches!(result, Err(TransferError::Resource { .. })));
    }

    #[tokio::test]
    async fn test_get_directory_refused() {
        let (_dir, tree) = tree().await;
        std::fs::create_dir(tree.root().join("folder")).unwrap();
        let mock = Builder::new()
            .read(b"GET folder local\n")
            .write(b"ERROR: File not found\n")
            .build();
        assert!(
            handle_connection(mock, tree, transfer(Framing::LengthPrefixed))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_rm_existing_and_missing() {
        let (_dir, tree) = tree().await;
        std::fs::write(tree.root().join("gone.txt"), b"").unwrap();
        std::fs::create_dir(tree.root().join("emptydir")).unwrap();

        for name in ["gone.txt", "emptydir"] {
            let line = format!("RM {name}\n");
            let mock = Builder::new()
                .read(line.as_bytes())
                .write(b"SUCCESS: File or folder deleted\n")
                .build();
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed))
                .await
                .unwrap();
            assert!(!tree.root().join(name).exists());
        }

        let mock = Builder::new()
            .read(b"RM gone.txt\n")
            .write(b"ERROR: Failed to delete file or folder\n")
            .build();
        assert!(
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_rm_root_refused() {
        let (_dir, tree) = tree().await;
        let mock = Builder::new()
            .read(b"RM .\n")
            .write(b"ERROR: Failed to delete file or folder\n")
            .build();
        assert!(
            handle_connection(mock, Arc::clone(&tree), transfer(Framing::LengthPrefixed))
                .await
                .is_err()
        );
        assert!(tree.root().is_dir());
    }

    #[tokio::test]
    async fn test_closed_before_command() {
        let (_dir, tree) = tree().await;
        let (mut client, server) = duplex(64);
        client.shutdown().await.unwrap();
        handle_connection(server, tree, transfer(Framing::LengthPrefixed))
            .await
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
