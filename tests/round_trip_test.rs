//! End-to-end share and receive between Parcel nodes over localhost

use parcel_core::{
    publish, retrieve, BlobFormat, Materialization, NoProgress, Node, NodeConfig, ParcelError,
    PublishMode, PublishOptions, RetrieveOptions, Retrieved,
};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

fn loopback() -> NodeConfig {
    NodeConfig {
        listen_addr: Ipv4Addr::LOCALHOST,
        ..NodeConfig::default()
    }
}

/// Relative path and content of every file below `root`
fn tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                out.push((relative, std::fs::read(&path).unwrap()));
            }
        }
    }

    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

async fn share_and_receive(
    source: &Path,
    destination: &Path,
    publish_options: &PublishOptions,
) -> Result<Retrieved, Box<dyn std::error::Error>> {
    let provider = Node::start(&loopback()).await?;
    let fetcher = Node::start(&loopback()).await?;

    let published = publish(provider.engine(), source, publish_options).await?;
    let ticket = published.ticket.to_string();
    tracing::info!("Ticket: {}", ticket);

    let retrieved = timeout(
        TRANSFER_TIMEOUT,
        retrieve(
            fetcher.engine(),
            &ticket,
            destination,
            &RetrieveOptions::default(),
            &mut NoProgress,
        ),
    )
    .await??;
    assert_eq!(retrieved.hash, published.hash);
    assert_eq!(retrieved.format, published.format);

    fetcher.shutdown().await;
    provider.shutdown().await;
    Ok(retrieved)
}

#[tokio::test]
async fn test_two_nodes_transfer_file() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dir = TempDir::new()?;
    let source = dir.path().join("report.pdf");
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source, &content)?;

    let destination = dir.path().join("received.pdf");
    let retrieved = share_and_receive(&source, &destination, &PublishOptions::default()).await?;

    assert_eq!(retrieved.format, BlobFormat::Raw);
    assert_eq!(std::fs::read(&destination)?, content);
    Ok(())
}

#[tokio::test]
async fn test_two_nodes_transfer_empty_file() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dir = TempDir::new()?;
    let source = dir.path().join("empty");
    std::fs::write(&source, b"")?;

    let destination = dir.path().join("empty.out");
    share_and_receive(&source, &destination, &PublishOptions::default()).await?;

    assert_eq!(std::fs::metadata(&destination)?.len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_two_nodes_transfer_directory() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dir = TempDir::new()?;
    let source = dir.path().join("bundle");
    std::fs::create_dir_all(source.join("nested"))?;
    std::fs::write(source.join("ten.txt"), vec![b'x'; 10])?;
    std::fs::write(source.join("nested/zero.txt"), b"")?;
    std::fs::write(source.join("nested/mebibyte.bin"), vec![7u8; 1_048_576])?;

    let destination = dir.path().join("out");
    let retrieved = share_and_receive(&source, &destination, &PublishOptions::default()).await?;
    assert_eq!(retrieved.format, BlobFormat::Collection);

    // Directories are wrapped in a collection named after them
    assert_eq!(tree(&destination.join("bundle")), tree(&source));
    let sizes: Vec<u64> = tree(&source)
        .iter()
        .map(|(_, data)| data.len() as u64)
        .collect();
    assert_eq!(sizes, vec![1_048_576, 0, 10]);
    Ok(())
}

#[tokio::test]
async fn test_two_nodes_transfer_empty_directory() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dir = TempDir::new()?;
    let source = dir.path().join("nothing");
    std::fs::create_dir(&source)?;

    let destination = dir.path().join("out");
    let retrieved = share_and_receive(&source, &destination, &PublishOptions::default()).await?;

    assert_eq!(retrieved.format, BlobFormat::Collection);
    assert_eq!(retrieved.bytes_written, 0);
    assert!(destination.is_dir());
    assert!(tree(&destination).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_streamed_file_without_wrap() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dir = TempDir::new()?;
    let source = dir.path().join("notes.md");
    std::fs::write(&source, b"# streamed")?;

    let options = PublishOptions {
        mode: PublishMode::Stream,
        in_place: false,
        wrap: false,
    };
    let destination = dir.path().join("notes.out");
    let retrieved = share_and_receive(&source, &destination, &options).await?;

    assert_eq!(retrieved.format, BlobFormat::Raw);
    assert_eq!(std::fs::read(&destination)?, b"# streamed");
    Ok(())
}

#[tokio::test]
async fn test_single_node_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dir = TempDir::new()?;
    let source = dir.path().join("photos");
    std::fs::create_dir(&source)?;
    std::fs::write(source.join("a.jpg"), b"jpeg bytes")?;

    let node = Node::start(&loopback()).await?;
    let published = publish(node.engine(), &source, &PublishOptions::default()).await?;

    let destination = dir.path().join("copy");
    let retrieved = retrieve(
        node.engine(),
        &published.ticket.to_string(),
        &destination,
        &RetrieveOptions::default(),
        &mut NoProgress,
    )
    .await?;

    assert_eq!(retrieved.materialization, Materialization::Export);
    assert_eq!(
        std::fs::read(destination.join("photos/a.jpg"))?,
        b"jpeg bytes"
    );

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_truncated_ticket_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let source = dir.path().join("f");
    std::fs::write(&source, b"content")?;

    let node = Node::start(&loopback()).await?;
    let published = publish(node.engine(), &source, &PublishOptions::default()).await?;
    let ticket = published.ticket.to_string();

    let truncated = &ticket[..ticket.len() / 2];
    let result = retrieve(
        node.engine(),
        truncated,
        &dir.path().join("out"),
        &RetrieveOptions::default(),
        &mut NoProgress,
    )
    .await;

    assert!(matches!(result, Err(ParcelError::InvalidTicket(_))));
    assert!(!dir.path().join("out").exists());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_durable_node_keeps_content() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let source = dir.path().join("f");
    std::fs::write(&source, b"survives restarts")?;

    let config = NodeConfig {
        persistent: true,
        data_dir: dir.path().join("data"),
        ..loopback()
    };

    let options = PublishOptions {
        in_place: false,
        ..PublishOptions::default()
    };
    let node = Node::start(&config).await?;
    let hash = publish(node.engine(), &source, &options).await?.hash;
    node.shutdown().await;

    let node = Node::start(&config).await?;
    assert!(parcel_core::BlobEngine::list_blobs(node.engine())
        .await?
        .contains(&hash));
    node.shutdown().await;
    Ok(())
}
